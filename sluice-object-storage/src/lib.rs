use std::{fmt::Display, path::PathBuf, str::FromStr, sync::Arc};

use object_store::{
    aws::AmazonS3Builder, local::LocalFileSystem, memory::InMemory, ObjectStore,
};

use crate::error::StorageError;

pub mod error;
pub mod uploader;

pub use uploader::ObjectStoreUploader;

/// Where partition objects are written.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StoreTarget {
    /// Directory on the local file system, created when missing.
    Local { root: PathBuf },
    S3 {
        bucket: String,
        endpoint: Option<String>,
        region: Option<String>,
        allow_http: bool,
    },
    Memory,
}

impl StoreTarget {
    pub fn with_endpoint(mut self, endpoint: Option<String>) -> Self {
        if let StoreTarget::S3 { endpoint: e, .. } = &mut self {
            *e = endpoint;
        }
        self
    }

    pub fn with_region(mut self, region: Option<String>) -> Self {
        if let StoreTarget::S3 { region: r, .. } = &mut self {
            *r = region;
        }
        self
    }

    pub fn with_allow_http(mut self, allow_http: bool) -> Self {
        if let StoreTarget::S3 { allow_http: a, .. } = &mut self {
            *a = allow_http;
        }
        self
    }
}

/// Accepts `memory://`, `s3://bucket`, `file:///some/dir` or a plain path.
impl FromStr for StoreTarget {
    type Err = StorageError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let s = s.trim();
        if s == "memory" || s == "memory://" {
            return Ok(StoreTarget::Memory);
        }
        if let Some(bucket) = s.strip_prefix("s3://") {
            let bucket = bucket.trim_end_matches('/');
            if bucket.is_empty() || bucket.contains('/') {
                return Err(StorageError::InvalidLocation(format!(
                    "Expected s3://<bucket>, got {}",
                    s
                )));
            }
            return Ok(StoreTarget::S3 {
                bucket: bucket.to_string(),
                endpoint: None,
                region: None,
                allow_http: false,
            });
        }
        let path = s.strip_prefix("file://").unwrap_or(s);
        if path.is_empty() {
            return Err(StorageError::InvalidLocation(
                "Store location is empty".to_string(),
            ));
        }
        Ok(StoreTarget::Local {
            root: PathBuf::from(path),
        })
    }
}

impl Display for StoreTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            StoreTarget::Local { root } => write!(f, "file://{}", root.display()),
            StoreTarget::S3 { bucket, .. } => write!(f, "s3://{}", bucket),
            StoreTarget::Memory => f.write_str("memory://"),
        }
    }
}

pub fn build_store(target: &StoreTarget) -> Result<Arc<dyn ObjectStore>, StorageError> {
    match target {
        StoreTarget::Local { root } => {
            tracing::info!("Using LocalFileSystem object store at {}", root.display());
            std::fs::create_dir_all(root).map_err(|e| {
                StorageError::InitializationError(format!(
                    "Failed to create {}: {}",
                    root.display(),
                    e
                ))
            })?;
            let store = LocalFileSystem::new_with_prefix(root)?;
            Ok(Arc::new(store))
        }
        StoreTarget::S3 {
            bucket,
            endpoint,
            region,
            allow_http,
        } => {
            tracing::info!("Using S3 object store for bucket {}", bucket);
            let mut builder = AmazonS3Builder::from_env()
                .with_bucket_name(bucket)
                .with_allow_http(*allow_http);
            if let Some(endpoint) = endpoint {
                builder = builder.with_endpoint(endpoint);
            }
            if let Some(region) = region {
                builder = builder.with_region(region);
            }
            let store = builder.build().map_err(|e| {
                StorageError::InitializationError(format!("Failed to build S3 object store: {}", e))
            })?;
            Ok(Arc::new(store))
        }
        StoreTarget::Memory => {
            tracing::info!("Using in-memory object store");
            Ok(Arc::new(InMemory::new()))
        }
    }
}
