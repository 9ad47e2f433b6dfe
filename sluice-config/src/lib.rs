use envconfig::Envconfig;
use sluice_core::{HeaderMode, PipelineOptions, TextEncoding, UploadFailurePolicy};
use sluice_object_storage::{error::StorageError, StoreTarget};

#[derive(Debug, Envconfig)]
pub struct Config {
    #[envconfig(from = "SLUICE_LOG_LEVEL", default = "info")]
    pub log_level: String,

    /// `memory://`, `s3://<bucket>` or a local directory.
    #[envconfig(from = "SLUICE_STORE", default = "./data/exports")]
    pub store: String,
    /// Prepended to every object key.
    #[envconfig(from = "SLUICE_PREFIX", default = "")]
    pub prefix: String,
    #[envconfig(from = "SLUICE_S3_ENDPOINT")]
    pub s3_endpoint: Option<String>,
    #[envconfig(from = "SLUICE_S3_REGION")]
    pub s3_region: Option<String>,
    #[envconfig(from = "SLUICE_S3_ALLOW_HTTP", default = "false")]
    pub s3_allow_http: bool,

    #[envconfig(from = "SLUICE_NAMING_TEMPLATE", default = "{id}.csv")]
    pub naming_template: String,
    #[envconfig(from = "SLUICE_TEXT_ENCODING", default = "utf-8")]
    pub text_encoding: TextEncoding,
    #[envconfig(from = "SLUICE_HEADER_MODE", default = "per-run")]
    pub header_mode: HeaderMode,
    #[envconfig(from = "SLUICE_UPLOAD_FAILURE_POLICY", default = "abort")]
    pub upload_failure_policy: UploadFailurePolicy,
    #[envconfig(from = "SLUICE_CHANNEL_CAPACITY", default = "64")]
    pub channel_capacity: usize,

    /// Multipart part size in bytes.
    #[envconfig(from = "SLUICE_PART_SIZE", default = "5242880")]
    pub part_size: usize,
    #[envconfig(from = "SLUICE_MAX_CONCURRENT_PARTS", default = "4")]
    pub max_concurrent_parts: usize,
}

impl Config {
    pub fn load() -> Result<Config, envconfig::Error> {
        Config::init_from_env()
    }

    pub fn pipeline_options(&self) -> PipelineOptions {
        PipelineOptions {
            naming_template: self.naming_template.clone(),
            text_encoding: self.text_encoding,
            header_mode: self.header_mode,
            channel_capacity: self.channel_capacity,
            upload_failure_policy: self.upload_failure_policy,
        }
    }

    pub fn store_target(&self) -> Result<StoreTarget, StorageError> {
        Ok(self
            .store
            .parse::<StoreTarget>()?
            .with_endpoint(self.s3_endpoint.clone())
            .with_region(self.s3_region.clone())
            .with_allow_http(self.s3_allow_http))
    }
}
