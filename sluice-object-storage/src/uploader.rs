use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use object_store::{path::Path, MultipartUpload, ObjectStore, PutPayload};
use sluice_core::{
    error::UploadError, upload::ObjectUploader, ByteStream, ObjectKey, ProgressReporter,
    UploadReceipt,
};
use tokio::task::{JoinError, JoinSet};
use tokio_util::sync::CancellationToken;

/// S3 rejects multipart parts smaller than 5 MiB, except the last one.
pub const DEFAULT_PART_SIZE: usize = 5 * 1024 * 1024;
pub const DEFAULT_MAX_CONCURRENT_PARTS: usize = 4;

fn store_error(e: object_store::Error) -> UploadError {
    UploadError::Store(Box::new(e))
}

/// Streams partitions into an [`ObjectStore`].
///
/// Bodies smaller than one part are written with a single `put`. Larger ones
/// go through a multipart upload that is only completed once the body ends,
/// so a cancelled or failed partition never becomes visible.
#[derive(Debug, Clone)]
pub struct ObjectStoreUploader {
    store: Arc<dyn ObjectStore>,
    prefix: String,
    part_size: usize,
    max_concurrent_parts: usize,
}

impl ObjectStoreUploader {
    pub fn new(store: Arc<dyn ObjectStore>) -> Self {
        Self {
            store,
            prefix: String::new(),
            part_size: DEFAULT_PART_SIZE,
            max_concurrent_parts: DEFAULT_MAX_CONCURRENT_PARTS,
        }
    }

    pub fn with_prefix(mut self, prefix: impl Into<String>) -> Self {
        self.prefix = prefix.into().trim_matches('/').to_string();
        self
    }

    pub fn with_part_size(mut self, part_size: usize) -> Self {
        self.part_size = part_size.max(1);
        self
    }

    pub fn with_max_concurrent_parts(mut self, max: usize) -> Self {
        self.max_concurrent_parts = max.max(1);
        self
    }

    pub fn location(&self, key: &ObjectKey) -> Path {
        if self.prefix.is_empty() {
            Path::from(key.as_str())
        } else {
            Path::from(format!("{}/{}", self.prefix, key.as_str()))
        }
    }

    async fn stream_parts(
        &self,
        key: &ObjectKey,
        location: &Path,
        body: &mut ByteStream,
        progress: &ProgressReporter,
        writer: &mut Option<PartWriter>,
    ) -> Result<UploadReceipt, UploadError> {
        let mut buffer = BytesMut::new();
        let mut total = 0u64;

        loop {
            // Settle parts as they land while waiting for the next chunk.
            let chunk = match writer.as_mut() {
                Some(w) if !w.pending.is_empty() => tokio::select! {
                    chunk = body.next_chunk() => chunk,
                    Some(done) = w.pending.join_next() => {
                        w.settle(done, progress)?;
                        continue;
                    }
                },
                _ => body.next_chunk().await,
            };
            let Some(chunk) = chunk else {
                break;
            };
            total += chunk.len() as u64;
            buffer.extend_from_slice(&chunk);

            while buffer.len() >= self.part_size {
                let part = buffer.split_to(self.part_size).freeze();
                if writer.is_none() {
                    tracing::debug!("Starting multipart upload of {}", location);
                    let upload = self
                        .store
                        .put_multipart(location)
                        .await
                        .map_err(store_error)?;
                    *writer = Some(PartWriter::new(upload));
                }
                if let Some(w) = writer.as_mut() {
                    w.push(part, self.max_concurrent_parts, progress).await?;
                }
            }
        }

        let Some(w) = writer.as_mut() else {
            let result = self
                .store
                .put(location, PutPayload::from(buffer.freeze()))
                .await
                .map_err(store_error)?;
            progress.report(total);
            tracing::debug!("Put {} ({} bytes)", location, total);
            return Ok(UploadReceipt {
                object_key: key.clone(),
                bytes: total,
                parts: 1,
                e_tag: result.e_tag,
            });
        };

        if !buffer.is_empty() {
            w.push(buffer.freeze(), self.max_concurrent_parts, progress)
                .await?;
        }
        w.flush(progress).await?;
        let result = w.upload.complete().await.map_err(store_error)?;
        let parts = w.parts;
        *writer = None;

        tracing::debug!(
            "Completed multipart upload of {} ({} bytes in {} parts)",
            location,
            total,
            parts
        );
        Ok(UploadReceipt {
            object_key: key.clone(),
            bytes: total,
            parts,
            e_tag: result.e_tag,
        })
    }
}

/// An open multipart upload with a bounded number of parts in flight.
///
/// Every part is sent on its own task as soon as it is pushed.
struct PartWriter {
    upload: Box<dyn MultipartUpload>,
    pending: JoinSet<object_store::Result<u64>>,
    parts: usize,
    persisted: u64,
}

impl PartWriter {
    fn new(upload: Box<dyn MultipartUpload>) -> Self {
        Self {
            upload,
            pending: JoinSet::new(),
            parts: 0,
            persisted: 0,
        }
    }

    async fn push(
        &mut self,
        part: Bytes,
        max_in_flight: usize,
        progress: &ProgressReporter,
    ) -> Result<(), UploadError> {
        while self.pending.len() >= max_in_flight {
            self.wait_one(progress).await?;
        }
        let len = part.len() as u64;
        let put = self.upload.put_part(PutPayload::from(part));
        self.pending.spawn(async move { put.await.map(|_| len) });
        self.parts += 1;
        Ok(())
    }

    fn settle(
        &mut self,
        done: Result<object_store::Result<u64>, JoinError>,
        progress: &ProgressReporter,
    ) -> Result<(), UploadError> {
        let len = done
            .map_err(|e| UploadError::Task(e.to_string()))?
            .map_err(store_error)?;
        self.persisted += len;
        progress.report(self.persisted);
        Ok(())
    }

    async fn wait_one(&mut self, progress: &ProgressReporter) -> Result<(), UploadError> {
        match self.pending.join_next().await {
            Some(done) => self.settle(done, progress),
            None => Ok(()),
        }
    }

    async fn flush(&mut self, progress: &ProgressReporter) -> Result<(), UploadError> {
        while !self.pending.is_empty() {
            self.wait_one(progress).await?;
        }
        Ok(())
    }

    async fn abort(mut self) {
        self.pending.shutdown().await;
        if let Err(e) = self.upload.abort().await {
            tracing::warn!("Failed to abort multipart upload: {}", e);
        }
    }
}

#[async_trait::async_trait]
impl ObjectUploader for ObjectStoreUploader {
    async fn upload(
        &self,
        key: ObjectKey,
        mut body: ByteStream,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadReceipt, UploadError> {
        let location = self.location(&key);
        let mut writer = None;

        let result = tokio::select! {
            biased;
            _ = cancel.cancelled() => Err(UploadError::Aborted),
            result = self.stream_parts(&key, &location, &mut body, &progress, &mut writer) => result,
        };

        if result.is_err() {
            if let Some(writer) = writer.take() {
                tracing::debug!("Aborting multipart upload of {}", location);
                writer.abort().await;
            }
        }
        result
    }
}
