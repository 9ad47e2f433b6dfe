use std::{
    pin::Pin,
    sync::Arc,
    task::{Context, Poll},
};

use bytes::Bytes;
use futures::Stream;
use serde::Serialize;
use tokio::{sync::mpsc, task::JoinHandle};
use tokio_util::sync::CancellationToken;

use crate::{
    error::UploadError, event::ProgressReporter, naming::ObjectKey, partition::PartitionId,
};

/// Byte body of one partition. Ends once the partition is sealed.
#[derive(Debug)]
pub struct ByteStream {
    rx: mpsc::Receiver<Bytes>,
}

impl ByteStream {
    pub fn new(rx: mpsc::Receiver<Bytes>) -> Self {
        Self { rx }
    }

    /// Pre-filled, already sealed stream.
    pub fn from_chunks(chunks: Vec<Bytes>) -> Self {
        let (tx, rx) = mpsc::channel(chunks.len().max(1));
        for chunk in chunks {
            // capacity covers every chunk
            let _ = tx.try_send(chunk);
        }
        Self { rx }
    }

    pub async fn next_chunk(&mut self) -> Option<Bytes> {
        self.rx.recv().await
    }
}

impl Stream for ByteStream {
    type Item = Bytes;

    fn poll_next(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        self.rx.poll_recv(cx)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct UploadReceipt {
    pub object_key: ObjectKey,
    pub bytes: u64,
    pub parts: usize,
    pub e_tag: Option<String>,
}

/// Persists one byte stream under one key.
///
/// `upload` must consume `body` until it ends and only then make the object
/// visible. When `cancel` fires the write has to be abandoned, leaving no
/// object behind, and [`UploadError::Aborted`] returned.
#[async_trait::async_trait]
pub trait ObjectUploader: Send + Sync + std::fmt::Debug {
    async fn upload(
        &self,
        key: ObjectKey,
        body: ByteStream,
        progress: ProgressReporter,
        cancel: CancellationToken,
    ) -> Result<UploadReceipt, UploadError>;
}

/// One in-flight upload, running on its own task.
#[derive(Debug)]
pub struct UploadHandle {
    cancel: CancellationToken,
    task: JoinHandle<Result<UploadReceipt, UploadError>>,
    outcome: Option<Result<UploadReceipt, UploadError>>,
}

impl UploadHandle {
    pub fn spawn(
        uploader: Arc<dyn ObjectUploader>,
        partition: PartitionId,
        body: ByteStream,
        progress: ProgressReporter,
    ) -> Self {
        let cancel = CancellationToken::new();
        let task = tokio::spawn({
            let cancel = cancel.clone();
            let key = partition.object_key.clone();
            async move { uploader.upload(key, body, progress, cancel).await }
        });

        Self {
            cancel,
            task,
            outcome: None,
        }
    }

    pub fn abort(&self) {
        self.cancel.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.outcome.is_some() || self.task.is_finished()
    }

    /// Wait for the upload task to stop, keeping its outcome for [`join`](Self::join).
    ///
    /// Cancel safe: dropping the future loses nothing.
    pub async fn stopped(&mut self) {
        if self.outcome.is_none() {
            let outcome = match (&mut self.task).await {
                Ok(result) => result,
                Err(e) => Err(UploadError::Task(e.to_string())),
            };
            self.outcome = Some(outcome);
        }
    }

    pub async fn join(self) -> Result<UploadReceipt, UploadError> {
        if let Some(outcome) = self.outcome {
            return outcome;
        }
        match self.task.await {
            Ok(result) => result,
            Err(e) => Err(UploadError::Task(e.to_string())),
        }
    }
}
