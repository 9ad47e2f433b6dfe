use serde::Serialize;
use tokio::sync::mpsc;

use crate::{
    error::{PipelineError, Stage},
    naming::ObjectKey,
    partition::{PartitionId, PartitionSummary},
};

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct UploadProgress {
    pub partition: PartitionId,
    /// Cumulative bytes the store has accepted for this partition.
    pub bytes_transferred: u64,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ErrorEvent {
    pub stage: Stage,
    pub partition: Option<PartitionId>,
    pub message: String,
    /// Fatal errors end the run; non-fatal ones are reported per partition.
    pub fatal: bool,
}

impl ErrorEvent {
    /// `open` is the partition that was receiving bytes when the run failed.
    pub(crate) fn fatal(error: &PipelineError, open: Option<&PartitionId>) -> Self {
        Self {
            stage: error.stage(),
            partition: error.partition().or(open).cloned(),
            message: error.to_string(),
            fatal: true,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum PipelineEvent {
    Progress(UploadProgress),
    PartitionComplete(PartitionSummary),
    Error(ErrorEvent),
    Done { object_keys: Vec<ObjectKey> },
}

/// Sending half of a run's event channel.
///
/// Events are dropped silently when nobody listens.
#[derive(Debug, Clone, Default)]
pub struct EventEmitter {
    tx: Option<mpsc::UnboundedSender<PipelineEvent>>,
}

impl EventEmitter {
    pub fn channel() -> (Self, mpsc::UnboundedReceiver<PipelineEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (Self { tx: Some(tx) }, rx)
    }

    pub fn disabled() -> Self {
        Self { tx: None }
    }

    pub fn emit(&self, event: PipelineEvent) {
        if let Some(tx) = &self.tx {
            if tx.send(event).is_err() {
                tracing::trace!("Event receiver dropped, discarding event");
            }
        }
    }
}

/// Progress channel handed to an uploader, bound to one partition.
#[derive(Debug, Clone)]
pub struct ProgressReporter {
    partition: PartitionId,
    emitter: EventEmitter,
}

impl ProgressReporter {
    pub fn new(partition: PartitionId, emitter: EventEmitter) -> Self {
        Self { partition, emitter }
    }

    pub fn report(&self, bytes_transferred: u64) {
        self.emitter.emit(PipelineEvent::Progress(UploadProgress {
            partition: self.partition.clone(),
            bytes_transferred,
        }));
    }
}
