use serde::Serialize;

use crate::{
    naming::ObjectKey, normalizer::TextEncoding, partition::PartitionId, state::PipelineState,
};

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

#[derive(Debug, thiserror::Error)]
pub enum SourceError {
    #[error("Failed to connect to row source: {0}")]
    Connect(BoxError),
    #[error("Query failed: {0}")]
    Query(BoxError),
    #[error("Failed to decode row: {0}")]
    Decode(String),
}

#[derive(Debug, thiserror::Error)]
pub enum ClassifierError {
    #[error("Boundary column {0} is missing from row")]
    MissingColumn(String),
    #[error("Boundary function failed: {0}")]
    Failed(String),
}

#[derive(Debug, thiserror::Error)]
pub enum SerializationError {
    #[error("Row has {found} fields but the header has {expected}")]
    FieldCountMismatch { expected: usize, found: usize },
    #[error("Failed to write CSV record: {0}")]
    Csv(#[from] csv::Error),
    #[error("Failed to flush CSV record: {0}")]
    Io(#[from] std::io::Error),
    #[error("Serialized record is not valid UTF-8: {0}")]
    Utf8(#[from] std::string::FromUtf8Error),
}

#[derive(Debug, thiserror::Error)]
pub enum EncodingError {
    #[error("Character {character:?} at offset {offset} cannot be encoded as {encoding}")]
    Unrepresentable {
        character: char,
        offset: usize,
        encoding: TextEncoding,
    },
}

#[derive(Debug, thiserror::Error)]
pub enum UploadError {
    #[error("Object store error: {0}")]
    Store(BoxError),
    #[error("Upload rejected: {0}")]
    Rejected(String),
    #[error("Upload was aborted")]
    Aborted,
    #[error("Upload task failed: {0}")]
    Task(String),
}

/// Pipeline stage an error originated from.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Source,
    Boundary,
    Serialization,
    Encoding,
    Upload,
    Pipeline,
}

impl std::fmt::Display for Stage {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let name = match self {
            Stage::Source => "source",
            Stage::Boundary => "boundary",
            Stage::Serialization => "serialization",
            Stage::Encoding => "encoding",
            Stage::Upload => "upload",
            Stage::Pipeline => "pipeline",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum PipelineError {
    #[error("Source error: {0}")]
    Source(#[from] SourceError),
    #[error("Boundary function failed on row {row}: {source}")]
    BoundaryFunction { row: u64, source: ClassifierError },
    #[error("Failed to serialize row {row}: {source}")]
    Serialization {
        row: u64,
        source: SerializationError,
    },
    #[error("Failed to encode row {row}: {source}")]
    Encoding { row: u64, source: EncodingError },
    #[error("Upload of {partition} failed: {source}")]
    Upload {
        partition: PartitionId,
        source: UploadError,
    },
    #[error("Object key {0} was already issued in this run")]
    DuplicateObjectKey(ObjectKey),
    #[error("No partition is open to receive bytes")]
    NoOpenPartition,
    #[error("Invalid pipeline state transition from {from} to {to}")]
    InvalidTransition {
        from: PipelineState,
        to: PipelineState,
    },
    #[error("Invalid configuration: {0}")]
    InvalidConfig(String),
    #[error("Run was cancelled")]
    Cancelled,
    #[error("Pipeline task failed: {0}")]
    Task(String),
}

impl PipelineError {
    pub fn stage(&self) -> Stage {
        match self {
            PipelineError::Source(_) => Stage::Source,
            PipelineError::BoundaryFunction { .. } => Stage::Boundary,
            PipelineError::Serialization { .. } => Stage::Serialization,
            PipelineError::Encoding { .. } => Stage::Encoding,
            PipelineError::Upload { .. } | PipelineError::DuplicateObjectKey(_) => Stage::Upload,
            PipelineError::NoOpenPartition
            | PipelineError::InvalidTransition { .. }
            | PipelineError::InvalidConfig(_)
            | PipelineError::Cancelled
            | PipelineError::Task(_) => Stage::Pipeline,
        }
    }

    /// The partition the failure is attributed to, if any.
    pub fn partition(&self) -> Option<&PartitionId> {
        match self {
            PipelineError::Upload { partition, .. } => Some(partition),
            _ => None,
        }
    }
}
