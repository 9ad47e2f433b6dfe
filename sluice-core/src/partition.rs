use std::fmt::Display;

use serde::Serialize;

use crate::{boundary::BoundaryKey, naming::ObjectKey};

/// Identifies a partition within a run.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
pub struct PartitionId {
    pub index: usize,
    pub object_key: ObjectKey,
}

impl Display for PartitionId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "partition #{} ({})", self.index, self.object_key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum PartitionState {
    /// Current destination, receiving bytes.
    Open,
    /// Detached from the byte stream, end-of-data signalled.
    Sealed,
    /// Sealed, with the run waiting on its upload to confirm.
    Uploading,
    Done,
    Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct PartitionSummary {
    pub id: PartitionId,
    pub boundary_key: Option<BoundaryKey>,
    pub state: PartitionState,
    pub rows: u64,
    pub bytes_written: u64,
    /// Bytes the store confirmed, when the upload completed.
    pub bytes_uploaded: Option<u64>,
    pub error: Option<String>,
}

impl PartitionSummary {
    pub(crate) fn open(id: PartitionId, boundary_key: Option<BoundaryKey>) -> Self {
        Self {
            id,
            boundary_key,
            state: PartitionState::Open,
            rows: 0,
            bytes_written: 0,
            bytes_uploaded: None,
            error: None,
        }
    }
}
