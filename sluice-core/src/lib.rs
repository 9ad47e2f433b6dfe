//! Partitioned export of ordered query results.
//!
//! Rows pulled from a [`RowSource`] are split into partitions by a
//! [`BoundaryClassifier`], serialized to CSV, normalized to bytes and streamed
//! into one object per partition. A partition's upload keeps running after the
//! next partition opens; the run completes once every upload has settled.

pub mod boundary;
pub mod config;
pub mod error;
pub mod event;
pub mod naming;
pub mod normalizer;
pub mod partition;
pub mod pipeline;
pub mod row;
pub mod serializer;
pub mod sink;
pub mod source;
pub mod state;
pub mod upload;

pub use boundary::{BoundaryClassifier, BoundaryKey, Classification, ColumnBoundary};
pub use config::{PipelineOptions, UploadFailurePolicy};
pub use error::{PipelineError, Stage};
pub use event::{EventEmitter, PipelineEvent, ProgressReporter};
pub use naming::{NamingTemplate, ObjectKey, SequentialKeyGenerator, UuidKeyGenerator};
pub use normalizer::TextEncoding;
pub use partition::{PartitionId, PartitionState, PartitionSummary};
pub use pipeline::{Pipeline, PipelineBuilder, RunSummary, RunningPipeline};
pub use row::{Row, RowSchema, Value};
pub use serializer::{CsvSerializer, HeaderMode};
pub use source::{MemorySource, RowSource, RowStream};
pub use state::PipelineState;
pub use upload::{ByteStream, ObjectUploader, UploadReceipt};
