use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{error::SerializationError, row::Row};

/// Where header lines are written.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "kebab-case")]
pub enum HeaderMode {
    /// Once, in front of the first row of the run.
    #[default]
    PerRun,
    /// In front of the first row of every partition.
    PerPartition,
    None,
}

impl FromStr for HeaderMode {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "per-run" | "run" => Ok(HeaderMode::PerRun),
            "per-partition" | "partition" => Ok(HeaderMode::PerPartition),
            "none" | "off" => Ok(HeaderMode::None),
            other => Err(format!("Unsupported header mode: {}", other)),
        }
    }
}

/// Converts rows to delimited text. Implementations must be deterministic.
pub trait RecordSerializer: Send + Sync {
    /// Header line(s) describing `row`, if the format has one.
    fn header(&self, row: &Row) -> Result<Option<String>, SerializationError>;

    fn serialize(&self, row: &Row) -> Result<String, SerializationError>;
}

/// CSV serializer backed by the `csv` crate.
///
/// Every record ends with `\n` and fields are quoted only when necessary.
#[derive(Debug, Clone)]
pub struct CsvSerializer {
    delimiter: u8,
}

impl Default for CsvSerializer {
    fn default() -> Self {
        Self { delimiter: b',' }
    }
}

impl CsvSerializer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delimiter(mut self, delimiter: u8) -> Self {
        self.delimiter = delimiter;
        self
    }

    fn write_record<I, S>(&self, fields: I) -> Result<String, SerializationError>
    where
        I: IntoIterator<Item = S>,
        S: AsRef<[u8]>,
    {
        let mut writer = csv::WriterBuilder::new()
            .delimiter(self.delimiter)
            .terminator(csv::Terminator::Any(b'\n'))
            .has_headers(false)
            .from_writer(Vec::with_capacity(128));
        writer.write_record(fields)?;
        let buffer = writer
            .into_inner()
            .map_err(|e| SerializationError::Io(e.into_error()))?;
        Ok(String::from_utf8(buffer)?)
    }
}

impl RecordSerializer for CsvSerializer {
    fn header(&self, row: &Row) -> Result<Option<String>, SerializationError> {
        self.write_record(row.schema().columns()).map(Some)
    }

    fn serialize(&self, row: &Row) -> Result<String, SerializationError> {
        let expected = row.schema().len();
        if row.len() != expected {
            return Err(SerializationError::FieldCountMismatch {
                expected,
                found: row.len(),
            });
        }
        self.write_record(row.values().iter().map(|v| v.to_string()))
    }
}
