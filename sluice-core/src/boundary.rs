//! Row-by-row partition boundary detection.
//!
//! A [`BoundaryClassifier`] maps each row to a [`Classification`]; the
//! [`BoundaryDetector`] compares the outcome with the key of the partition that
//! is currently open and hands back an explicit [`RotationRequest`] whenever a
//! new partition has to start. The detector never talks to the sink itself.

use std::{fmt::Display, sync::Arc};

use serde::Serialize;

use crate::{error::ClassifierError, row::Row};

/// Classification shared by every row of one partition.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize)]
#[serde(transparent)]
pub struct BoundaryKey(String);

impl BoundaryKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for BoundaryKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for BoundaryKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Classification {
    /// The row belongs to whatever partition is currently open.
    Unchanged,
    /// The row belongs to the partition identified by this key.
    Key(BoundaryKey),
}

/// Caller-supplied boundary function.
///
/// `previous` is the key of the partition that is currently open, `None`
/// before the first row.
pub trait BoundaryClassifier: Send + Sync {
    fn classify(
        &self,
        row: &Row,
        previous: Option<&BoundaryKey>,
    ) -> Result<Classification, ClassifierError>;
}

impl<F> BoundaryClassifier for F
where
    F: Fn(&Row, Option<&BoundaryKey>) -> Result<Classification, ClassifierError> + Send + Sync,
{
    fn classify(
        &self,
        row: &Row,
        previous: Option<&BoundaryKey>,
    ) -> Result<Classification, ClassifierError> {
        self(row, previous)
    }
}

/// Starts a new partition whenever the value of one column changes.
///
/// Null values classify as the empty key.
#[derive(Debug, Clone)]
pub struct ColumnBoundary {
    column: String,
}

impl ColumnBoundary {
    pub fn new(column: impl Into<String>) -> Self {
        Self {
            column: column.into(),
        }
    }
}

impl BoundaryClassifier for ColumnBoundary {
    fn classify(
        &self,
        row: &Row,
        _previous: Option<&BoundaryKey>,
    ) -> Result<Classification, ClassifierError> {
        let value = row
            .get(&self.column)
            .ok_or_else(|| ClassifierError::MissingColumn(self.column.clone()))?;
        Ok(Classification::Key(BoundaryKey::new(value.to_string())))
    }
}

/// Request to seal the current partition and open the next one.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RotationRequest {
    pub previous: Option<BoundaryKey>,
    pub next: Option<BoundaryKey>,
}

/// A row on its way downstream, plus the rotation it triggered (if any).
#[derive(Debug)]
pub struct Detected {
    pub row: Row,
    pub rotation: Option<RotationRequest>,
}

pub struct BoundaryDetector {
    classifier: Arc<dyn BoundaryClassifier>,
    current: Option<BoundaryKey>,
    started: bool,
}

impl BoundaryDetector {
    pub fn new(classifier: Arc<dyn BoundaryClassifier>) -> Self {
        Self {
            classifier,
            current: None,
            started: false,
        }
    }

    /// Key of the partition currently open.
    pub fn current(&self) -> Option<&BoundaryKey> {
        self.current.as_ref()
    }

    /// Classify `row` against the key of the open partition.
    ///
    /// The first row always yields a rotation. On error the detector state is
    /// left untouched.
    pub fn observe(&mut self, row: Row) -> Result<Detected, ClassifierError> {
        let classification = self.classifier.classify(&row, self.current.as_ref())?;

        let next = match classification {
            Classification::Unchanged => self.current.clone(),
            Classification::Key(key) => Some(key),
        };

        let rotation = if !self.started || next != self.current {
            Some(RotationRequest {
                previous: self.current.take(),
                next: next.clone(),
            })
        } else {
            None
        };

        self.started = true;
        self.current = next;
        Ok(Detected { row, rotation })
    }
}
