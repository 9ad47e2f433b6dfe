//! Object key generation.
//!
//! A [`KeyGenerator`] supplies a unique id per partition and a
//! [`NamingTemplate`] turns it into the final object key, e.g. `{id}.csv` or
//! `exports/{key}/{index}-{id}.csv`.

use std::fmt::Display;

use serde::{Deserialize, Serialize};

use crate::{boundary::BoundaryKey, error::PipelineError};

pub const DEFAULT_NAMING_TEMPLATE: &str = "{id}.csv";

/// Location of one partition object in the store.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ObjectKey(String);

impl ObjectKey {
    pub fn new(key: impl Into<String>) -> Self {
        Self(key.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl Display for ObjectKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for ObjectKey {
    fn from(key: &str) -> Self {
        Self::new(key)
    }
}

pub trait KeyGenerator: Send {
    fn generate(&mut self) -> String;
}

impl<F> KeyGenerator for F
where
    F: FnMut() -> String + Send,
{
    fn generate(&mut self) -> String {
        self()
    }
}

/// Time ordered UUID v7 ids.
#[derive(Debug, Clone, Copy, Default)]
pub struct UuidKeyGenerator;

impl KeyGenerator for UuidKeyGenerator {
    fn generate(&mut self) -> String {
        uuid::Uuid::now_v7().to_string()
    }
}

/// Deterministic `prefix-000001`, `prefix-000002`, ... ids.
#[derive(Debug, Clone)]
pub struct SequentialKeyGenerator {
    prefix: String,
    next: u64,
}

impl SequentialKeyGenerator {
    pub fn new(prefix: impl Into<String>) -> Self {
        Self {
            prefix: prefix.into(),
            next: 1,
        }
    }
}

impl KeyGenerator for SequentialKeyGenerator {
    fn generate(&mut self) -> String {
        let id = format!("{}-{:06}", self.prefix, self.next);
        self.next += 1;
        id
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Segment {
    Literal(String),
    Id,
    Index,
    Key,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NamingTemplate {
    source: String,
    segments: Vec<Segment>,
}

impl NamingTemplate {
    /// Parse a template. Supported placeholders are `{id}`, `{index}` and `{key}`.
    ///
    /// At least one of `{id}` or `{index}` is required, otherwise two partitions
    /// could render to the same key.
    pub fn parse(template: &str) -> Result<Self, PipelineError> {
        let invalid = |reason: &str| {
            PipelineError::InvalidConfig(format!(
                "Invalid naming template {:?}: {}",
                template, reason
            ))
        };

        let mut segments = Vec::new();
        let mut literal = String::new();
        let mut chars = template.chars();
        while let Some(c) = chars.next() {
            match c {
                '{' => {
                    let mut name = String::new();
                    loop {
                        match chars.next() {
                            Some('}') => break,
                            Some('{') | None => return Err(invalid("unbalanced '{'")),
                            Some(c) => name.push(c),
                        }
                    }
                    let segment = match name.as_str() {
                        "id" => Segment::Id,
                        "index" => Segment::Index,
                        "key" => Segment::Key,
                        other => {
                            return Err(invalid(&format!("unknown placeholder {{{}}}", other)))
                        }
                    };
                    if !literal.is_empty() {
                        segments.push(Segment::Literal(std::mem::take(&mut literal)));
                    }
                    segments.push(segment);
                }
                '}' => return Err(invalid("unbalanced '}'")),
                c => literal.push(c),
            }
        }
        if !literal.is_empty() {
            segments.push(Segment::Literal(literal));
        }

        if !segments
            .iter()
            .any(|s| matches!(s, Segment::Id | Segment::Index))
        {
            return Err(invalid("template must contain {id} or {index}"));
        }

        Ok(Self {
            source: template.to_string(),
            segments,
        })
    }

    pub fn as_str(&self) -> &str {
        &self.source
    }

    /// Render the key for one partition. A missing boundary key renders empty.
    pub fn render(&self, id: &str, index: usize, key: Option<&BoundaryKey>) -> ObjectKey {
        let mut out = String::with_capacity(self.source.len() + id.len());
        for segment in &self.segments {
            match segment {
                Segment::Literal(text) => out.push_str(text),
                Segment::Id => out.push_str(id),
                Segment::Index => out.push_str(&index.to_string()),
                Segment::Key => {
                    if let Some(key) = key {
                        out.push_str(key.as_str());
                    }
                }
            }
        }
        ObjectKey(out)
    }
}

impl Default for NamingTemplate {
    fn default() -> Self {
        Self {
            source: DEFAULT_NAMING_TEMPLATE.to_string(),
            segments: vec![Segment::Id, Segment::Literal(".csv".to_string())],
        }
    }
}
