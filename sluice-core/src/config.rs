use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::{
    naming::DEFAULT_NAMING_TEMPLATE, normalizer::TextEncoding, serializer::HeaderMode,
};

/// What a failed upload means for the rest of the run.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum UploadFailurePolicy {
    /// Abort every open upload and fail the run.
    #[default]
    Abort,
    /// Report the partition as failed and keep streaming.
    Continue,
}

impl FromStr for UploadFailurePolicy {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "abort" => Ok(UploadFailurePolicy::Abort),
            "continue" | "skip" => Ok(UploadFailurePolicy::Continue),
            other => Err(format!("Unsupported upload failure policy: {}", other)),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineOptions {
    pub naming_template: String,
    pub text_encoding: TextEncoding,
    pub header_mode: HeaderMode,
    /// Chunks buffered per partition before the row flow waits on its upload.
    pub channel_capacity: usize,
    pub upload_failure_policy: UploadFailurePolicy,
}

impl Default for PipelineOptions {
    fn default() -> Self {
        Self {
            naming_template: DEFAULT_NAMING_TEMPLATE.to_string(),
            text_encoding: TextEncoding::default(),
            header_mode: HeaderMode::default(),
            channel_capacity: 64,
            upload_failure_policy: UploadFailurePolicy::default(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deserializes_partial_options() {
        let options: PipelineOptions = serde_json::from_str(
            r#"{ "header_mode": "per-partition", "text_encoding": "latin1", "upload_failure_policy": "continue" }"#,
        )
        .unwrap();

        assert_eq!(options.header_mode, HeaderMode::PerPartition);
        assert_eq!(options.text_encoding, TextEncoding::Latin1);
        assert_eq!(options.upload_failure_policy, UploadFailurePolicy::Continue);
        assert_eq!(options.naming_template, "{id}.csv");
        assert_eq!(options.channel_capacity, 64);
    }
}
