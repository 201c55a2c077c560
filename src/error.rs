//! Error taxonomy shared by every pipeline stage.
//!
//! Per-item errors are reported to the aggregator and never change control
//! flow. Fatal errors are raised at their origin and end the run.

use std::path::PathBuf;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PipelineError {
    #[error("could not find a numeric value: {0}")]
    NonNumeric(String),

    #[error("performance data is not a 1, 4 or 5 part \";\" separated value: {0}")]
    MalformedPerfData(String),

    #[error("performance data found without a key=value format: {0}")]
    NotPerfData(String),

    #[error("{kind} block has unparsable {key} timestamp {value:?}")]
    BadTimestamp {
        kind: String,
        key: &'static str,
        value: String,
    },

    #[error("{kind} block has no {key} timestamp")]
    MissingTimestamp { kind: String, key: &'static str },

    #[error("{kind} block produced an empty identity")]
    EmptyIdentity { kind: String },

    #[error("{kind} block has a line without key=value format: {line:?}")]
    MalformedLine { kind: String, line: String },

    #[error("block {kind:?} was never closed; {lines} lines dropped")]
    UnterminatedBlock { kind: String, lines: usize },

    #[error("failed to open {path}: {source}")]
    FileOpen {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to read {path}: {source}")]
    FileRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to write point {identity}: {message}")]
    SinkWrite { identity: String, message: String },

    #[error("watch error: {0}")]
    Watch(String),

    #[error("parent directory {path} of the input could not be inspected or is not a directory")]
    WatchDirectory { path: PathBuf },

    #[error("metadata block has no usable created timestamp: {0}")]
    MetadataTimestamp(String),

    #[error("failed to re-register watch on {path} after {attempts} attempts: {message}")]
    WatchRegistration {
        path: PathBuf,
        attempts: u32,
        message: String,
    },
}

impl PipelineError {
    /// Stable label used for log fields and metric labels.
    pub fn kind(&self) -> &'static str {
        match self {
            PipelineError::NonNumeric(_) => "non_numeric",
            PipelineError::MalformedPerfData(_) => "malformed_perf_data",
            PipelineError::NotPerfData(_) => "not_perf_data",
            PipelineError::BadTimestamp { .. } => "bad_timestamp",
            PipelineError::MissingTimestamp { .. } => "missing_timestamp",
            PipelineError::EmptyIdentity { .. } => "empty_identity",
            PipelineError::MalformedLine { .. } => "malformed_line",
            PipelineError::UnterminatedBlock { .. } => "unterminated_block",
            PipelineError::FileOpen { .. } => "file_open",
            PipelineError::FileRead { .. } => "file_read",
            PipelineError::SinkWrite { .. } => "sink_write",
            PipelineError::Watch(_) => "watch",
            PipelineError::WatchDirectory { .. } => "watch_directory",
            PipelineError::MetadataTimestamp(_) => "metadata_timestamp",
            PipelineError::WatchRegistration { .. } => "watch_registration",
        }
    }

    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            PipelineError::WatchDirectory { .. }
                | PipelineError::MetadataTimestamp(_)
                | PipelineError::WatchRegistration { .. }
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn only_setup_and_registration_failures_are_fatal() {
        assert!(PipelineError::MetadataTimestamp("x".into()).is_fatal());
        assert!(PipelineError::WatchDirectory {
            path: PathBuf::from("/nope")
        }
        .is_fatal());
        assert!(!PipelineError::NonNumeric("abc".into()).is_fatal());
        assert!(!PipelineError::EmptyIdentity {
            kind: "foo".into()
        }
        .is_fatal());
    }

    #[test]
    fn kind_labels_are_snake_case() {
        let err = PipelineError::SinkWrite {
            identity: "web01".into(),
            message: "boom".into(),
        };
        assert_eq!(err.kind(), "sink_write");
        assert!(err.to_string().contains("web01"));
    }
}
