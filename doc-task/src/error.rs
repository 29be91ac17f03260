//! Error types for the task engine.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while loading or validating a session configuration.
///
/// These abort startup, either directly or wrapped in `GeneratorError`.
#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("failed to load configuration: {0}")]
    Load(#[from] config::ConfigError),
    #[error("invalid value for `{field}`: {reason}")]
    Invalid { field: &'static str, reason: String },
}

impl ConfigError {
    pub(crate) fn invalid(field: &'static str, reason: impl Into<String>) -> Self {
        Self::Invalid {
            field,
            reason: reason.into(),
        }
    }
}

/// Errors raised by trial generators.
#[derive(Debug, Error)]
pub enum GeneratorError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error("trial parameter `{name}` must be {expected}, got {found}")]
    InvalidParam {
        name: String,
        expected: &'static str,
        found: String,
    },
    #[error("failed to read trial sequence {path}: {source}")]
    SequenceIo {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse trial sequence {path}: {source}")]
    SequenceFormat {
        path: PathBuf,
        #[source]
        source: serde_json::Error,
    },
}

/// Errors raised by trial sinks.
#[derive(Debug, Error)]
pub enum SinkError {
    #[error("trial sink i/o failed: {0}")]
    Io(#[from] std::io::Error),
    #[error("failed to encode trial record: {0}")]
    Encode(#[from] serde_json::Error),
}
