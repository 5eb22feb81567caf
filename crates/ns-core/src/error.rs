//! Error types for the NextStat systematics engine

use thiserror::Error;

/// NextStat error type
#[derive(Error, Debug)]
pub enum Error {
    /// I/O error
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON parsing error
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    /// YAML parsing error
    #[error("YAML error: {0}")]
    Yaml(#[from] serde_yaml_ng::Error),

    /// Fatal configuration error, raised before the event loop starts
    /// (unknown systematic, malformed variable, inconsistent options).
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Caller broke an API precondition (e.g. lookup of an unregistered key).
    #[error("Precondition violated: {0}")]
    Precondition(String),

    /// Validation error
    #[error("Validation error: {0}")]
    Validation(String),
}

/// Result type alias
pub type Result<T> = std::result::Result<T, Error>;
