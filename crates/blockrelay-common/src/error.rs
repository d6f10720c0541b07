//! Error types for blockrelay

use thiserror::Error;

/// Result type alias for blockrelay operations
pub type Result<T> = std::result::Result<T, RelayError>;

/// Main error type shared across the workspace
#[derive(Error, Debug)]
pub enum RelayError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("Invalid block hash: {0}")]
    InvalidHash(String),

    #[error("Malformed block: {0}")]
    MalformedBlock(String),

    #[error("Unknown source: {0}")]
    UnknownSource(String),

    #[error("Configuration error: {0}")]
    Config(String),
}
