//! Error types for the toil job queue library.

use thiserror::Error;

/// The main error type for the toil library.
#[derive(Error, Debug)]
pub enum ToilError {
    /// JSON serialization/deserialization error.
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Engine misconfiguration, e.g. running before handlers are registered.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Backend-specific error.
    #[error("Backend error: {0}")]
    Backend(String),

    /// Operation not supported by this backend.
    #[error("Unsupported operation: {0}")]
    Unsupported(&'static str),
}

/// Result type alias using ToilError.
pub type Result<T> = std::result::Result<T, ToilError>;
