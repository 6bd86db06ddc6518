//! Error types for the Floodgate limiter.

use thiserror::Error;

/// Main error type for Floodgate operations.
#[derive(Error, Debug)]
pub enum FloodgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A rule failed validation at registration time
    #[error("Invalid rule: {0}")]
    InvalidRule(String),

    /// A rule references an algorithm this limiter does not implement
    #[error("Unknown algorithm: {0}")]
    UnknownAlgorithm(String),

    /// Counter store unreachable or failed
    #[error("Counter store error: {0}")]
    Store(String),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Floodgate operations.
pub type Result<T> = std::result::Result<T, FloodgateError>;
