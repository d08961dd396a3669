//! Error types for the Ratewarden limiter.

use std::time::Duration;
use thiserror::Error;

/// Main error type for Ratewarden operations.
///
/// Only configuration problems surface through this type. Store failures are
/// absorbed by the fail-open guard and a denied request is a decision, not an
/// error.
#[derive(Error, Debug)]
pub enum RatewardenError {
    /// Malformed or contradictory configuration
    #[error("Configuration error: {0}")]
    Config(String),

    /// Policy document could not be parsed
    #[error("Failed to parse policy document: {0}")]
    Yaml(#[from] serde_yaml::Error),

    /// Service settings could not be assembled from file and environment
    #[error("Settings error: {0}")]
    Settings(#[from] config::ConfigError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

/// Result type alias for Ratewarden operations.
pub type Result<T> = std::result::Result<T, RatewardenError>;

/// Failures talking to the shared window store.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The store returned an error or the connection failed
    #[error("Redis error: {0}")]
    Redis(#[from] redis::RedisError),

    /// The store did not answer within the guard's deadline
    #[error("Store call timed out after {0:?}")]
    Timeout(Duration),

    /// The store answered with something the adapter did not expect
    #[error("Unexpected store reply: {0}")]
    Protocol(String),
}
