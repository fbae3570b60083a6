//! Error types for the Rampart engine.

use std::time::Duration;

use thiserror::Error;

use crate::mesh::ClusterError;

/// Main error type for Rampart operations.
///
/// Only construction and backend plumbing produce these. `RateLimitService::check`
/// never returns one to its caller.
#[derive(Error, Debug)]
pub enum RampartError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// Distributed counter backend failures
    #[error("Backend error: {0}")]
    Backend(String),

    /// A backend call did not answer in time
    #[error("Backend timed out after {0:?}")]
    Timeout(Duration),

    /// A detection rule could not evaluate its statistics
    #[error("Detection error: {0}")]
    Detection(String),

    /// Gossip cluster errors
    #[error("Cluster error: {0}")]
    Cluster(#[from] ClusterError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for RampartError {
    fn from(err: config::ConfigError) -> Self {
        RampartError::Config(err.to_string())
    }
}

/// Result type alias for Rampart operations.
pub type Result<T> = std::result::Result<T, RampartError>;
