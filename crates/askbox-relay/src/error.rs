//! Error types for the relay.

use thiserror::Error;

/// Relay errors.
///
/// Routing misses are not errors: delivering to an offline user is a normal
/// outcome reported through [`crate::RouteOutcome`].
#[derive(Debug, Error)]
pub enum RelayError {
    /// A frame could not be decoded as JSON
    #[error("Malformed frame: {0}")]
    Json(#[from] serde_json::Error),

    /// A frame decoded but carried invalid content
    #[error("Invalid frame: {0}")]
    InvalidFrame(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),
}

impl RelayError {
    /// Create a new invalid frame error.
    pub fn invalid_frame(msg: impl Into<String>) -> Self {
        Self::InvalidFrame(msg.into())
    }

    /// Create a new configuration error.
    pub fn config(msg: impl Into<String>) -> Self {
        Self::Config(msg.into())
    }
}
