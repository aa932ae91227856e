//! Error types for Rampart.

use thiserror::Error;

/// Main error type for Rampart operations.
#[derive(Error, Debug)]
pub enum RampartError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A configuration value violated an invariant
    #[error("Invalid configuration for '{name}': {field} {reason}")]
    InvalidConfig {
        name: String,
        field: &'static str,
        reason: String,
    },

    /// Rate limit store errors
    #[error("Rate limit store error: {0}")]
    Store(#[from] StoreError),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl RampartError {
    pub(crate) fn invalid(name: &str, field: &'static str, reason: impl Into<String>) -> Self {
        RampartError::InvalidConfig {
            name: name.to_string(),
            field,
            reason: reason.into(),
        }
    }
}

impl From<config::ConfigError> for RampartError {
    fn from(err: config::ConfigError) -> Self {
        RampartError::Config(err.to_string())
    }
}

/// Errors raised by a [`RateLimitStore`](crate::ratelimit::RateLimitStore).
///
/// The in-process store never produces these; networked stores do.
#[derive(Error, Debug)]
pub enum StoreError {
    /// The backing store could not be reached
    #[error("store unavailable: {0}")]
    Unavailable(String),

    /// A stored value could not be encoded or decoded
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),
}

/// Result type alias for Rampart operations.
pub type Result<T> = std::result::Result<T, RampartError>;
