//! Error types for the Tollgate limiter.

use std::time::Duration;

use thiserror::Error;

use crate::ratelimit::Category;

/// Main error type for Tollgate operations.
#[derive(Error, Debug)]
pub enum TollgateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// A policy table entry that can never admit or never reset
    #[error("Invalid policy for category {category}: {reason}")]
    InvalidPolicy {
        category: Category,
        reason: String,
    },

    /// Errors returned by the shared counter store
    #[error("Store error: {0}")]
    Store(#[from] redis::RedisError),

    /// The shared counter store did not answer within the latency budget
    #[error("Store timed out after {0:?}")]
    StoreTimeout(Duration),

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl From<config::ConfigError> for TollgateError {
    fn from(err: config::ConfigError) -> Self {
        TollgateError::Config(err.to_string())
    }
}

/// Result type alias for Tollgate operations.
pub type Result<T> = std::result::Result<T, TollgateError>;
