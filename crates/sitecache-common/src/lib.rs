//! # sitecache common
//!
//! Shared error type, logging setup, and retry/timeout helpers used by the
//! offline worker, the network loader, and the command-line host.
//!
//! ## Features
//!
//! - Unified error type with categories for log fields
//! - Logging configuration and setup
//! - Retry with backoff, and deadline racing for network-first requests

use std::time::Duration;
use thiserror::Error;

pub mod logging;
pub mod retry;

pub use logging::{init_logging, LogConfig, LogFormat};
pub use retry::{retry_with_backoff, with_timeout, RetryConfig};

/// Unified error type for sitecache.
#[derive(Error, Debug)]
pub enum SiteCacheError {
    /// Network-related errors.
    #[error("Network error: {message}")]
    Network {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Cache storage errors (quota, snapshot encoding).
    #[error("Cache error: {message}")]
    Cache {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// Configuration errors.
    #[error("Config error: {message}")]
    Config {
        message: String,
        #[source]
        source: Option<Box<dyn std::error::Error + Send + Sync>>,
    },

    /// I/O errors.
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// Timeout errors.
    #[error("Operation timed out after {0:?}")]
    Timeout(Duration),

    /// Resource not found.
    #[error("Resource not found: {0}")]
    NotFound(String),

}

impl SiteCacheError {
    /// Create a network error.
    pub fn network(message: impl Into<String>) -> Self {
        Self::Network {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error.
    pub fn cache(message: impl Into<String>) -> Self {
        Self::Cache {
            message: message.into(),
            source: None,
        }
    }

    /// Create a cache error with source.
    pub fn cache_with_source<E: std::error::Error + Send + Sync + 'static>(
        message: impl Into<String>,
        source: E,
    ) -> Self {
        Self::Cache {
            message: message.into(),
            source: Some(Box::new(source)),
        }
    }

    /// Create a config error.
    pub fn config(message: impl Into<String>) -> Self {
        Self::Config {
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            SiteCacheError::Network { .. } | SiteCacheError::Timeout(_) | SiteCacheError::Io(_)
        )
    }

    /// Get the error category for log fields.
    pub fn category(&self) -> &'static str {
        match self {
            SiteCacheError::Network { .. } => "network",
            SiteCacheError::Cache { .. } => "cache",
            SiteCacheError::Config { .. } => "config",
            SiteCacheError::Io(_) => "io",
            SiteCacheError::Timeout(_) => "timeout",
            SiteCacheError::NotFound(_) => "not_found",
        }
    }
}

/// Result type alias for sitecache operations.
pub type Result<T> = std::result::Result<T, SiteCacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_categories() {
        assert_eq!(SiteCacheError::network("test").category(), "network");
        assert_eq!(SiteCacheError::cache("quota").category(), "cache");
        assert_eq!(
            SiteCacheError::Timeout(Duration::from_secs(5)).category(),
            "timeout"
        );
    }

    #[test]
    fn test_retryable() {
        assert!(SiteCacheError::network("test").is_retryable());
        assert!(SiteCacheError::Timeout(Duration::from_secs(1)).is_retryable());
        assert!(!SiteCacheError::cache("quota").is_retryable());
        assert!(!SiteCacheError::NotFound("offline.html".into()).is_retryable());
    }
}
