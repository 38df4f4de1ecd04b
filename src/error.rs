//! Error types for the Keygate service.

use thiserror::Error;

/// Main error type for Keygate operations.
#[derive(Error, Debug)]
pub enum KeygateError {
    /// Configuration-related errors
    #[error("Configuration error: {0}")]
    Config(String),

    /// The request was rejected by the adaptive limiter.
    #[error("Rate limit exceeded, retry after {retry_after_ms}ms")]
    RateLimited {
        /// Delay the caller should wait before retrying, in milliseconds
        retry_after_ms: u64,
    },

    /// The request could not be interpreted
    #[error("Invalid request: {0}")]
    InvalidRequest(String),

    /// Durable store failures
    #[error("Storage error: {0}")]
    Storage(String),

    /// Counter arithmetic would leave the i64 range
    #[error("Counter overflow for key {key}")]
    Overflow { key: String },

    /// I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// JSON encoding errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

impl KeygateError {
    /// Retry delay in seconds, if this is a rate limit rejection.
    pub fn retry_after_secs(&self) -> Option<f64> {
        match self {
            KeygateError::RateLimited { retry_after_ms } => Some(*retry_after_ms as f64 / 1000.0),
            _ => None,
        }
    }

    /// Whether the error came from the durable store rather than the limiter.
    pub fn is_storage_failure(&self) -> bool {
        matches!(
            self,
            KeygateError::Storage(_)
                | KeygateError::Overflow { .. }
                | KeygateError::Io(_)
                | KeygateError::Json(_)
        )
    }
}

/// Result type alias for Keygate operations.
pub type Result<T> = std::result::Result<T, KeygateError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_retry_after_secs() {
        let err = KeygateError::RateLimited { retry_after_ms: 1500 };
        assert_eq!(err.retry_after_secs(), Some(1.5));
        assert!(!err.is_storage_failure());
    }

    #[test]
    fn test_storage_failure_kinds() {
        assert!(KeygateError::Storage("disk".into()).is_storage_failure());
        assert!(KeygateError::Overflow { key: "k".into() }.is_storage_failure());
        assert!(!KeygateError::Config("bad".into()).is_storage_failure());
        assert!(!KeygateError::InvalidRequest("amount".into()).is_storage_failure());
        assert_eq!(KeygateError::Config("bad".into()).retry_after_secs(), None);
    }
}
