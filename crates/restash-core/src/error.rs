//! Error types for cache operations

use thiserror::Error;

/// Main error type for all cache operations
#[derive(Error, Debug, Clone)]
pub enum CacheError {
    /// Invalid construction option
    #[error("invalid option: {0}")]
    InvalidOption(String),

    /// Invalid argument passed to an operation
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// A backend key did not parse as any known key family
    #[error("invalid cache key: {0}")]
    InvalidKey(String),

    /// Backend connection failed
    #[error("connection error: {0}")]
    Connection(String),

    /// Backend operation failed
    #[error("backend error: {0}")]
    Backend(String),

    /// Serialization failed
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Deserialization failed
    #[error("deserialization error: {0}")]
    Deserialization(String),

    /// Response body exceeded the per-entry ceiling; the write is skipped
    #[error("entry size {size} exceeds maximum {max}")]
    EntryTooLarge { size: usize, max: usize },

    /// Keyspace notification subscription could not be established
    #[error("subscription error: {0}")]
    Subscription(String),
}

/// Result type alias for cache operations
pub type Result<T> = std::result::Result<T, CacheError>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_display() {
        let err = CacheError::InvalidKey("bogus".to_string());
        assert_eq!(err.to_string(), "invalid cache key: bogus");

        let err = CacheError::EntryTooLarge { size: 20, max: 10 };
        assert_eq!(err.to_string(), "entry size 20 exceeds maximum 10");

        let err = CacheError::Subscription("notify-keyspace-events".to_string());
        assert_eq!(err.to_string(), "subscription error: notify-keyspace-events");
    }

    #[test]
    fn test_error_clone() {
        let err = CacheError::Connection("refused".to_string());
        let cloned = err.clone();
        assert_eq!(err.to_string(), cloned.to_string());
    }
}
