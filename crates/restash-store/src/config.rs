//! Configuration for the store and the manager

use std::fmt;
use std::sync::Arc;
use std::time::Duration;

use restash_core::{CacheError, Result};

/// Callback invoked for every recoverable error.
pub type ErrorCallback = Arc<dyn Fn(&CacheError) + Send + Sync>;

pub(crate) fn default_error_callback() -> ErrorCallback {
    Arc::new(|error| tracing::error!(%error, "cache operation failed"))
}

/// Per-entry body ceiling applied when none is configured.
pub const DEFAULT_MAX_ENTRY_SIZE: usize = 5 * 1024 * 1024;

const DEFAULT_URL: &str = "redis://127.0.0.1:6379";
const DEFAULT_CONNECTION_TIMEOUT: Duration = Duration::from_secs(5);

/// Configuration for [`crate::RedisCacheStore`].
#[derive(Clone)]
pub struct RedisCacheStoreConfig {
    /// Redis connection URL (e.g. "redis://127.0.0.1:6379").
    pub url: String,
    /// Prefix applied to every backend key; may be empty.
    pub key_prefix: String,
    /// Connection timeout for the data connection.
    pub connection_timeout: Duration,
    /// Per-entry body ceiling in bytes; larger responses are skipped.
    pub max_entry_size: usize,
    /// Lowercase response header carrying comma-separated cache tags.
    pub cache_tags_header: Option<String>,
    /// Mirror reads in the in-process tracking cache, kept coherent through
    /// server-assisted invalidation pushes.
    pub tracking: bool,
    /// Tracking cache entry bound.
    pub tracking_max_count: usize,
    /// Tracking cache body-byte bound.
    pub tracking_max_size: usize,
    /// Invoked for every recoverable error; logs at error level by default.
    pub on_error: Option<ErrorCallback>,
}

impl Default for RedisCacheStoreConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            key_prefix: String::new(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            max_entry_size: DEFAULT_MAX_ENTRY_SIZE,
            cache_tags_header: None,
            tracking: true,
            tracking_max_count: usize::MAX,
            tracking_max_size: usize::MAX,
            on_error: None,
        }
    }
}

impl RedisCacheStoreConfig {
    /// Create new config with URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set key prefix
    pub fn prefix(mut self, prefix: impl Into<String>) -> Self {
        self.key_prefix = prefix.into();
        self
    }

    /// Set per-entry body ceiling
    pub fn max_entry_size(mut self, bytes: usize) -> Self {
        self.max_entry_size = bytes;
        self
    }

    /// Set the response header carrying cache tags
    pub fn cache_tags_header(mut self, header: impl Into<String>) -> Self {
        self.cache_tags_header = Some(header.into());
        self
    }

    /// Disable the in-process tracking cache
    pub fn no_tracking(mut self) -> Self {
        self.tracking = false;
        self
    }

    /// Bound the tracking cache
    pub fn tracking_bounds(mut self, max_count: usize, max_size: usize) -> Self {
        self.tracking_max_count = max_count;
        self.tracking_max_size = max_size;
        self
    }

    /// Set the recoverable-error callback
    pub fn on_error(mut self, callback: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(CacheError::InvalidOption("url must not be empty".into()));
        }
        if self.max_entry_size == 0 {
            return Err(CacheError::InvalidOption(
                "max_entry_size must be greater than zero".into(),
            ));
        }
        if let Some(header) = &self.cache_tags_header {
            if header.is_empty() || header.chars().any(|c| c.is_ascii_uppercase()) {
                return Err(CacheError::InvalidOption(
                    "cache_tags_header must be a lowercase header name".into(),
                ));
            }
        }
        Ok(())
    }

    pub(crate) fn error_callback(&self) -> ErrorCallback {
        self.on_error.clone().unwrap_or_else(default_error_callback)
    }
}

impl fmt::Debug for RedisCacheStoreConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheStoreConfig")
            .field("url", &self.url)
            .field("key_prefix", &self.key_prefix)
            .field("connection_timeout", &self.connection_timeout)
            .field("max_entry_size", &self.max_entry_size)
            .field("cache_tags_header", &self.cache_tags_header)
            .field("tracking", &self.tracking)
            .field("tracking_max_count", &self.tracking_max_count)
            .field("tracking_max_size", &self.tracking_max_size)
            .field("on_error", &self.on_error.as_ref().map(|_| "custom"))
            .finish()
    }
}

/// Configuration for [`crate::RedisCacheManager`].
#[derive(Clone)]
pub struct RedisCacheManagerConfig {
    /// Redis connection URL.
    pub url: String,
    /// Connection timeout for the data connection.
    pub connection_timeout: Duration,
    /// Invoked for every recoverable error; logs at error level by default.
    pub on_error: Option<ErrorCallback>,
}

impl Default for RedisCacheManagerConfig {
    fn default() -> Self {
        Self {
            url: DEFAULT_URL.to_string(),
            connection_timeout: DEFAULT_CONNECTION_TIMEOUT,
            on_error: None,
        }
    }
}

impl RedisCacheManagerConfig {
    /// Create new config with URL
    pub fn new(url: impl Into<String>) -> Self {
        Self {
            url: url.into(),
            ..Default::default()
        }
    }

    /// Set the recoverable-error callback
    pub fn on_error(mut self, callback: impl Fn(&CacheError) + Send + Sync + 'static) -> Self {
        self.on_error = Some(Arc::new(callback));
        self
    }

    pub(crate) fn validate(&self) -> Result<()> {
        if self.url.is_empty() {
            return Err(CacheError::InvalidOption("url must not be empty".into()));
        }
        Ok(())
    }

    pub(crate) fn error_callback(&self) -> ErrorCallback {
        self.on_error.clone().unwrap_or_else(default_error_callback)
    }
}

impl fmt::Debug for RedisCacheManagerConfig {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("RedisCacheManagerConfig")
            .field("url", &self.url)
            .field("connection_timeout", &self.connection_timeout)
            .field("on_error", &self.on_error.as_ref().map(|_| "custom"))
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_defaults() {
        let config = RedisCacheStoreConfig::default();
        assert_eq!(config.url, DEFAULT_URL);
        assert_eq!(config.key_prefix, "");
        assert_eq!(config.max_entry_size, DEFAULT_MAX_ENTRY_SIZE);
        assert!(config.tracking);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = RedisCacheStoreConfig::new("redis://cache:6379")
            .prefix("app:")
            .max_entry_size(1024)
            .cache_tags_header("cache-tag")
            .no_tracking()
            .tracking_bounds(100, 1 << 20);
        assert_eq!(config.key_prefix, "app:");
        assert_eq!(config.max_entry_size, 1024);
        assert_eq!(config.cache_tags_header.as_deref(), Some("cache-tag"));
        assert!(!config.tracking);
        assert_eq!(config.tracking_max_count, 100);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_validate_rejects_bad_options() {
        assert!(RedisCacheStoreConfig::new("").validate().is_err());
        assert!(RedisCacheStoreConfig::default()
            .max_entry_size(0)
            .validate()
            .is_err());
        assert!(RedisCacheStoreConfig::default()
            .cache_tags_header("Cache-Tag")
            .validate()
            .is_err());
        assert!(RedisCacheManagerConfig::new("").validate().is_err());
    }
}
