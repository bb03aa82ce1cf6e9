//! restash: a shared HTTP response cache backed by Redis
//!
//! restash persists full HTTP responses (status, headers, body chunks) keyed
//! by request identity, serves them back under `Vary` negotiation, and
//! invalidates them by key, by cache tag or by write-through. An optional
//! in-process tracking cache mirrors recently read entries and stays
//! coherent through the backend's invalidation pushes. Freshness policy is
//! deliberately out of scope: the store serves stale entries and leaves
//! `Cache-Control` interpretation to the HTTP interceptor driving it.
//!
//! # Quick Start
//!
//! ```rust,no_run
//! use restash::prelude::*;
//!
//! #[tokio::main]
//! async fn main() -> std::result::Result<(), Box<dyn std::error::Error>> {
//!     let store = RedisCacheStore::new(
//!         RedisCacheStoreConfig::new("redis://127.0.0.1:6379").prefix("app:"),
//!     )
//!     .await?;
//!
//!     let key = RequestKey::new("http://origin", "GET", "/resource");
//!     if let Some(hit) = store.get(&key).await? {
//!         println!("{} ({} body bytes)", hit.response.status_code, hit.body_size());
//!     }
//!
//!     store.delete_tags(["products"]).await?;
//!     store.close().await;
//!     Ok(())
//! }
//! ```

// Re-export core
pub use restash_core::*;

// Re-export store
pub use restash_store::{
    CacheWriteStream, ErrorCallback, ManagerEvent, RedisCacheManager, RedisCacheManagerConfig,
    RedisCacheStore, RedisCacheStoreConfig, StoreEvent, TagSelector,
};

/// Prelude for convenient imports
pub mod prelude {
    pub use crate::{
        CacheEntry, CacheError, CacheHit, CacheWriteStream, CachedResponse, HeaderValue, Headers,
        ManagerEvent, RedisCacheManager, RedisCacheManagerConfig, RedisCacheStore,
        RedisCacheStoreConfig, RequestKey, Result, StoreEvent, TagSelector, Vary,
    };
}
