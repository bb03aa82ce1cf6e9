//! restash-store: Redis-backed store, tracking cache and manager for the
//! restash shared HTTP response cache.
//!
//! The store persists full HTTP responses across four co-expiring key
//! families, serves them back under `Vary` negotiation, and invalidates by
//! key, by tag set or by write-through. The manager is a companion observer
//! that streams entries, reacts to keyspace notifications and performs the
//! cross-prefix tag cascade.

mod cascade;
mod config;
mod connection;
mod events;
mod locks;
mod manager;
mod record;
mod scan;
mod store;
mod tracking;
mod write;

pub use config::{ErrorCallback, RedisCacheManagerConfig, RedisCacheStoreConfig};
pub use events::{ManagerEvent, StoreEvent};
pub use manager::RedisCacheManager;
pub use store::{RedisCacheStore, TagSelector};
pub use write::CacheWriteStream;
