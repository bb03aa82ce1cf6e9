//! Typed event channels for store and manager observers

use restash_core::CacheEntry;
use tokio::sync::broadcast;

/// Capacity of the broadcast channels; a receiver that falls further behind
/// observes `Lagged` and resumes from the oldest retained event.
const EVENT_CHANNEL_CAPACITY: usize = 1024;

/// Events emitted by [`crate::RedisCacheStore`].
#[derive(Debug, Clone)]
pub enum StoreEvent {
    /// An entry's commit pipeline completed.
    Write(CacheEntry),
    /// An entry's rows were removed.
    Delete { id: String, key_prefix: String },
}

/// Events emitted by [`crate::RedisCacheManager`].
#[derive(Debug, Clone)]
pub enum ManagerEvent {
    /// An entry appeared in the keyspace.
    AddEntry(CacheEntry),
    /// An entry's ids row was deleted or expired.
    DeleteEntry { id: String, key_prefix: String },
}

pub(crate) fn channel<T: Clone>() -> broadcast::Sender<T> {
    broadcast::channel(EVENT_CHANNEL_CAPACITY).0
}
