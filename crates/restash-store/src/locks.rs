//! Per-shape write serialization
//!
//! The write path holds a shape's lock across the replacement scan, the
//! cascade and the commit pipeline, so concurrent writers to one request
//! shape serialize the way they would on a single-threaded event loop.
//! Reads stay lock-free.

use std::sync::Arc;

use dashmap::DashMap;
use tokio::sync::{Mutex, OwnedMutexGuard};

#[derive(Default)]
pub(crate) struct ShapeLocks {
    locks: DashMap<String, Arc<Mutex<()>>>,
}

impl ShapeLocks {
    pub(crate) async fn acquire(&self, shape: &str) -> ShapeLockGuard<'_> {
        let lock = {
            let entry = self
                .locks
                .entry(shape.to_string())
                .or_insert_with(|| Arc::new(Mutex::new(())));
            entry.value().clone()
        };
        let guard = lock.lock_owned().await;
        ShapeLockGuard {
            _guard: guard,
            shape: shape.to_string(),
            registry: self,
        }
    }

    #[cfg(test)]
    fn len(&self) -> usize {
        self.locks.len()
    }
}

pub(crate) struct ShapeLockGuard<'a> {
    _guard: OwnedMutexGuard<()>,
    shape: String,
    registry: &'a ShapeLocks,
}

impl Drop for ShapeLockGuard<'_> {
    fn drop(&mut self) {
        // two strong references while this guard is alive: the map's and the
        // guard's; more means another writer is waiting on this shape
        self.registry
            .locks
            .remove_if(&self.shape, |_, lock| Arc::strong_count(lock) <= 2);
    }
}
