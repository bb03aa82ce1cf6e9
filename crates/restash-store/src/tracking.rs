//! In-process mirror of recently read entries
//!
//! A bounded LRU over shape buckets. Reads consult it before touching the
//! backend; writes always go straight through. Coherence comes from the
//! backend's invalidation pushes: any mutation of a tracked key evicts the
//! bucket referencing it.

use std::time::{SystemTime, UNIX_EPOCH};

use indexmap::IndexMap;
use parking_lot::Mutex;

use restash_core::{vary_matches, CacheHit, RequestKey};

/// One mirrored entry with the absolute backend keys it was read from.
pub(crate) struct TrackedEntry {
    pub id: String,
    pub metadata_key: String,
    pub id_key: String,
    pub value_key: String,
    pub tags_key: Option<String>,
    pub hit: CacheHit,
    /// Body bytes only; the aggregate size bound counts these.
    pub size: usize,
}

impl TrackedEntry {
    fn references(&self, backend_key: &str) -> bool {
        self.metadata_key == backend_key
            || self.id_key == backend_key
            || self.value_key == backend_key
            || self.tags_key.as_deref() == Some(backend_key)
    }
}

#[derive(Default)]
struct TrackingState {
    /// shape fingerprint → id → entry, in LRU order (front is coldest).
    buckets: IndexMap<String, IndexMap<String, TrackedEntry>>,
    count: usize,
    size: usize,
}

pub(crate) struct TrackingCache {
    state: Mutex<TrackingState>,
    max_count: usize,
    max_size: usize,
}

fn now_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_millis() as u64)
        .unwrap_or(0)
}

impl TrackingCache {
    pub(crate) fn new(max_count: usize, max_size: usize) -> Self {
        Self {
            state: Mutex::new(TrackingState::default()),
            max_count,
            max_size,
        }
    }

    /// Vary-matched lookup inside the shape bucket; touches the bucket's LRU
    /// position on a hit. Entries past their `delete_at` are refused, since
    /// the backend's expiry push may still be in flight.
    pub(crate) fn get(&self, key: &RequestKey) -> Option<CacheHit> {
        let now = now_ms();
        let mut state = self.state.lock();
        let index = state.buckets.get_index_of(&key.shape())?;
        let hit = state.buckets.get_index(index).and_then(|(_, bucket)| {
            bucket
                .values()
                .find(|entry| {
                    entry.hit.response.delete_at > now
                        && entry
                            .hit
                            .response
                            .vary
                            .as_ref()
                            .is_none_or(|vary| vary_matches(vary, key.headers.as_ref()))
                })
                .map(|entry| entry.hit.clone())
        })?;
        let last = state.buckets.len() - 1;
        state.buckets.move_index(index, last);
        Some(hit)
    }

    /// Mirror a freshly read entry, replacing whatever previously matched the
    /// same request, then enforce the bounds.
    pub(crate) fn set(&self, key: &RequestKey, entry: TrackedEntry) {
        let mut state = self.state.lock();
        let added_size = entry.size;
        let (removed_count, removed_size) = {
            let bucket = state.buckets.entry(key.shape()).or_default();
            let (removed_count, removed_size) = remove_matching(bucket, key);
            bucket.insert(entry.id.clone(), entry);
            (removed_count, removed_size)
        };
        state.count = state.count - removed_count + 1;
        state.size = state.size - removed_size + added_size;
        self.clean(&mut state);
    }

    /// Drop the entry matching `key`; empty buckets are removed.
    pub(crate) fn delete(&self, key: &RequestKey) {
        let mut state = self.state.lock();
        let shape = key.shape();
        let Some(bucket) = state.buckets.get_mut(&shape) else {
            return;
        };
        let (removed_count, removed_size) = remove_matching(bucket, key);
        let empty = bucket.is_empty();
        state.count -= removed_count;
        state.size -= removed_size;
        if empty {
            state.buckets.shift_remove(&shape);
        }
    }

    /// Drop every entry at `key`'s origin and path regardless of method.
    /// Used by write-through purges, whose backend scan wildcards the method;
    /// waiting for the invalidation push would leave a window where a purged
    /// sibling (e.g. the HEAD variant beside a deleted GET) still reads as a
    /// hit.
    pub(crate) fn delete_path(&self, key: &RequestKey) {
        let prefix = key.shape_prefix();
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .buckets
            .keys()
            .filter(|shape| shape.starts_with(&prefix))
            .cloned()
            .collect();
        for shape in doomed {
            if let Some(bucket) = state.buckets.shift_remove(&shape) {
                state.count -= bucket.len();
                state.size -= bucket.values().map(|entry| entry.size).sum::<usize>();
            }
        }
    }

    /// Server-push invalidation: evict every bucket holding an entry that
    /// references the notified backend key.
    pub(crate) fn invalidate(&self, backend_key: &str) {
        let mut state = self.state.lock();
        let doomed: Vec<String> = state
            .buckets
            .iter()
            .filter(|(_, bucket)| bucket.values().any(|entry| entry.references(backend_key)))
            .map(|(shape, _)| shape.clone())
            .collect();
        for shape in doomed {
            if let Some(bucket) = state.buckets.shift_remove(&shape) {
                state.count -= bucket.len();
                state.size -= bucket.values().map(|entry| entry.size).sum::<usize>();
            }
        }
    }

    fn clean(&self, state: &mut TrackingState) {
        while state.count > self.max_count || state.size > self.max_size {
            let Some((_, bucket)) = state.buckets.shift_remove_index(0) else {
                break;
            };
            state.count -= bucket.len();
            state.size -= bucket.values().map(|entry| entry.size).sum::<usize>();
        }
    }

    #[cfg(test)]
    fn counters(&self) -> (usize, usize) {
        let state = self.state.lock();
        (state.count, state.size)
    }
}

fn remove_matching(
    bucket: &mut IndexMap<String, TrackedEntry>,
    key: &RequestKey,
) -> (usize, usize) {
    let matching: Vec<String> = bucket
        .iter()
        .filter(|(_, entry)| {
            entry
                .hit
                .response
                .vary
                .as_ref()
                .is_none_or(|vary| vary_matches(vary, key.headers.as_ref()))
        })
        .map(|(id, _)| id.clone())
        .collect();
    let mut removed_count = 0;
    let mut removed_size = 0;
    for id in matching {
        if let Some(entry) = bucket.shift_remove(&id) {
            removed_count += 1;
            removed_size += entry.size;
        }
    }
    (removed_count, removed_size)
}

#[cfg(test)]
mod tests {
    use super::*;
    use bytes::Bytes;
    use restash_core::{CacheControlDirectives, CachedResponse, Headers, Vary};

    fn hit(delete_at: u64, vary: Option<Vary>, body: &[u8]) -> CacheHit {
        CacheHit {
            response: CachedResponse {
                status_code: 200,
                status_message: "OK".to_string(),
                headers: Headers::new(),
                cache_control: CacheControlDirectives::new(),
                vary,
                cached_at: 0,
                stale_at: 0,
                delete_at,
            },
            etag: None,
            body: vec![Bytes::copy_from_slice(body)],
        }
    }

    fn entry(id: &str, delete_at: u64, vary: Option<Vary>, body: &[u8]) -> TrackedEntry {
        TrackedEntry {
            id: id.to_string(),
            metadata_key: format!("metadata:o:p:GET:{id}"),
            id_key: format!("ids:{id}"),
            value_key: format!("values:{id}"),
            tags_key: None,
            hit: hit(delete_at, vary, body),
            size: body.len(),
        }
    }

    fn far_future() -> u64 {
        now_ms() + 60_000
    }

    #[test]
    fn test_set_then_get() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", far_future(), None, b"body"));

        let hit = cache.get(&key).unwrap();
        assert_eq!(hit.body, vec![Bytes::from("body")]);
        assert_eq!(cache.counters(), (1, 4));
    }

    #[test]
    fn test_vary_mismatch_misses() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let mut vary = Vary::new();
        vary.insert("accept".to_string(), Some("text/html".to_string()));
        let stored_key = RequestKey::new("http://h", "GET", "/").with_headers(
            [("accept".to_string(), "text/html".into())].into_iter().collect(),
        );
        cache.set(&stored_key, entry("a", far_future(), Some(vary), b"x"));

        let other = RequestKey::new("http://h", "GET", "/").with_headers(
            [("accept".to_string(), "application/json".into())]
                .into_iter()
                .collect(),
        );
        assert!(cache.get(&other).is_none());
        assert!(cache.get(&stored_key).is_some());
    }

    #[test]
    fn test_replaces_matching_entry() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", far_future(), None, b"one"));
        cache.set(&key, entry("b", far_future(), None, b"four"));

        assert_eq!(cache.counters(), (1, 4));
        assert_eq!(cache.get(&key).unwrap().body, vec![Bytes::from("four")]);
    }

    #[test]
    fn test_expired_entry_refused() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", 1, None, b"x"));
        assert!(cache.get(&key).is_none());
    }

    #[test]
    fn test_max_count_evicts_lru_bucket() {
        let cache = TrackingCache::new(2, usize::MAX);
        let first = RequestKey::new("http://h", "GET", "/1");
        let second = RequestKey::new("http://h", "GET", "/2");
        let third = RequestKey::new("http://h", "GET", "/3");
        cache.set(&first, entry("a", far_future(), None, b"x"));
        cache.set(&second, entry("b", far_future(), None, b"x"));

        // touch the first bucket so the second is coldest
        cache.get(&first).unwrap();
        cache.set(&third, entry("c", far_future(), None, b"x"));

        assert!(cache.get(&first).is_some());
        assert!(cache.get(&second).is_none());
        assert!(cache.get(&third).is_some());
        assert_eq!(cache.counters(), (2, 2));
    }

    #[test]
    fn test_max_size_evicts_until_bound_holds() {
        let cache = TrackingCache::new(usize::MAX, 8);
        let first = RequestKey::new("http://h", "GET", "/1");
        let second = RequestKey::new("http://h", "GET", "/2");
        cache.set(&first, entry("a", far_future(), None, b"sixby"));
        cache.set(&second, entry("b", far_future(), None, b"chunk"));

        assert!(cache.get(&first).is_none());
        assert!(cache.get(&second).is_some());
        assert_eq!(cache.counters(), (1, 5));
    }

    #[test]
    fn test_delete_removes_bucket() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", far_future(), None, b"x"));
        cache.delete(&key);
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.counters(), (0, 0));
    }

    #[test]
    fn test_delete_path_evicts_every_method() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let get = RequestKey::new("http://h", "GET", "/");
        let head = RequestKey::new("http://h", "HEAD", "/");
        let other = RequestKey::new("http://h", "GET", "/other");
        cache.set(&get, entry("a", far_future(), None, b"x"));
        cache.set(&head, entry("b", far_future(), None, b"y"));
        cache.set(&other, entry("c", far_future(), None, b"z"));

        cache.delete_path(&get);

        assert!(cache.get(&get).is_none());
        assert!(cache.get(&head).is_none());
        assert!(cache.get(&other).is_some());
        assert_eq!(cache.counters(), (1, 1));
    }

    #[test]
    fn test_invalidate_by_any_backend_key() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", far_future(), None, b"x"));

        cache.invalidate("values:a");
        assert!(cache.get(&key).is_none());
        assert_eq!(cache.counters(), (0, 0));
    }

    #[test]
    fn test_invalidate_unknown_key_is_noop() {
        let cache = TrackingCache::new(usize::MAX, usize::MAX);
        let key = RequestKey::new("http://h", "GET", "/");
        cache.set(&key, entry("a", far_future(), None, b"x"));
        cache.invalidate("values:unrelated");
        assert!(cache.get(&key).is_some());
    }
}
