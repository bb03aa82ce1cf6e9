//! The cache store: read path, invalidation, lifecycle
//!
//! Reads scan the metadata family for the request shape, probe vary
//! fingerprints in arrival order and take the first match. Missing or
//! undecodable siblings are repaired lazily: a stranded metadata row is
//! tombstoned, a corrupt value row cascades the whole entry away. Writes go
//! through [`crate::CacheWriteStream`].

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, PushInfo, PushKind};
use tokio::sync::{broadcast, mpsc};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use restash_core::keys;
use restash_core::{
    vary_matches, CacheEntry, CacheError, CacheHit, CachedResponse, RequestKey, Result,
    StoredResponse,
};

use crate::cascade::{self, DeletedEntry};
use crate::config::{ErrorCallback, RedisCacheStoreConfig};
use crate::connection::{self, backend_err};
use crate::events::{self, StoreEvent};
use crate::locks::ShapeLocks;
use crate::record::MetadataRecord;
use crate::scan::Scan;
use crate::tracking::{TrackedEntry, TrackingCache};
use crate::write::CacheWriteStream;

/// One tag or a conjunction of tags handed to [`RedisCacheStore::delete_tags`].
#[derive(Debug, Clone)]
pub enum TagSelector {
    One(String),
    All(Vec<String>),
}

impl TagSelector {
    pub(crate) fn into_tags(self) -> Vec<String> {
        match self {
            TagSelector::One(tag) => vec![tag],
            TagSelector::All(tags) => tags,
        }
    }
}

impl From<&str> for TagSelector {
    fn from(tag: &str) -> Self {
        TagSelector::One(tag.to_string())
    }
}

impl From<String> for TagSelector {
    fn from(tag: String) -> Self {
        TagSelector::One(tag)
    }
}

impl From<Vec<String>> for TagSelector {
    fn from(tags: Vec<String>) -> Self {
        TagSelector::All(tags)
    }
}

impl From<Vec<&str>> for TagSelector {
    fn from(tags: Vec<&str>) -> Self {
        TagSelector::All(tags.into_iter().map(String::from).collect())
    }
}

/// Shared HTTP response store on Redis.
///
/// Cloning is cheap and hands out another handle to the same store.
#[derive(Clone)]
pub struct RedisCacheStore {
    inner: Arc<StoreInner>,
}

pub(crate) struct StoreInner {
    pub(crate) config: RedisCacheStoreConfig,
    pub(crate) conn: ConnectionManager,
    pub(crate) tracking: Option<TrackingCache>,
    pub(crate) events: broadcast::Sender<StoreEvent>,
    pub(crate) cancel: CancellationToken,
    pub(crate) closed: AtomicBool,
    pub(crate) locks: ShapeLocks,
    pub(crate) on_error: ErrorCallback,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisCacheStore {
    /// Connect to the backend. With tracking enabled the data connection is
    /// opened in RESP3 and `CLIENT TRACKING ON` is issued, so every key this
    /// store reads produces an invalidation push when it is later mutated.
    pub async fn new(config: RedisCacheStoreConfig) -> Result<Self> {
        config.validate()?;
        let on_error = config.error_callback();
        let client = connection::open_client(&config.url, config.tracking)?;

        let (push_tx, push_rx) = if config.tracking {
            let (tx, rx) = mpsc::unbounded_channel();
            (Some(tx), Some(rx))
        } else {
            (None, None)
        };
        let mut conn = connection::connect(&client, config.connection_timeout, push_tx).await?;

        let tracking = if config.tracking {
            // tracking state does not survive an automatic reconnect; mirrored
            // entries then age out via their delete_at guard
            redis::cmd("CLIENT")
                .arg("TRACKING")
                .arg("ON")
                .query_async::<()>(&mut conn)
                .await
                .map_err(backend_err)?;
            Some(TrackingCache::new(
                config.tracking_max_count,
                config.tracking_max_size,
            ))
        } else {
            None
        };

        let store = Self {
            inner: Arc::new(StoreInner {
                config,
                conn,
                tracking,
                events: events::channel(),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                locks: ShapeLocks::default(),
                on_error,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        };
        if let Some(rx) = push_rx {
            store.spawn_invalidation_drain(rx);
        }
        Ok(store)
    }

    fn spawn_invalidation_drain(&self, mut rx: mpsc::UnboundedReceiver<PushInfo>) {
        let inner = Arc::clone(&self.inner);
        let cancel = inner.cancel.clone();
        let handle = tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    push = rx.recv() => {
                        let Some(push) = push else { break };
                        if push.kind != PushKind::Invalidate {
                            continue;
                        }
                        let Some(tracking) = inner.tracking.as_ref() else { break };
                        for key in invalidated_keys(&push.data) {
                            tracking.invalidate(&key);
                        }
                    }
                }
            }
        });
        self.inner.tasks.lock().push(handle);
    }

    /// Look up a cached response for `key`. Stale entries are served as-is;
    /// freshness is the interceptor's concern. Recoverable backend errors go
    /// to the error callback and read as a miss.
    pub async fn get(&self, key: &RequestKey) -> Result<Option<CacheHit>> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(None);
        }
        if let Some(tracking) = &self.inner.tracking {
            if let Some(hit) = tracking.get(key) {
                return Ok(Some(hit));
            }
        }
        match self.inner.lookup(key).await {
            Ok(hit) => Ok(hit),
            Err(error) => {
                (self.inner.on_error)(&error);
                Ok(None)
            }
        }
    }

    /// Open a body sink for `key`/`response`; the entry is committed when the
    /// sink's `end()` resolves. Returns `None` while the store is not
    /// accepting writes.
    pub fn create_write_stream(
        &self,
        key: RequestKey,
        response: CachedResponse,
    ) -> Result<Option<CacheWriteStream>> {
        if self.inner.closed.load(Ordering::SeqCst) || self.is_full() {
            return Ok(None);
        }
        if response.cached_at > response.stale_at || response.stale_at > response.delete_at {
            return Err(CacheError::InvalidArgument(
                "timestamps must satisfy cached_at <= stale_at <= delete_at".into(),
            ));
        }
        Ok(Some(CacheWriteStream::new(
            Arc::clone(&self.inner),
            key,
            response,
        )))
    }

    /// Reserved capacity signal; the store never reports full.
    pub fn is_full(&self) -> bool {
        false
    }

    /// Purge every cached response at `key`'s origin and path, any method.
    pub async fn delete(&self, key: &RequestKey) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if let Err(error) = self.inner.delete_shape(key, "*").await {
            (self.inner.on_error)(&error);
        }
        // evict the mirror only after the rows are gone: the backend scan
        // wildcards the method, and a read racing the cascade may have
        // re-mirrored an entry the cascade then removed
        if let Some(tracking) = &self.inner.tracking {
            tracking.delete_path(key);
        }
        Ok(())
    }

    /// Purge exact request shapes, method respected, concurrently.
    pub async fn delete_keys(&self, keys_to_delete: &[RequestKey]) -> Result<()> {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let results = join_all(
            keys_to_delete
                .iter()
                .map(|key| self.inner.delete_shape(key, &key.method)),
        )
        .await;
        for result in results {
            if let Err(error) = result {
                (self.inner.on_error)(&error);
            }
        }
        if let Some(tracking) = &self.inner.tracking {
            for key in keys_to_delete {
                tracking.delete(key);
            }
        }
        Ok(())
    }

    /// Delete every entry whose tag set is a superset of one of `entries`.
    pub async fn delete_tags<I, T>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = T>,
        T: Into<TagSelector>,
    {
        if self.inner.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        let seeds: Vec<Vec<String>> = entries
            .into_iter()
            .map(|entry| entry.into().into_tags())
            .collect();
        let mut conn = self.inner.conn.clone();
        let result = cascade::delete_tag_sets(
            &mut conn,
            &self.inner.cancel,
            &self.inner.config.key_prefix,
            seeds,
            false,
            &self.inner.on_error,
            |deleted| self.inner.emit_delete(deleted),
        )
        .await;
        if let Err(error) = result {
            (self.inner.on_error)(&error);
        }
        Ok(())
    }

    /// Receiver for `entry:write` / `entry:delete` events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<StoreEvent> {
        self.inner.events.subscribe()
    }

    /// Abort outstanding scans, wait a short grace for them to unwind, then
    /// stop the background tasks. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing cache store");
        self.inner.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl StoreInner {
    /// Scan the shape's metadata rows and return the first vary match.
    /// Undecodable rows are tombstoned and skipped.
    pub(crate) async fn find_winner(
        &self,
        key: &RequestKey,
    ) -> Result<Option<(String, MetadataRecord)>> {
        let pattern = keys::metadata_pattern(
            &self.config.key_prefix,
            &key.origin,
            &key.path,
            &key.method,
        );
        let mut conn = self.conn.clone();
        let mut scan = Scan::new(conn.clone(), pattern, self.cancel.clone());
        while let Some(page) = scan.next_page().await? {
            for metadata_key in page {
                let hash: HashMap<String, String> =
                    conn.hgetall(&metadata_key).await.map_err(backend_err)?;
                if hash.is_empty() {
                    continue;
                }
                let record = match MetadataRecord::from_hash(&hash) {
                    Ok(record) => record,
                    Err(error) => {
                        (self.on_error)(&error);
                        let _: () = conn.del(&metadata_key).await.map_err(backend_err)?;
                        continue;
                    }
                };
                let matches = record
                    .vary
                    .as_ref()
                    .is_none_or(|vary| vary_matches(vary, key.headers.as_ref()));
                if matches {
                    return Ok(Some((metadata_key, record)));
                }
            }
        }
        Ok(None)
    }

    async fn lookup(&self, key: &RequestKey) -> Result<Option<CacheHit>> {
        let Some((metadata_key, record)) = self.find_winner(key).await? else {
            return Ok(None);
        };
        let parsed = keys::parse_metadata_key(&metadata_key)?;
        let mut conn = self.conn.clone();

        let value_key = keys::add_key_prefix(&record.value_key, &self.config.key_prefix);
        let raw: Option<String> = conn.get(&value_key).await.map_err(backend_err)?;
        let Some(raw) = raw else {
            // value row expired first; tombstone the stranded metadata
            let _: () = conn.del(&metadata_key).await.map_err(backend_err)?;
            return Ok(None);
        };

        let stored: StoredResponse = match serde_json::from_str(&raw) {
            Ok(stored) => stored,
            Err(error) => {
                (self.on_error)(&CacheError::Deserialization(format!("value row: {error}")));
                self.cascade_delete(&metadata_key).await?;
                return Ok(None);
            }
        };

        let hit = stored.into_hit(record.vary.clone());
        if let Some(tracking) = &self.tracking {
            tracking.set(
                key,
                TrackedEntry {
                    id: parsed.id,
                    metadata_key: metadata_key.clone(),
                    id_key: keys::add_key_prefix(&record.id_key, &self.config.key_prefix),
                    value_key,
                    tags_key: record
                        .tags_key
                        .as_deref()
                        .map(|tags_key| keys::add_key_prefix(tags_key, &self.config.key_prefix)),
                    size: hit.body_size(),
                    hit: hit.clone(),
                },
            );
        }
        Ok(Some(hit))
    }

    async fn delete_shape(&self, key: &RequestKey, method: &str) -> Result<()> {
        let pattern =
            keys::metadata_pattern(&self.config.key_prefix, &key.origin, &key.path, method);
        let mut scan = Scan::new(self.conn.clone(), pattern, self.cancel.clone());
        let mut matches = Vec::new();
        while let Some(page) = scan.next_page().await? {
            matches.extend(page);
        }
        let results = join_all(
            matches
                .iter()
                .map(|metadata_key| self.cascade_delete(metadata_key)),
        )
        .await;
        for result in results {
            result?;
        }
        Ok(())
    }

    /// Remove one entry's rows, then sweep entries sharing its tag set.
    pub(crate) async fn cascade_delete(&self, metadata_key: &str) -> Result<()> {
        let mut conn = self.conn.clone();
        if let Some(deleted) = cascade::delete_entry_rows(&mut conn, metadata_key).await? {
            self.emit_delete(&deleted);
            if !deleted.tags.is_empty() {
                cascade::delete_tag_sets(
                    &mut conn,
                    &self.cancel,
                    &self.config.key_prefix,
                    vec![deleted.tags.clone()],
                    false,
                    &self.on_error,
                    |sibling| self.emit_delete(sibling),
                )
                .await?;
            }
        }
        Ok(())
    }

    pub(crate) fn emit_delete(&self, deleted: &DeletedEntry) {
        let _ = self.events.send(StoreEvent::Delete {
            id: deleted.id.clone(),
            key_prefix: deleted.key_prefix.clone(),
        });
    }

    pub(crate) fn emit_write(&self, entry: CacheEntry) {
        let _ = self.events.send(StoreEvent::Write(entry));
    }
}

fn invalidated_keys(data: &[redis::Value]) -> Vec<String> {
    let mut out = Vec::new();
    for value in data {
        if let Ok(keys) = redis::from_redis_value::<Vec<String>>(value.clone()) {
            out.extend(keys);
        } else if let Ok(key) = redis::from_redis_value::<String>(value.clone()) {
            out.push(key);
        }
    }
    out
}
