//! Companion observer: streams entries, reacts to keyspace notifications,
//! performs the cross-prefix tag cascade
//!
//! The manager is meant to run beside (or in a different process than) the
//! stores it watches. It is prefix-agnostic: keys arriving through keyspace
//! events are parsed around their family discriminator, so one manager can
//! observe stores using different key prefixes on the same backend.

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::join_all;
use futures_util::StreamExt;
use redis::aio::ConnectionManager;
use redis::{AsyncCommands, Client};
use tokio::sync::broadcast;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use restash_core::keys::{self, KeyFamily};
use restash_core::{CacheEntry, CacheError, CacheHit, Result, StoredResponse};

use crate::cascade;
use crate::config::{ErrorCallback, RedisCacheManagerConfig};
use crate::connection::{self, backend_err};
use crate::events::{self, ManagerEvent};
use crate::record::{MetadataRecord, F_METADATA_KEY};
use crate::scan::Scan;

const NOTIFY_KEYSPACE_EVENTS: &str = "AKE";
const HSET_CHANNEL: &str = "__keyevent@0__:hset";
const DEL_CHANNEL: &str = "__keyevent@0__:del";
const EXPIRED_CHANNEL: &str = "__keyevent@0__:expired";

/// Observer over the cache keyspace.
///
/// Cloning is cheap and hands out another handle to the same manager.
#[derive(Clone)]
pub struct RedisCacheManager {
    inner: Arc<ManagerInner>,
}

struct ManagerInner {
    client: Client,
    conn: ConnectionManager,
    events: broadcast::Sender<ManagerEvent>,
    cancel: CancellationToken,
    closed: AtomicBool,
    on_error: ErrorCallback,
    tasks: parking_lot::Mutex<Vec<JoinHandle<()>>>,
}

impl RedisCacheManager {
    pub async fn new(config: RedisCacheManagerConfig) -> Result<Self> {
        config.validate()?;
        let on_error = config.error_callback();
        let client = connection::open_client(&config.url, false)?;
        let conn = connection::connect(&client, config.connection_timeout, None).await?;
        Ok(Self {
            inner: Arc::new(ManagerInner {
                client,
                conn,
                events: events::channel(),
                cancel: CancellationToken::new(),
                closed: AtomicBool::new(false),
                on_error,
                tasks: parking_lot::Mutex::new(Vec::new()),
            }),
        })
    }

    /// Receiver for `add-entry` / `delete-entry` events.
    pub fn subscribe_events(&self) -> broadcast::Receiver<ManagerEvent> {
        self.inner.events.subscribe()
    }

    /// Resolve every entry under `key_prefix` and hand each to `visit`.
    /// Entries that lose a sibling mid-resolution are skipped.
    pub async fn stream_entries<F>(&self, mut visit: F, key_prefix: &str) -> Result<()>
    where
        F: FnMut(CacheEntry),
    {
        let inner = &self.inner;
        let pattern = keys::ids_pattern(key_prefix);
        let mut scan = Scan::new(inner.conn.clone(), pattern, inner.cancel.clone());
        while let Some(page) = scan.next_page().await? {
            let resolved = join_all(page.iter().map(|ids_key| inner.resolve_entry(ids_key))).await;
            for result in resolved {
                match result {
                    Ok(Some(entry)) => visit(entry),
                    Ok(None) => {}
                    Err(error) => (inner.on_error)(&error),
                }
            }
        }
        Ok(())
    }

    /// Enable keyspace notifications and start the observer task. Fails when
    /// the server refuses `CONFIG SET notify-keyspace-events` (hardened
    /// deployments), in which case nothing is subscribed.
    pub async fn subscribe(&self) -> Result<()> {
        let mut conn = self.inner.conn.clone();
        redis::cmd("CONFIG")
            .arg("SET")
            .arg("notify-keyspace-events")
            .arg(NOTIFY_KEYSPACE_EVENTS)
            .query_async::<()>(&mut conn)
            .await
            .map_err(|error| {
                CacheError::Subscription(format!("notify-keyspace-events: {error}"))
            })?;

        let mut pubsub = self
            .inner
            .client
            .get_async_pubsub()
            .await
            .map_err(|error| CacheError::Subscription(error.to_string()))?;
        for channel in [HSET_CHANNEL, DEL_CHANNEL, EXPIRED_CHANNEL] {
            pubsub
                .subscribe(channel)
                .await
                .map_err(|error| CacheError::Subscription(error.to_string()))?;
        }
        tracing::debug!("keyspace observer subscribed");

        let observer = Arc::clone(&self.inner);
        let cancel = observer.cancel.clone();
        let handle = tokio::spawn(async move {
            let mut messages = pubsub.into_on_message();
            loop {
                tokio::select! {
                    _ = cancel.cancelled() => break,
                    message = messages.next() => {
                        let Some(message) = message else { break };
                        let channel = message.get_channel_name().to_string();
                        let key: String = match message.get_payload() {
                            Ok(key) => key,
                            Err(error) => {
                                (observer.on_error)(&CacheError::Deserialization(error.to_string()));
                                continue;
                            }
                        };
                        observer.handle_keyspace_event(&channel, &key).await;
                    }
                }
            }
        });
        self.inner.tasks.lock().push(handle);
        Ok(())
    }

    /// Cascade-delete entries by id under `key_prefix`.
    pub async fn delete_ids(&self, ids: &[String], key_prefix: &str) -> Result<()> {
        let inner = &self.inner;
        let mut conn = inner.conn.clone();
        for id in ids {
            let ids_key = keys::serialize_ids_key(key_prefix, id);
            let metadata_key: Option<String> = conn
                .hget(&ids_key, F_METADATA_KEY)
                .await
                .map_err(backend_err)?;
            let Some(metadata_key) = metadata_key else {
                continue;
            };
            let metadata_key = keys::add_key_prefix(&metadata_key, key_prefix);
            match cascade::delete_entry_rows(&mut conn, &metadata_key).await {
                Ok(Some(deleted)) if !deleted.tags.is_empty() => {
                    // delete-entry events flow from the keyspace subscription
                    cascade::delete_tag_sets(
                        &mut conn,
                        &inner.cancel,
                        key_prefix,
                        vec![deleted.tags],
                        false,
                        &inner.on_error,
                        |_| {},
                    )
                    .await?;
                }
                Ok(_) => {}
                Err(error) => (inner.on_error)(&error),
            }
        }
        Ok(())
    }

    /// Administrative read of one entry's full response.
    pub async fn get_response_by_id(&self, id: &str, key_prefix: &str) -> Result<Option<CacheHit>> {
        let mut conn = self.inner.conn.clone();
        let ids_key = keys::serialize_ids_key(key_prefix, id);
        let metadata_key: Option<String> = conn
            .hget(&ids_key, F_METADATA_KEY)
            .await
            .map_err(backend_err)?;
        let Some(metadata_key) = metadata_key else {
            return Ok(None);
        };
        let metadata_key = keys::add_key_prefix(&metadata_key, key_prefix);
        let hash: HashMap<String, String> =
            conn.hgetall(&metadata_key).await.map_err(backend_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        let record = MetadataRecord::from_hash(&hash)?;
        let value_key = keys::add_key_prefix(&record.value_key, key_prefix);
        let raw: Option<String> = conn.get(&value_key).await.map_err(backend_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored: StoredResponse = serde_json::from_str(&raw)
            .map_err(|error| CacheError::Deserialization(format!("value row: {error}")))?;
        Ok(Some(stored.into_hit(record.vary)))
    }

    /// Entries across all prefixes whose tag sets contain every one of the
    /// target entry's tags, the target itself excluded.
    pub async fn get_dependent_entries(
        &self,
        id: &str,
        key_prefix: &str,
    ) -> Result<Vec<CacheEntry>> {
        let inner = &self.inner;
        let mut conn = inner.conn.clone();
        let ids_key = keys::serialize_ids_key(key_prefix, id);
        let metadata_key: Option<String> = conn
            .hget(&ids_key, F_METADATA_KEY)
            .await
            .map_err(backend_err)?;
        let Some(metadata_key) = metadata_key else {
            return Ok(Vec::new());
        };
        let metadata_key = keys::add_key_prefix(&metadata_key, key_prefix);
        let hash: HashMap<String, String> =
            conn.hgetall(&metadata_key).await.map_err(backend_err)?;
        if hash.is_empty() {
            return Ok(Vec::new());
        }
        let record = MetadataRecord::from_hash(&hash)?;
        let Some(tags_key) = record.tags_key else {
            return Ok(Vec::new());
        };
        let tags = keys::parse_tags_key(&tags_key)?.tags;

        let pattern = keys::tags_pattern("", &tags, true);
        let mut dependents = Vec::new();
        let mut scan = Scan::new(inner.conn.clone(), pattern, inner.cancel.clone());
        while let Some(page) = scan.next_page().await? {
            for candidate in page {
                let parsed = match keys::parse_tags_key(&candidate) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        (inner.on_error)(&error);
                        continue;
                    }
                };
                if parsed.id == id {
                    continue;
                }
                let ids_key = keys::serialize_ids_key(&parsed.key_prefix, &parsed.id);
                match inner.resolve_entry(&ids_key).await {
                    Ok(Some(entry)) => dependents.push(entry),
                    Ok(None) => {}
                    Err(error) => (inner.on_error)(&error),
                }
            }
        }
        Ok(dependents)
    }

    /// Every backend key under `key_prefix`.
    pub async fn get_prefixed_keys(&self, key_prefix: &str) -> Result<Vec<String>> {
        let mut scan = Scan::new(
            self.inner.conn.clone(),
            format!("{key_prefix}*"),
            self.inner.cancel.clone(),
        );
        let mut all = Vec::new();
        while let Some(page) = scan.next_page().await? {
            all.extend(page);
        }
        Ok(all)
    }

    /// Abort outstanding scans and stop the observer task. Idempotent.
    pub async fn close(&self) {
        if self.inner.closed.swap(true, Ordering::SeqCst) {
            return;
        }
        tracing::debug!("closing cache manager");
        self.inner.cancel.cancel();
        tokio::time::sleep(Duration::from_millis(100)).await;
        for task in self.inner.tasks.lock().drain(..) {
            task.abort();
        }
    }
}

impl ManagerInner {
    async fn handle_keyspace_event(&self, channel: &str, key: &str) {
        match (channel, keys::family_of(key)) {
            (HSET_CHANNEL, Some(KeyFamily::Ids)) => match self.resolve_entry(key).await {
                Ok(Some(entry)) => {
                    let _ = self.events.send(ManagerEvent::AddEntry(entry));
                }
                Ok(None) => {}
                Err(error) => (self.on_error)(&error),
            },
            (DEL_CHANNEL | EXPIRED_CHANNEL, Some(KeyFamily::Ids)) => {
                match keys::parse_ids_key(key) {
                    Ok(parsed) => {
                        let _ = self.events.send(ManagerEvent::DeleteEntry {
                            id: parsed.id,
                            key_prefix: parsed.key_prefix,
                        });
                    }
                    Err(error) => (self.on_error)(&error),
                }
            }
            (DEL_CHANNEL | EXPIRED_CHANNEL, Some(KeyFamily::CacheTags)) => {
                // a tag row went away: sweep every entry holding the same tag
                // set, whatever prefix it lives under
                let tags = match keys::parse_tags_key(key) {
                    Ok(parsed) => parsed.tags,
                    Err(error) => {
                        (self.on_error)(&error);
                        return;
                    }
                };
                let mut conn = self.conn.clone();
                let result = cascade::delete_tag_sets(
                    &mut conn,
                    &self.cancel,
                    "",
                    vec![tags],
                    true,
                    &self.on_error,
                    |_| {},
                )
                .await;
                if let Err(error) = result {
                    (self.on_error)(&error);
                }
            }
            _ => {}
        }
    }

    /// Resolve an ids row into a full entry via metadata + value.
    async fn resolve_entry(&self, ids_key: &str) -> Result<Option<CacheEntry>> {
        let parsed = keys::parse_ids_key(ids_key)?;
        let mut conn = self.conn.clone();
        let metadata_key: Option<String> = conn
            .hget(ids_key, F_METADATA_KEY)
            .await
            .map_err(backend_err)?;
        let Some(metadata_key) = metadata_key else {
            return Ok(None);
        };
        let metadata_key = keys::add_key_prefix(&metadata_key, &parsed.key_prefix);
        let shape = keys::parse_metadata_key(&metadata_key)?;
        let hash: HashMap<String, String> =
            conn.hgetall(&metadata_key).await.map_err(backend_err)?;
        if hash.is_empty() {
            return Ok(None);
        }
        let record = MetadataRecord::from_hash(&hash)?;
        let value_key = keys::add_key_prefix(&record.value_key, &parsed.key_prefix);
        let raw: Option<String> = conn.get(&value_key).await.map_err(backend_err)?;
        let Some(raw) = raw else {
            return Ok(None);
        };
        let stored: StoredResponse = serde_json::from_str(&raw)
            .map_err(|error| CacheError::Deserialization(format!("value row: {error}")))?;
        let cache_tags = record
            .tags_key
            .as_deref()
            .map(keys::parse_tags_key)
            .transpose()?
            .map(|parsed| parsed.tags)
            .unwrap_or_default();
        Ok(Some(CacheEntry {
            id: shape.id,
            key_prefix: parsed.key_prefix,
            origin: shape.origin,
            method: shape.method,
            path: shape.path,
            status_code: stored.status_code,
            headers: stored.headers,
            cache_tags,
            cached_at: stored.cached_at,
            stale_at: stored.stale_at,
            delete_at: stored.delete_at,
        }))
    }
}
