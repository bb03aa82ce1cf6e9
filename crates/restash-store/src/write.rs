//! Streaming write sink and terminal commit

use std::sync::atomic::Ordering;
use std::sync::Arc;

use bytes::Bytes;
use uuid::Uuid;

use restash_core::keys;
use restash_core::{
    extract_cache_tags, CacheEntry, CacheError, CachedResponse, RequestKey, Result, StoredResponse,
};

use crate::cascade;
use crate::connection::backend_err;
use crate::record::{MetadataRecord, F_METADATA_KEY};
use crate::store::StoreInner;

/// Body accumulator with the per-entry ceiling applied as chunks arrive.
/// Crossing the ceiling drops the buffered chunks and turns every later
/// write into a no-op; the terminal commit is then skipped.
#[derive(Debug)]
pub(crate) struct BodyBuffer {
    chunks: Vec<Bytes>,
    size: usize,
    max: usize,
    overflowed: bool,
}

impl BodyBuffer {
    pub(crate) fn new(max: usize) -> Self {
        Self {
            chunks: Vec::new(),
            size: 0,
            max,
            overflowed: false,
        }
    }

    pub(crate) fn push(&mut self, chunk: Bytes) {
        if self.overflowed {
            return;
        }
        self.size += chunk.len();
        self.chunks.push(chunk);
        if self.size >= self.max {
            self.chunks = Vec::new();
            self.overflowed = true;
        }
    }

    pub(crate) fn size(&self) -> usize {
        self.size
    }

    pub(crate) fn overflowed(&self) -> bool {
        self.overflowed
    }

    pub(crate) fn into_chunks(self) -> Vec<Bytes> {
        self.chunks
    }
}

/// Body sink returned by `create_write_stream`. Chunks buffer synchronously;
/// the commit runs when `end()` resolves.
pub struct CacheWriteStream {
    store: Arc<StoreInner>,
    key: RequestKey,
    response: CachedResponse,
    buffer: BodyBuffer,
}

impl CacheWriteStream {
    pub(crate) fn new(store: Arc<StoreInner>, key: RequestKey, response: CachedResponse) -> Self {
        let buffer = BodyBuffer::new(store.config.max_entry_size);
        Self {
            store,
            key,
            response,
            buffer,
        }
    }

    /// Buffer one body chunk. Never fails; an over-sized body makes the whole
    /// write a no-op, reported through the error callback at `end`.
    pub fn write(&mut self, chunk: impl Into<Bytes>) {
        self.buffer.push(chunk.into());
    }

    /// Finish the stream and commit the entry. An empty body is valid (HEAD
    /// responses carry none). Backend failures are routed to the error
    /// callback; the caller only sees `Err` for programming errors.
    pub async fn end(self) -> Result<()> {
        let Self {
            store,
            key,
            response,
            buffer,
        } = self;
        if store.closed.load(Ordering::SeqCst) {
            return Ok(());
        }
        if buffer.overflowed() {
            (store.on_error)(&CacheError::EntryTooLarge {
                size: buffer.size(),
                max: store.config.max_entry_size,
            });
            return Ok(());
        }
        match commit(&store, &key, response, buffer.into_chunks()).await {
            Ok(entry) => {
                store.emit_write(entry);
                Ok(())
            }
            Err(error) => {
                (store.on_error)(&error);
                Ok(())
            }
        }
    }
}

/// Replace any entry matching the shape + vary, then persist the four rows in
/// one pipeline with their co-ordinated expiry.
async fn commit(
    store: &StoreInner,
    key: &RequestKey,
    response: CachedResponse,
    body: Vec<Bytes>,
) -> Result<CacheEntry> {
    let _shape_lock = store.locks.acquire(&key.shape()).await;

    if let Some((existing, _)) = store.find_winner(key).await? {
        store.cascade_delete(&existing).await?;
    }

    let id = key
        .id
        .clone()
        .unwrap_or_else(|| Uuid::new_v4().to_string());
    let prefix = &store.config.key_prefix;

    let metadata_key = keys::serialize_metadata_key("", &key.origin, &key.path, &key.method, &id);
    let ids_key = keys::serialize_ids_key("", &id);
    let value_key = keys::serialize_values_key("", &id);

    let tags = store
        .config
        .cache_tags_header
        .as_deref()
        .map(|header| extract_cache_tags(&response.headers, header))
        .and_then(cascade::normalize_tag_set)
        .unwrap_or_default();
    let tags_key = (!tags.is_empty()).then(|| keys::serialize_tags_key("", &tags, &id));

    let record = MetadataRecord {
        id_key: ids_key.clone(),
        value_key: value_key.clone(),
        tags_key: tags_key.clone(),
        vary: response.vary.clone(),
    };
    let stored = StoredResponse::from_response(&response, body);
    let payload = serde_json::to_string(&stored)
        .map_err(|error| CacheError::Serialization(error.to_string()))?;
    let expire_at = (response.delete_at / 1000) as i64;

    let abs_metadata = keys::add_key_prefix(&metadata_key, prefix);
    let abs_ids = keys::add_key_prefix(&ids_key, prefix);
    let abs_value = keys::add_key_prefix(&value_key, prefix);

    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.hset_multiple(&abs_metadata, &record.to_pairs()?).ignore();
    pipe.hset(&abs_ids, F_METADATA_KEY, &metadata_key).ignore();
    pipe.set(&abs_value, payload).ignore();
    if let Some(tags_key) = &tags_key {
        let abs_tags = keys::add_key_prefix(tags_key, prefix);
        pipe.hset(&abs_tags, F_METADATA_KEY, &metadata_key).ignore();
        pipe.expire_at(&abs_tags, expire_at).ignore();
    }
    pipe.expire_at(&abs_metadata, expire_at).ignore();
    pipe.expire_at(&abs_ids, expire_at).ignore();
    pipe.expire_at(&abs_value, expire_at).ignore();

    let mut conn = store.conn.clone();
    pipe.query_async::<()>(&mut conn).await.map_err(backend_err)?;

    Ok(CacheEntry {
        id,
        key_prefix: prefix.clone(),
        origin: key.origin.clone(),
        method: key.method.clone(),
        path: key.path.clone(),
        status_code: response.status_code,
        headers: response.headers,
        cache_tags: tags,
        cached_at: response.cached_at,
        stale_at: response.stale_at,
        delete_at: response.delete_at,
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_body_buffer_accumulates() {
        let mut buffer = BodyBuffer::new(100);
        buffer.push(Bytes::from("asd"));
        buffer.push(Bytes::from("123"));
        assert_eq!(buffer.size(), 6);
        assert!(!buffer.overflowed());
        assert_eq!(
            buffer.into_chunks(),
            vec![Bytes::from("asd"), Bytes::from("123")]
        );
    }

    #[test]
    fn test_body_buffer_drops_at_ceiling() {
        let mut buffer = BodyBuffer::new(4);
        buffer.push(Bytes::from("12345"));
        assert!(buffer.overflowed());
        assert!(buffer.into_chunks().is_empty());
    }

    #[test]
    fn test_body_buffer_ceiling_is_exclusive() {
        let mut buffer = BodyBuffer::new(4);
        buffer.push(Bytes::from("1234"));
        assert!(buffer.overflowed());
    }

    #[test]
    fn test_body_buffer_discards_after_overflow() {
        let mut buffer = BodyBuffer::new(4);
        buffer.push(Bytes::from("12345"));
        let size_at_overflow = buffer.size();
        buffer.push(Bytes::from("more"));
        assert_eq!(buffer.size(), size_at_overflow);
        assert!(buffer.into_chunks().is_empty());
    }

    #[test]
    fn test_empty_body_is_not_overflow() {
        let buffer = BodyBuffer::new(4);
        assert!(!buffer.overflowed());
        assert_eq!(buffer.size(), 0);
    }
}
