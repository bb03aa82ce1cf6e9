//! Cached response representations: the write-path descriptor, the persisted
//! value document, and the read-path result.

use bytes::Bytes;
use serde::{Deserialize, Serialize};
use serde_bytes::ByteBuf;
use std::collections::HashMap;

use super::headers::{header_get, Headers, HeaderValue};
use super::vary::Vary;

/// Opaque cache-control directive map, passed through untouched; freshness
/// interpretation belongs to the interceptor driving this store.
pub type CacheControlDirectives = HashMap<String, serde_json::Value>;

/// Descriptor of a response about to be cached. The body is streamed
/// separately through the write sink.
///
/// Timestamps are milliseconds since the epoch and must satisfy
/// `cached_at <= stale_at <= delete_at`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct CachedResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    pub cache_control: CacheControlDirectives,
    pub vary: Option<Vary>,
    pub cached_at: u64,
    pub stale_at: u64,
    pub delete_at: u64,
}

/// The document persisted in a `values` row. Field names follow the wire
/// convention of the hash rows (`idKey`, `metadataKey`, ...).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredResponse {
    pub status_code: u16,
    pub status_message: String,
    pub headers: Headers,
    #[serde(default)]
    pub cache_control: CacheControlDirectives,
    pub cached_at: u64,
    pub stale_at: u64,
    pub delete_at: u64,
    pub body: Vec<ByteBuf>,
}

impl StoredResponse {
    pub fn from_response(response: &CachedResponse, body: Vec<Bytes>) -> Self {
        Self {
            status_code: response.status_code,
            status_message: response.status_message.clone(),
            headers: response.headers.clone(),
            cache_control: response.cache_control.clone(),
            cached_at: response.cached_at,
            stale_at: response.stale_at,
            delete_at: response.delete_at,
            body: body
                .into_iter()
                .map(|chunk| ByteBuf::from(chunk.to_vec()))
                .collect(),
        }
    }

    /// Rehydrate into a read result. The vary fingerprint lives in the
    /// metadata row and is supplied by the caller; the etag is hoisted out of
    /// the headers for the interceptor's convenience.
    pub fn into_hit(self, vary: Option<Vary>) -> CacheHit {
        let etag = header_get(&self.headers, "etag").map(HeaderValue::joined);
        let body = self
            .body
            .into_iter()
            .map(|chunk| Bytes::from(chunk.into_vec()))
            .collect();
        CacheHit {
            response: CachedResponse {
                status_code: self.status_code,
                status_message: self.status_message,
                headers: self.headers,
                cache_control: self.cache_control,
                vary,
                cached_at: self.cached_at,
                stale_at: self.stale_at,
                delete_at: self.delete_at,
            },
            etag,
            body,
        }
    }
}

/// A cached response served back to the caller, stale or fresh; freshness is
/// the interceptor's concern.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheHit {
    pub response: CachedResponse,
    pub etag: Option<String>,
    /// Ordered body chunks; empty for HEAD responses.
    pub body: Vec<Bytes>,
}

impl CacheHit {
    /// Body bytes across all chunks.
    pub fn body_size(&self) -> usize {
        self.body.iter().map(Bytes::len).sum()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> StoredResponse {
        let mut headers = Headers::new();
        headers.insert("ETag".to_string(), "\"v1\"".into());
        StoredResponse {
            status_code: 200,
            status_message: "OK".to_string(),
            headers,
            cache_control: CacheControlDirectives::new(),
            cached_at: 1_000,
            stale_at: 2_000,
            delete_at: 3_000,
            body: vec![ByteBuf::from(b"asd".to_vec()), ByteBuf::from(b"123".to_vec())],
        }
    }

    #[test]
    fn test_serde_round_trip() {
        let stored = sample();
        let json = serde_json::to_string(&stored).unwrap();
        let back: StoredResponse = serde_json::from_str(&json).unwrap();
        assert_eq!(stored, back);
    }

    #[test]
    fn test_wire_field_names_are_camel_case() {
        let json = serde_json::to_value(sample()).unwrap();
        assert!(json.get("statusCode").is_some());
        assert!(json.get("cachedAt").is_some());
        assert!(json.get("deleteAt").is_some());
    }

    #[test]
    fn test_into_hit_hoists_etag_and_body() {
        let hit = sample().into_hit(None);
        assert_eq!(hit.etag.as_deref(), Some("\"v1\""));
        assert_eq!(hit.body, vec![Bytes::from("asd"), Bytes::from("123")]);
        assert_eq!(hit.body_size(), 6);
        assert!(hit.response.vary.is_none());
    }

    #[test]
    fn test_into_hit_attaches_vary() {
        let mut vary = Vary::new();
        vary.insert("accept".to_string(), Some("text/html".to_string()));
        let hit = sample().into_hit(Some(vary.clone()));
        assert_eq!(hit.response.vary, Some(vary));
    }
}
