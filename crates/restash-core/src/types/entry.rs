//! The persisted bundle as surfaced in events and manager reads

use serde::{Deserialize, Serialize};

use super::headers::Headers;

/// One committed cache entry: its identity, request shape, response summary
/// and tag set. Carried by write/add/delete events and by the manager's
/// entry stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CacheEntry {
    pub id: String,
    pub key_prefix: String,
    pub origin: String,
    pub method: String,
    pub path: String,
    pub status_code: u16,
    pub headers: Headers,
    pub cache_tags: Vec<String>,
    pub cached_at: u64,
    pub stale_at: u64,
    pub delete_at: u64,
}
