//! Shared types exchanged between the store, the tracking cache and callers

mod entry;
mod headers;
mod key;
mod response;
mod vary;

pub use entry::CacheEntry;
pub use headers::{extract_cache_tags, header_get, HeaderValue, Headers};
pub use key::RequestKey;
pub use response::{CacheControlDirectives, CacheHit, CachedResponse, StoredResponse};
pub use vary::{vary_matches, Vary};
