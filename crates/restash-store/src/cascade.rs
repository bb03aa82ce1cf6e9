//! Entry row deletion and tag-set cascade
//!
//! A cascade removes the four rows of one entry and then sweeps every entry
//! whose tag set is a superset of the victim's: identical tag sets behave as
//! equivalence classes, so siblings fall together. The sweep runs
//! breadth-first over a work queue instead of recursing, with a seen-set so
//! one tag set is scanned at most once per cascade.

use std::collections::{HashMap, HashSet, VecDeque};

use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use tokio_util::sync::CancellationToken;

use restash_core::keys;
use restash_core::Result;

use crate::config::ErrorCallback;
use crate::connection::backend_err;
use crate::record::{F_ID_KEY, F_METADATA_KEY, F_TAGS_KEY, F_VALUE_KEY};
use crate::scan::Scan;

/// What one row deletion removed, for event emission and tag follow-up.
#[derive(Debug, Clone)]
pub(crate) struct DeletedEntry {
    pub id: String,
    pub key_prefix: String,
    pub tags: Vec<String>,
}

/// Delete the rows of the entry behind `metadata_key` (absolute). Returns
/// `None` when the metadata row is already gone. Partial rows are torn down
/// field by field rather than rejected, so a half-committed entry still gets
/// cleaned up.
pub(crate) async fn delete_entry_rows(
    conn: &mut ConnectionManager,
    metadata_key: &str,
) -> Result<Option<DeletedEntry>> {
    let parsed = keys::parse_metadata_key(metadata_key)?;
    let hash: HashMap<String, String> = conn.hgetall(metadata_key).await.map_err(backend_err)?;
    if hash.is_empty() {
        return Ok(None);
    }

    let mut pipe = redis::pipe();
    pipe.atomic();
    pipe.del(metadata_key).ignore();
    if let Some(id_key) = hash.get(F_ID_KEY) {
        pipe.del(keys::add_key_prefix(id_key, &parsed.key_prefix)).ignore();
    }
    if let Some(value_key) = hash.get(F_VALUE_KEY) {
        pipe.del(keys::add_key_prefix(value_key, &parsed.key_prefix)).ignore();
    }
    let tags = match hash.get(F_TAGS_KEY) {
        Some(tags_key) => {
            pipe.del(keys::add_key_prefix(tags_key, &parsed.key_prefix)).ignore();
            keys::parse_tags_key(tags_key)
                .map(|parsed| parsed.tags)
                .unwrap_or_default()
        }
        None => Vec::new(),
    };
    pipe.query_async::<()>(conn).await.map_err(backend_err)?;

    Ok(Some(DeletedEntry {
        id: parsed.id,
        key_prefix: parsed.key_prefix,
        tags,
    }))
}

/// Delete every entry whose tag set is a superset of one of `seeds`. Each
/// deleted entry's own tag set joins the queue, continuing the cascade. In
/// global mode the scan pattern crosses key prefixes. Key parse failures are
/// reported through `on_error` and skipped.
pub(crate) async fn delete_tag_sets<F>(
    conn: &mut ConnectionManager,
    cancel: &CancellationToken,
    key_prefix: &str,
    seeds: Vec<Vec<String>>,
    global: bool,
    on_error: &ErrorCallback,
    mut on_deleted: F,
) -> Result<()>
where
    F: FnMut(&DeletedEntry),
{
    let mut queue: VecDeque<Vec<String>> = VecDeque::new();
    let mut seen: HashSet<Vec<String>> = HashSet::new();
    for tags in seeds {
        if let Some(tags) = normalize_tag_set(tags) {
            if seen.insert(tags.clone()) {
                queue.push_back(tags);
            }
        }
    }

    while let Some(tags) = queue.pop_front() {
        if cancel.is_cancelled() {
            break;
        }
        let pattern = keys::tags_pattern(key_prefix, &tags, global);
        let mut scan = Scan::new(conn.clone(), pattern, cancel.clone());
        while let Some(page) = scan.next_page().await? {
            for tags_key in page {
                let parsed = match keys::parse_tags_key(&tags_key) {
                    Ok(parsed) => parsed,
                    Err(error) => {
                        on_error(&error);
                        continue;
                    }
                };
                let metadata_key: Option<String> = conn
                    .hget(&tags_key, F_METADATA_KEY)
                    .await
                    .map_err(backend_err)?;
                let Some(metadata_key) = metadata_key else {
                    // stranded tag row
                    let _: () = conn.del(&tags_key).await.map_err(backend_err)?;
                    continue;
                };
                let metadata_key = keys::add_key_prefix(&metadata_key, &parsed.key_prefix);
                match delete_entry_rows(conn, &metadata_key).await {
                    Ok(Some(deleted)) => {
                        if let Some(next) = normalize_tag_set(deleted.tags.clone()) {
                            if seen.insert(next.clone()) {
                                queue.push_back(next);
                            }
                        }
                        on_deleted(&deleted);
                    }
                    Ok(None) => {
                        let _: () = conn.del(&tags_key).await.map_err(backend_err)?;
                    }
                    Err(error) => on_error(&error),
                }
            }
        }
    }
    Ok(())
}

/// Sort, dedupe and drop empty tags; `None` when nothing remains.
pub(crate) fn normalize_tag_set(mut tags: Vec<String>) -> Option<Vec<String>> {
    tags.retain(|tag| !tag.is_empty());
    if tags.is_empty() {
        return None;
    }
    tags.sort();
    tags.dedup();
    Some(tags)
}
