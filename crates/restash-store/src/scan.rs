//! Cursor-paged, cancellable MATCH scans

use redis::aio::ConnectionManager;
use tokio_util::sync::CancellationToken;

use restash_core::Result;

use crate::connection::backend_err;

const SCAN_COUNT: usize = 100;

/// One MATCH-pattern scan over the keyspace. Pages are pulled on demand so
/// callers can stop at the first match; a cancelled token ends the scan at
/// the next page boundary. Pages are not snapshots: keys written during the
/// scan may or may not appear.
pub(crate) struct Scan {
    conn: ConnectionManager,
    pattern: String,
    cursor: u64,
    done: bool,
    cancel: CancellationToken,
}

impl Scan {
    pub(crate) fn new(
        conn: ConnectionManager,
        pattern: impl Into<String>,
        cancel: CancellationToken,
    ) -> Self {
        Self {
            conn,
            pattern: pattern.into(),
            cursor: 0,
            done: false,
            cancel,
        }
    }

    /// Next page of matching keys, or `None` once the cursor wraps or the
    /// scan is cancelled.
    pub(crate) async fn next_page(&mut self) -> Result<Option<Vec<String>>> {
        if self.done || self.cancel.is_cancelled() {
            return Ok(None);
        }
        let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
            .cursor_arg(self.cursor)
            .arg("MATCH")
            .arg(&self.pattern)
            .arg("COUNT")
            .arg(SCAN_COUNT)
            .query_async(&mut self.conn)
            .await
            .map_err(backend_err)?;
        self.cursor = next_cursor;
        if next_cursor == 0 {
            self.done = true;
        }
        Ok(Some(keys))
    }
}
