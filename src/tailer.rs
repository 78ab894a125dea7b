// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog tailing: cursor lifecycle, reconnection, and emission.
//!
//! The tailer owns the single ordered read stream over `local.oplog.rs`.
//! It issues a tailable-await find filtered on `{ts: {$gt: start}}` sorted
//! by `$natural`, and classifies every read:
//!
//! | Outcome | Action |
//! |---------|--------|
//! | Document decoded | Transform, emit, advance `last_timestamp` |
//! | Read deadline elapsed | Reissue the find from `last_timestamp` |
//! | Server error 136/280/286 | Position lost: reissue from `last_timestamp` |
//! | Any other error | Fatal for this cursor: restart after a fixed delay |
//! | Stream end without error | Anomalous: treated as the fatal case |
//!
//! Emission order matches oplog `$natural` order, with transactions
//! expanded in place, so per-document ordering holds by construction. The
//! publication channel is bounded; when the publisher falls behind, the
//! `send` blocks and oplog reading throttles instead of growing memory.
//!
//! # Graceful Shutdown
//!
//! The stop signal is honored both between reads and during a blocked
//! read (via `tokio::select!`). When the tailer returns it drops its
//! sender, closing the publication channel; the publisher drains what is
//! in flight and exits.

use crate::entry::{self, RawOplogEntry};
use crate::error::{is_position_lost, RelayError, Result};
use crate::metrics;
use crate::pipeline::RelayStatus;
use crate::timestamp::OplogTimestamp;
use crate::transform::{EntryStatus, Publication, Transformer};
use futures::StreamExt;
use mongodb::bson::{doc, Document, Timestamp as BsonTimestamp};
use mongodb::options::{CursorType, FindOptions};
use mongodb::{Collection, Cursor};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, error, info, warn};

/// Delay before reopening the cursor after a fatal cursor error.
const REQUERY_DELAY: Duration = Duration::from_secs(1);

/// Database label for entries that never decoded far enough to name one.
const NO_DATABASE: &str = "(no database)";

/// How one pass over a cursor ended.
enum TailEnd {
    /// The stop signal fired.
    Shutdown,
    /// The cursor failed; the outer loop restarts after [`REQUERY_DELAY`].
    CursorLost,
    /// The publication channel closed underneath us (publisher gone).
    OutputClosed,
}

/// Persistently tails the oplog, handling reconnection and resumption.
pub struct OplogTailer {
    oplog: Collection<Document>,
    transformer: Transformer,
    query_timeout: Duration,
    status: Arc<RelayStatus>,
    /// Timestamp of the last raw entry read, advanced even for ignored and
    /// errored entries so a reissued query never replays them.
    last_timestamp: OplogTimestamp,
}

impl OplogTailer {
    pub fn new(
        oplog: Collection<Document>,
        transformer: Transformer,
        start: OplogTimestamp,
        query_timeout: Duration,
        status: Arc<RelayStatus>,
    ) -> Self {
        Self {
            oplog,
            transformer,
            query_timeout,
            status,
            last_timestamp: start,
        }
    }

    /// Tail until the stop signal fires. Does not return on recoverable
    /// errors.
    pub async fn run(
        mut self,
        out: mpsc::Sender<Publication>,
        mut shutdown: watch::Receiver<bool>,
    ) {
        info!(start = %self.last_timestamp, "Starting oplog tailing");

        loop {
            if *shutdown.borrow() {
                break;
            }

            match self.tail_once(&out, &mut shutdown).await {
                TailEnd::Shutdown => break,
                TailEnd::OutputClosed => {
                    warn!("Publication channel closed, stopping oplog tailing");
                    break;
                }
                TailEnd::CursorLost => {
                    warn!(
                        last = %self.last_timestamp,
                        "Oplog tailing stopped prematurely, retrying after delay"
                    );
                    tokio::select! {
                        _ = tokio::time::sleep(REQUERY_DELAY) => {}
                        _ = shutdown.changed() => {
                            if *shutdown.borrow() {
                                break;
                            }
                        }
                    }
                }
            }
        }

        info!("Oplog tailing ended");
        // Dropping `out` closes the channel; the publisher drains and exits.
    }

    /// One cursor's lifetime: open, read until it dies or we are stopped.
    async fn tail_once(
        &mut self,
        out: &mpsc::Sender<Publication>,
        shutdown: &mut watch::Receiver<bool>,
    ) -> TailEnd {
        let mut cursor = match self.open_cursor().await {
            Ok(cursor) => cursor,
            Err(e) => {
                error!(error = %e, "Error issuing tail query");
                return TailEnd::CursorLost;
            }
        };

        loop {
            if *shutdown.borrow() {
                info!("Received stop, aborting oplog tailing");
                return TailEnd::Shutdown;
            }

            let read = tokio::select! {
                biased;

                _ = shutdown.changed() => {
                    if *shutdown.borrow() {
                        info!("Received stop, aborting oplog tailing");
                        return TailEnd::Shutdown;
                    }
                    continue;
                }

                read = tokio::time::timeout(self.query_timeout, cursor.next()) => read,
            };

            match read {
                Ok(Some(Ok(document))) => {
                    if self.handle_document(document, out).await.is_err() {
                        return TailEnd::OutputClosed;
                    }
                }
                Err(_) => {
                    // Deadline elapsed with no data. The await cursor has
                    // nothing for us; pick up from the last position.
                    debug!(last = %self.last_timestamp, "Oplog cursor timed out, reissuing query");
                    match self.open_cursor().await {
                        Ok(reopened) => cursor = reopened,
                        Err(e) => {
                            error!(error = %e, "Error reissuing tail query");
                            return TailEnd::CursorLost;
                        }
                    }
                }
                Ok(Some(Err(e))) if is_position_lost(&e) => {
                    info!(
                        last = %self.last_timestamp,
                        "Oplog cursor position lost, reissuing query"
                    );
                    match self.open_cursor().await {
                        Ok(reopened) => cursor = reopened,
                        Err(e) => {
                            error!(error = %e, "Error reissuing tail query");
                            return TailEnd::CursorLost;
                        }
                    }
                }
                Ok(Some(Err(e))) => {
                    error!(error = %e, "Error from oplog cursor");
                    return TailEnd::CursorLost;
                }
                Ok(None) => {
                    error!("Got no data from cursor, but also no error. This is unexpected; restarting query");
                    return TailEnd::CursorLost;
                }
            }
        }
    }

    async fn open_cursor(&self) -> Result<Cursor<Document>> {
        let options = FindOptions::builder()
            .sort(doc! {"$natural": 1})
            .cursor_type(CursorType::TailableAwait)
            .max_await_time(self.query_timeout)
            .build();
        let filter = doc! {"ts": {"$gt": BsonTimestamp::from(self.last_timestamp)}};

        tokio::time::timeout(self.query_timeout, self.oplog.find(filter, options))
            .await
            .map_err(|_| RelayError::mongo_msg("find", "timed out issuing tail query"))?
            .map_err(|e| RelayError::mongo("find", e))
    }

    /// Decode, expand, transform, and emit one raw oplog document.
    ///
    /// Returns `Err` only when the publication channel has closed.
    async fn handle_document(
        &mut self,
        document: Document,
        out: &mpsc::Sender<Publication>,
    ) -> std::result::Result<(), OutputClosed> {
        let size = mongodb::bson::to_vec(&document)
            .map(|bytes| bytes.len())
            .unwrap_or(0);

        let raw: RawOplogEntry = match mongodb::bson::from_document(document) {
            Ok(raw) => raw,
            Err(e) => {
                error!(error = %e, "Error decoding oplog entry");
                metrics::record_entry_received(NO_DATABASE, EntryStatus::Error.as_str(), size);
                return Ok(());
            }
        };

        self.last_timestamp = raw.ts.into();
        self.status.mark_oplog_read();

        let (publications, database, errors) = expand_and_transform(&self.transformer, &raw);
        let status = EntryStatus::from_counts(publications.len(), errors);

        for publication in publications {
            if out.send(publication).await.is_err() {
                return Err(OutputClosed);
            }
        }

        metrics::record_entry_received(&database, status.as_str(), size);
        Ok(())
    }
}

/// Marker for "the publisher hung up".
struct OutputClosed;

/// Expand a raw entry (including transactions) and transform every child.
///
/// Returns the publications to emit, the database label for metrics, and
/// the number of children that failed to parse or transform.
fn expand_and_transform(
    transformer: &Transformer,
    raw: &RawOplogEntry,
) -> (Vec<Publication>, String, usize) {
    let (entries, mut errors) = entry::expand(raw);

    let database = entries
        .first()
        .map(|e| e.database.clone())
        .unwrap_or_else(|| NO_DATABASE.to_string());

    let mut publications = Vec::new();
    for parsed in &entries {
        match transformer.transform(parsed) {
            Ok(Some(publication)) => publications.push(publication),
            Ok(None) => {}
            Err(e) => {
                error!(
                    error = %e,
                    namespace = %parsed.namespace,
                    database = %parsed.database,
                    collection = %parsed.collection,
                    "Error processing oplog entry"
                );
                errors += 1;
            }
        }
    }

    (publications, database, errors)
}
