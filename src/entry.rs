// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog entry model and transaction expansion.
//!
//! Field layout of the wire record (`local.oplog.rs`):
//!
//! - `ts`: the time the entry was created (BSON timestamp)
//! - `op`: operation type - `"i"` insert, `"u"` update, `"d"` delete,
//!   `"c"` command, `"n"` noop
//! - `ns`: namespace `"<db>.<collection>"`; `"admin.$cmd"` for commands
//! - `o`: the document payload, or the command body
//! - `o2`: for updates, the document selector carrying the target `_id`
//!
//! A multi-document transaction appears in the oplog as a single command
//! entry whose body carries `applyOps: [entry, ...]`. [`expand`] flattens
//! such an entry into its children, each inheriting the outer timestamp,
//! with one `tx_idx` counter spanning the whole expansion so that distinct
//! writes to the same document stay totally ordered.

use crate::timestamp::OplogTimestamp;
use mongodb::bson::{Bson, Document, Timestamp as BsonTimestamp};
use serde::{Deserialize, Serialize};
use tracing::warn;

/// The namespace under which transactions (`applyOps`) appear.
const TRANSACTION_NAMESPACE: &str = "admin.$cmd";

/// An oplog entry as stored in Mongo. Fields the relay does not use
/// (`v`, `h`, `wall`, `lsid`, ...) are ignored on decode.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RawOplogEntry {
    /// Absent on `applyOps` children; they inherit the enclosing entry's
    /// timestamp during expansion.
    #[serde(default = "zero_timestamp")]
    pub ts: BsonTimestamp,
    pub op: String,
    #[serde(default)]
    pub ns: String,
    #[serde(default)]
    pub o: Document,
    #[serde(default)]
    pub o2: Option<Document>,
}

fn zero_timestamp() -> BsonTimestamp {
    BsonTimestamp {
        time: 0,
        increment: 0,
    }
}

/// Document mutation kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum OpKind {
    Insert,
    Update,
    Remove,
}

impl OpKind {
    /// The single-letter event code used in published messages.
    pub fn event_code(&self) -> &'static str {
        match self {
            OpKind::Insert => "i",
            OpKind::Update => "u",
            OpKind::Remove => "d",
        }
    }
}

/// A single document mutation, decoded and driver-agnostic.
///
/// Invariants: `doc_id` is never BSON null; `database` and `collection`
/// are both nonempty; within one [`expand`] call, `tx_idx` values are
/// strictly increasing and dense starting at zero.
#[derive(Debug, Clone, PartialEq)]
pub struct ParsedEntry {
    pub operation: OpKind,
    pub timestamp: OplogTimestamp,
    pub namespace: String,
    pub database: String,
    pub collection: String,
    /// The `_id` of the affected document. Any BSON value admissible as a
    /// Mongo `_id`.
    pub doc_id: Bson,
    /// Full document for inserts, `$set`/`$unset` shape (or replacement)
    /// for updates, `{_id: ...}` for deletes.
    pub data: Document,
    /// 0-based index within a transaction; 0 for plain entries.
    pub tx_idx: u32,
}

/// Parse `"<db>.<collection>"`. Splits on the first dot only, so
/// `"db.coll.sub"` yields `("db", "coll.sub")` and `"db"` yields
/// `("db", "")`.
pub fn parse_namespace(namespace: &str) -> (&str, &str) {
    match namespace.split_once('.') {
        Some((db, coll)) => (db, coll),
        None => (namespace, ""),
    }
}

/// Expand a raw entry into zero or more parsed mutations.
///
/// Plain inserts/updates/deletes yield one entry; `applyOps` commands
/// yield one entry per publishable child; noops and other commands yield
/// none. Returns the parsed entries and the count of children that could
/// not be decoded (missing `_id`, malformed namespace, undecodable
/// transaction data) - those are skipped so a poison entry cannot stall
/// the pipeline.
pub fn expand(raw: &RawOplogEntry) -> (Vec<ParsedEntry>, usize) {
    let mut out = Vec::new();
    let mut tx_idx = 0u32;
    let mut errors = 0usize;
    expand_into(raw, raw.ts.into(), &mut tx_idx, &mut errors, &mut out);
    (out, errors)
}

fn expand_into(
    raw: &RawOplogEntry,
    timestamp: OplogTimestamp,
    tx_idx: &mut u32,
    errors: &mut usize,
    out: &mut Vec<ParsedEntry>,
) {
    let operation = match raw.op.as_str() {
        "i" => OpKind::Insert,
        "u" => OpKind::Update,
        "d" => OpKind::Remove,
        "c" => {
            expand_transaction(raw, timestamp, tx_idx, errors, out);
            return;
        }
        // Noops and anything unrecognized carry no document mutation.
        _ => return,
    };

    let (database, collection) = parse_namespace(&raw.ns);
    if database.is_empty() || collection.is_empty() {
        warn!(ns = %raw.ns, op = %raw.op, "oplog entry with malformed namespace, skipping");
        *errors += 1;
        return;
    }

    // Updates carry the target _id in the selector (o2); the $-style
    // update body itself has no _id.
    let doc_id = match operation {
        OpKind::Update => raw.o2.as_ref().and_then(|sel| sel.get("_id")).cloned(),
        _ => raw.o.get("_id").cloned(),
    };
    let doc_id = match doc_id {
        Some(id) if id != Bson::Null => id,
        _ => {
            warn!(
                ns = %raw.ns,
                op = %raw.op,
                "oplog entry without a document _id, skipping"
            );
            *errors += 1;
            return;
        }
    };

    out.push(ParsedEntry {
        operation,
        timestamp,
        namespace: raw.ns.clone(),
        database: database.to_string(),
        collection: collection.to_string(),
        doc_id,
        data: raw.o.clone(),
        tx_idx: *tx_idx,
    });
    *tx_idx += 1;
}

fn expand_transaction(
    raw: &RawOplogEntry,
    timestamp: OplogTimestamp,
    tx_idx: &mut u32,
    errors: &mut usize,
    out: &mut Vec<ParsedEntry>,
) {
    if raw.ns != TRANSACTION_NAMESPACE {
        return;
    }

    let ops = match raw.o.get("applyOps") {
        Some(Bson::Array(ops)) => ops,
        Some(other) => {
            warn!(
                kind = ?other.element_type(),
                "applyOps is not an array, skipping transaction"
            );
            *errors += 1;
            return;
        }
        // A non-transaction admin command; nothing to publish.
        None => return,
    };

    for op in ops {
        let child_doc = match op {
            Bson::Document(doc) => doc,
            other => {
                warn!(
                    kind = ?other.element_type(),
                    "applyOps element is not a document, skipping"
                );
                *errors += 1;
                continue;
            }
        };
        match mongodb::bson::from_document::<RawOplogEntry>(child_doc.clone()) {
            // Children share the outer timestamp and the outer tx_idx
            // counter, so ordering is total across the transaction.
            Ok(child) => expand_into(&child, timestamp, tx_idx, errors, out),
            Err(e) => {
                warn!(error = %e, "undecodable applyOps element, skipping");
                *errors += 1;
            }
        }
    }
}
