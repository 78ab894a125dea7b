// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Turns parsed oplog entries into Redis publications.
//!
//! For each publishable mutation the transformer produces one
//! [`Publication`] carrying:
//!
//! - the channel fan-out, in order: `<prefix><db>`, `<prefix><db>.<coll>`,
//!   and the per-document channel `<prefix><db>.<coll>::<docID>`;
//! - a compact JSON message `{ev, ns, id, fields}` where `ev` is the
//!   event code (`i`/`u`/`d`), `id` is the document id in relaxed
//!   Extended JSON, and `fields` are the top-level field names the
//!   mutation touched;
//! - the source oplog timestamp and transaction index, used downstream
//!   for checkpointing and ordering.
//!
//! Entries in Mongo-internal namespaces (and anything the configured
//! allow/deny rules exclude) transform to `None` - ignored by policy, not
//! an error.

use crate::config::FilterConfig;
use crate::entry::{OpKind, ParsedEntry};
use crate::error::{RelayError, Result};
use crate::timestamp::OplogTimestamp;
use mongodb::bson::{doc, Bson};
use serde::Serialize;
use sha2::{Digest, Sha256};

/// A message ready to be published, as handed to the Redis publisher.
#[derive(Debug, Clone, PartialEq)]
pub struct Publication {
    /// Channels to publish on, most general first.
    pub channels: Vec<String>,
    /// Serialized message payload.
    pub msg: Vec<u8>,
    /// Timestamp of the source oplog entry, used for checkpointing.
    pub timestamp: OplogTimestamp,
    /// Index within the source transaction; 0 outside transactions.
    pub tx_idx: u32,
    /// The affected document's `_id`, used for partitioning.
    pub doc_id: Bson,
}

impl Publication {
    /// The partition this publication belongs to, in `0..partitions`.
    ///
    /// Stable across processes and restarts (SHA-256 of the canonical
    /// BSON encoding of the id), so a document always lands in the same
    /// partition and its publications stay serialized.
    pub fn partition(&self, partitions: usize) -> usize {
        if partitions <= 1 {
            return 0;
        }
        let bytes = mongodb::bson::to_vec(&doc! {"_id": self.doc_id.clone()})
            .unwrap_or_else(|_| format!("{:?}", self.doc_id).into_bytes());
        let digest = Sha256::digest(&bytes);
        let mut prefix = [0u8; 8];
        prefix.copy_from_slice(&digest[..8]);
        (u64::from_be_bytes(prefix) % partitions as u64) as usize
    }
}

/// The published message shape. Field order is part of the wire format.
#[derive(Debug, Serialize)]
struct Message<'a> {
    ev: &'static str,
    ns: &'a str,
    id: serde_json::Value,
    fields: Vec<String>,
}

/// Converts parsed entries into publications, applying namespace policy.
#[derive(Debug, Clone)]
pub struct Transformer {
    prefix: String,
    filter: FilterConfig,
}

impl Transformer {
    pub fn new(prefix: impl Into<String>, filter: FilterConfig) -> Self {
        Self {
            prefix: prefix.into(),
            filter,
        }
    }

    /// Transform one entry. `Ok(None)` means ignored by policy.
    pub fn transform(&self, entry: &ParsedEntry) -> Result<Option<Publication>> {
        if self.filter.ignores(&entry.database, &entry.collection) {
            return Ok(None);
        }

        let fields = changed_fields(entry)?;
        let id_json = entry.doc_id.clone().into_relaxed_extjson();

        let message = Message {
            ev: entry.operation.event_code(),
            ns: &entry.namespace,
            id: id_json,
            fields,
        };
        let msg = serde_json::to_vec(&message)
            .map_err(|e| RelayError::EntryParse(format!("encoding message: {}", e)))?;

        let doc_channel = format!(
            "{}{}::{}",
            self.prefix,
            entry.namespace,
            channel_id_fragment(&entry.doc_id)
        );
        let channels = vec![
            format!("{}{}", self.prefix, entry.database),
            format!("{}{}", self.prefix, entry.namespace),
            doc_channel,
        ];

        Ok(Some(Publication {
            channels,
            msg,
            timestamp: entry.timestamp,
            tx_idx: entry.tx_idx,
            doc_id: entry.doc_id.clone(),
        }))
    }
}

/// Top-level field names touched by the mutation.
///
/// - insert: all top-level fields of the document
/// - `$set`/`$unset` update: the keys beneath those operators
/// - replacement update (no `$`-operator keys): all top-level fields
/// - delete: empty
fn changed_fields(entry: &ParsedEntry) -> Result<Vec<String>> {
    match entry.operation {
        OpKind::Remove => Ok(Vec::new()),
        OpKind::Insert => Ok(entry.data.keys().cloned().collect()),
        OpKind::Update => {
            let is_operator_update = entry.data.keys().any(|k| k.starts_with('$'));
            if !is_operator_update {
                return Ok(entry.data.keys().cloned().collect());
            }

            let mut fields = Vec::new();
            for operator in ["$set", "$unset"] {
                match entry.data.get(operator) {
                    Some(Bson::Document(inner)) => {
                        fields.extend(inner.keys().cloned());
                    }
                    Some(other) => {
                        return Err(RelayError::EntryParse(format!(
                            "{} is not a document (got {:?})",
                            operator,
                            other.element_type()
                        )));
                    }
                    None => {}
                }
            }
            Ok(fields)
        }
    }
}

/// Render a document id for use in a channel name.
///
/// Strings are used verbatim and ObjectIds as their hex form - the two
/// cases subscribers key on. Anything else falls back to compact relaxed
/// Extended JSON, which is deterministic for a given id.
fn channel_id_fragment(id: &Bson) -> String {
    match id {
        Bson::String(s) => s.clone(),
        Bson::ObjectId(oid) => oid.to_hex(),
        other => {
            let json = other.clone().into_relaxed_extjson();
            serde_json::to_string(&json).unwrap_or_else(|_| json.to_string())
        }
    }
}

/// How a raw entry's expansion went, for metric accounting.
///
/// `Error` wins over everything (some child failed), then `Processed`
/// (at least one publication emitted), then `Ignored`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EntryStatus {
    Ignored,
    Processed,
    Error,
}

impl EntryStatus {
    pub fn from_counts(published: usize, errors: usize) -> Self {
        if errors > 0 {
            EntryStatus::Error
        } else if published > 0 {
            EntryStatus::Processed
        } else {
            EntryStatus::Ignored
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            EntryStatus::Ignored => "ignored",
            EntryStatus::Processed => "processed",
            EntryStatus::Error => "error",
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use mongodb::bson::oid::ObjectId;

    fn transformer() -> Transformer {
        Transformer::new("otr:", FilterConfig::default())
    }

    fn insert_entry() -> ParsedEntry {
        ParsedEntry {
            operation: OpKind::Insert,
            timestamp: OplogTimestamp::new(100, 1),
            namespace: "app.users".to_string(),
            database: "app".to_string(),
            collection: "users".to_string(),
            doc_id: Bson::String("u1".to_string()),
            data: doc! {"_id": "u1", "name": "a"},
            tx_idx: 0,
        }
    }

    #[test]
    fn test_transform_insert() {
        let publication = transformer().transform(&insert_entry()).unwrap().unwrap();

        assert_eq!(
            publication.channels,
            vec!["otr:app", "otr:app.users", "otr:app.users::u1"]
        );
        assert_eq!(
            String::from_utf8(publication.msg).unwrap(),
            r#"{"ev":"i","ns":"app.users","id":"u1","fields":["_id","name"]}"#
        );
        assert_eq!(publication.timestamp, OplogTimestamp::new(100, 1));
        assert_eq!(publication.tx_idx, 0);
    }

    #[test]
    fn test_transform_set_update() {
        let entry = ParsedEntry {
            operation: OpKind::Update,
            data: doc! {"$set": {"name": "b"}},
            timestamp: OplogTimestamp::new(101, 1),
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(publication.msg).unwrap(),
            r#"{"ev":"u","ns":"app.users","id":"u1","fields":["name"]}"#
        );
    }

    #[test]
    fn test_transform_set_and_unset_update() {
        let entry = ParsedEntry {
            operation: OpKind::Update,
            data: doc! {"$set": {"a": 1, "b": 2}, "$unset": {"c": ""}},
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["fields"], serde_json::json!(["a", "b", "c"]));
    }

    #[test]
    fn test_transform_replacement_update() {
        let entry = ParsedEntry {
            operation: OpKind::Update,
            data: doc! {"name": "b", "age": 3},
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["fields"], serde_json::json!(["name", "age"]));
    }

    #[test]
    fn test_transform_delete_has_empty_fields() {
        let entry = ParsedEntry {
            operation: OpKind::Remove,
            data: doc! {"_id": "u1"},
            timestamp: OplogTimestamp::new(102, 1),
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        assert_eq!(
            String::from_utf8(publication.msg).unwrap(),
            r#"{"ev":"d","ns":"app.users","id":"u1","fields":[]}"#
        );
    }

    #[test]
    fn test_transform_system_namespace_dropped() {
        let entry = ParsedEntry {
            namespace: "app.system.indexes".to_string(),
            collection: "system.indexes".to_string(),
            ..insert_entry()
        };
        assert!(transformer().transform(&entry).unwrap().is_none());
    }

    #[test]
    fn test_transform_internal_database_dropped() {
        for db in ["admin", "local", "config"] {
            let entry = ParsedEntry {
                namespace: format!("{}.things", db),
                database: db.to_string(),
                collection: "things".to_string(),
                ..insert_entry()
            };
            assert!(transformer().transform(&entry).unwrap().is_none());
        }
    }

    #[test]
    fn test_transform_malformed_set_is_error() {
        let entry = ParsedEntry {
            operation: OpKind::Update,
            data: doc! {"$set": "nope"},
            ..insert_entry()
        };
        assert!(transformer().transform(&entry).is_err());
    }

    #[test]
    fn test_transform_objectid_document() {
        let oid = ObjectId::parse_str("507f1f77bcf86cd799439011").unwrap();
        let entry = ParsedEntry {
            doc_id: Bson::ObjectId(oid),
            data: doc! {"_id": oid, "name": "a"},
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        assert_eq!(
            publication.channels[2],
            "otr:app.users::507f1f77bcf86cd799439011"
        );
        // Relaxed Extended JSON keeps the $oid convention in the message.
        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["id"]["$oid"], "507f1f77bcf86cd799439011");
    }

    #[test]
    fn test_transform_numeric_id() {
        let entry = ParsedEntry {
            doc_id: Bson::Int32(42),
            data: doc! {"_id": 42},
            ..insert_entry()
        };

        let publication = transformer().transform(&entry).unwrap().unwrap();
        assert_eq!(publication.channels[2], "otr:app.users::42");
        let msg: serde_json::Value = serde_json::from_slice(&publication.msg).unwrap();
        assert_eq!(msg["id"], serde_json::json!(42));
    }

    #[test]
    fn test_partition_stable_and_in_range() {
        let publication = transformer().transform(&insert_entry()).unwrap().unwrap();

        let p = publication.partition(8);
        assert!(p < 8);
        // Stable: same id, same partition, every time.
        for _ in 0..10 {
            assert_eq!(publication.partition(8), p);
        }
        // Single partition degenerates to 0.
        assert_eq!(publication.partition(1), 0);
    }

    #[test]
    fn test_partition_spreads_documents() {
        // With plenty of distinct ids, more than one partition is hit.
        let mut seen = std::collections::HashSet::new();
        for i in 0..64 {
            let entry = ParsedEntry {
                doc_id: Bson::String(format!("doc-{}", i)),
                data: doc! {"_id": format!("doc-{}", i)},
                ..insert_entry()
            };
            let publication = transformer().transform(&entry).unwrap().unwrap();
            seen.insert(publication.partition(8));
        }
        assert!(seen.len() > 1);
    }

    #[test]
    fn test_entry_status_from_counts() {
        assert_eq!(EntryStatus::from_counts(0, 0), EntryStatus::Ignored);
        assert_eq!(EntryStatus::from_counts(2, 0), EntryStatus::Processed);
        assert_eq!(EntryStatus::from_counts(2, 1), EntryStatus::Error);
        assert_eq!(EntryStatus::from_counts(0, 1), EntryStatus::Error);
    }

    #[test]
    fn test_entry_status_strings() {
        assert_eq!(EntryStatus::Ignored.as_str(), "ignored");
        assert_eq!(EntryStatus::Processed.as_str(), "processed");
        assert_eq!(EntryStatus::Error.as_str(), "error");
    }
}
