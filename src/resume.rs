// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Decides where tailing starts after a (re)start.
//!
//! Policy, in order:
//!
//! 1. A checkpoint in Redis whose wall-clock component is within
//!    `max_catch_up` of now: resume from its timestamp. The normal path.
//! 2. A checkpoint older than that: warn and fall through - replaying an
//!    unbounded backlog is worse than a gap.
//! 3. The newest oplog entry (`sort {$natural: -1} limit 1`): start from
//!    "now" on a fresh deployment.
//! 4. Mongo unreachable: synthesize a timestamp from the wall clock.
//!
//! Redis errors other than "key missing" are logged but never fatal -
//! tailing must still be able to start.

use crate::timestamp::{checkpoint_key, Checkpoint, OplogTimestamp};
use mongodb::bson::{doc, Document};
use mongodb::options::FindOneOptions;
use mongodb::Collection;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::time::Duration;
use tracing::{error, info, warn};

/// Resolve the oplog timestamp tailing should begin from.
pub async fn resolve_start_timestamp(
    redis: &mut ConnectionManager,
    oplog: &Collection<Document>,
    prefix: &str,
    max_catch_up: Duration,
    query_timeout: Duration,
) -> OplogTimestamp {
    let key = checkpoint_key(prefix);
    let raw: Option<String> = match redis.get(&key).await {
        Ok(value) => value,
        Err(e) => {
            error!(
                error = %e,
                key = %key,
                "Error querying Redis for the last processed entry, will start from end of oplog"
            );
            None
        }
    };

    if let Some(ts) = start_from_checkpoint(raw.as_deref(), max_catch_up) {
        return ts;
    }

    match latest_oplog_timestamp(oplog, query_timeout).await {
        Some(ts) => {
            info!(timestamp = %ts, "Starting tailing from end of oplog");
            ts
        }
        None => {
            let ts = OplogTimestamp::from_wall_clock();
            error!(
                timestamp = %ts,
                "Could not read the latest oplog entry, starting from wall clock"
            );
            ts
        }
    }
}

/// Apply the checkpoint freshness policy to a raw Redis value.
fn start_from_checkpoint(raw: Option<&str>, max_catch_up: Duration) -> Option<OplogTimestamp> {
    let raw = raw?;

    let checkpoint = match Checkpoint::decode(raw) {
        Ok(cp) => cp,
        Err(e) => {
            warn!(error = %e, "Ignoring malformed checkpoint");
            return None;
        }
    };

    if checkpoint.is_fresh(max_catch_up) {
        info!(
            timestamp = %checkpoint.timestamp,
            written_at = checkpoint.wall_time,
            "Found last processed entry, resuming oplog tailing"
        );
        return Some(checkpoint.timestamp);
    }

    warn!(
        timestamp = %checkpoint.timestamp,
        written_at = checkpoint.wall_time,
        "Last processed entry is too far in the past, will start from end of oplog"
    );
    None
}

/// Timestamp of the newest entry in the oplog, if it can be read in time.
async fn latest_oplog_timestamp(
    oplog: &Collection<Document>,
    query_timeout: Duration,
) -> Option<OplogTimestamp> {
    let options = FindOneOptions::builder()
        .sort(doc! {"$natural": -1})
        .build();

    let found = match tokio::time::timeout(query_timeout, oplog.find_one(doc! {}, options)).await {
        Ok(Ok(found)) => found,
        Ok(Err(e)) => {
            error!(error = %e, "Error querying the latest oplog entry");
            return None;
        }
        Err(_) => {
            error!("Timed out querying the latest oplog entry");
            return None;
        }
    };

    match found {
        Some(entry) => match entry.get_timestamp("ts") {
            Ok(ts) => Some(ts.into()),
            Err(e) => {
                error!(error = %e, "Latest oplog entry has no ts field");
                None
            }
        },
        None => {
            warn!("Oplog is empty");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MINUTE: Duration = Duration::from_secs(60);

    #[test]
    fn test_missing_checkpoint_falls_through() {
        assert_eq!(start_from_checkpoint(None, MINUTE), None);
    }

    #[test]
    fn test_fresh_checkpoint_resumes() {
        let cp = Checkpoint::now(OplogTimestamp::new(500, 2));
        let resumed = start_from_checkpoint(Some(&cp.encode()), MINUTE);
        assert_eq!(resumed, Some(OplogTimestamp::new(500, 2)));
    }

    #[test]
    fn test_stale_checkpoint_falls_through() {
        let stale = Checkpoint::new(
            OplogTimestamp::new(500, 2),
            chrono::Utc::now().timestamp() - 3600,
        );
        assert_eq!(start_from_checkpoint(Some(&stale.encode()), MINUTE), None);
    }

    #[test]
    fn test_zero_catch_up_forces_jump_to_end() {
        let cp = Checkpoint::now(OplogTimestamp::new(500, 2));
        assert_eq!(
            start_from_checkpoint(Some(&cp.encode()), Duration::ZERO),
            None
        );
    }

    #[test]
    fn test_malformed_checkpoint_falls_through() {
        assert_eq!(start_from_checkpoint(Some("garbage"), MINUTE), None);
        assert_eq!(start_from_checkpoint(Some(""), MINUTE), None);
    }
}
