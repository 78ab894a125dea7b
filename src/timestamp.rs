// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Oplog timestamps and the persisted resume checkpoint.
//!
//! An oplog position is a 64-bit composite of `(seconds, ordinal)`, totally
//! ordered lexicographically: seconds first, ordinal as a tiebreaker within
//! a second. The resume checkpoint pairs the last-published position with
//! the wall-clock time of the publish, serialized as
//! `"<seconds>:<ordinal>:<wall-unix>"` so it can live in a single Redis
//! string and be compared by a small server-side script.

use crate::error::{RelayError, Result};
use mongodb::bson::Timestamp as BsonTimestamp;
use std::fmt;
use std::time::Duration;

/// A position in the oplog: `(seconds, ordinal)`.
///
/// Monotonic per replica. The derived ordering is lexicographic, which
/// matches the `$natural` order of the oplog.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Default)]
pub struct OplogTimestamp {
    /// Seconds since the Unix epoch.
    pub seconds: u32,
    /// Ordinal of the operation within that second.
    pub ordinal: u32,
}

impl OplogTimestamp {
    pub fn new(seconds: u32, ordinal: u32) -> Self {
        Self { seconds, ordinal }
    }

    /// The timestamp to start from when neither Redis nor Mongo can tell us
    /// where we left off: the current wall-clock second, ordinal zero.
    pub fn from_wall_clock() -> Self {
        Self {
            seconds: chrono::Utc::now().timestamp().max(0) as u32,
            ordinal: 0,
        }
    }
}

impl fmt::Display for OplogTimestamp {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.seconds, self.ordinal)
    }
}

impl From<BsonTimestamp> for OplogTimestamp {
    fn from(ts: BsonTimestamp) -> Self {
        Self {
            seconds: ts.time,
            ordinal: ts.increment,
        }
    }
}

impl From<OplogTimestamp> for BsonTimestamp {
    fn from(ts: OplogTimestamp) -> Self {
        BsonTimestamp {
            time: ts.seconds,
            increment: ts.ordinal,
        }
    }
}

/// The persisted resume checkpoint: the last-published oplog position plus
/// the wall-clock time it was published at.
///
/// Stored under `<prefix>lastProcessedEntry`. The wall-clock component lets
/// a restarting relay decide whether the checkpoint is recent enough to
/// resume from, or so stale that replaying the backlog would be worse than
/// a gap.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Checkpoint {
    pub timestamp: OplogTimestamp,
    /// Unix seconds at the time the checkpointed publication succeeded.
    pub wall_time: i64,
}

impl Checkpoint {
    pub fn new(timestamp: OplogTimestamp, wall_time: i64) -> Self {
        Self {
            timestamp,
            wall_time,
        }
    }

    /// Checkpoint for `timestamp` stamped with the current wall clock.
    pub fn now(timestamp: OplogTimestamp) -> Self {
        Self::new(timestamp, chrono::Utc::now().timestamp())
    }

    /// Encode as `"<seconds>:<ordinal>:<wall-unix>"`.
    pub fn encode(&self) -> String {
        format!(
            "{}:{}:{}",
            self.timestamp.seconds, self.timestamp.ordinal, self.wall_time
        )
    }

    /// Decode the wire form produced by [`encode`](Self::encode).
    pub fn decode(raw: &str) -> Result<Self> {
        let mut parts = raw.splitn(3, ':');
        let seconds = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| malformed(raw))?;
        let ordinal = parts
            .next()
            .and_then(|p| p.parse::<u32>().ok())
            .ok_or_else(|| malformed(raw))?;
        let wall_time = parts
            .next()
            .and_then(|p| p.parse::<i64>().ok())
            .ok_or_else(|| malformed(raw))?;
        Ok(Self {
            timestamp: OplogTimestamp::new(seconds, ordinal),
            wall_time,
        })
    }

    /// Whether the checkpoint was written within `max_catch_up` of `now`.
    ///
    /// A `max_catch_up` of zero makes every past checkpoint stale, forcing
    /// a jump to the end of the oplog.
    pub fn is_fresh_at(&self, now_unix: i64, max_catch_up: Duration) -> bool {
        now_unix - self.wall_time < max_catch_up.as_secs() as i64
    }

    /// [`is_fresh_at`](Self::is_fresh_at) against the current wall clock.
    pub fn is_fresh(&self, max_catch_up: Duration) -> bool {
        self.is_fresh_at(chrono::Utc::now().timestamp(), max_catch_up)
    }
}

fn malformed(raw: &str) -> RelayError {
    RelayError::Internal(format!("malformed checkpoint: {:?}", raw))
}

/// The Redis key the checkpoint is stored under.
///
/// The prefix carries its own separator (e.g. `"otr:"`), matching the
/// channel naming scheme.
pub fn checkpoint_key(prefix: &str) -> String {
    format!("{}lastProcessedEntry", prefix)
}
