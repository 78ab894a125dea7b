//! Relay lifecycle types and shared status.
//!
//! # State Transitions
//!
//! ```text
//!                 start()
//! Created ──────────────────→ Connecting
//!    │                            │
//!    │ (never started)            │ (endpoints reachable)
//!    ↓                            ↓
//! Stopped                     Running ←───────────────┐
//!    ↑                            │                   │
//!    │                  shutdown()│    (recoverable   │
//!    │                            ↓     error)        │
//!    └─────────────── ShuttingDown ───────────────────┘
//!                            │
//!                  (retry budget exhausted,
//!                   unreachable endpoints)
//!                            ↓
//!                         Failed
//! ```

use std::sync::atomic::{AtomicI64, AtomicUsize, Ordering};

/// State of the relay pipeline.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RelayState {
    /// Created but not started.
    Created,
    /// Connecting to Mongo and Redis, resolving the start timestamp.
    Connecting,
    /// Tailing the oplog and publishing.
    Running,
    /// Stop signal sent; draining in-flight publications.
    ShuttingDown,
    /// Stopped cleanly. Safe to drop.
    Stopped,
    /// Unrecoverable failure (startup error or exhausted retry budget).
    /// The supervisor should restart from the persisted checkpoint.
    Failed,
}

impl std::fmt::Display for RelayState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            RelayState::Created => write!(f, "Created"),
            RelayState::Connecting => write!(f, "Connecting"),
            RelayState::Running => write!(f, "Running"),
            RelayState::ShuttingDown => write!(f, "ShuttingDown"),
            RelayState::Stopped => write!(f, "Stopped"),
            RelayState::Failed => write!(f, "Failed"),
        }
    }
}

/// Live counters shared between the tailer, the publisher, and
/// [`health_check()`](crate::OplogRelay::health_check). No network I/O;
/// everything here is atomics.
#[derive(Debug, Default)]
pub struct RelayStatus {
    /// Unix seconds of the last successful oplog read; 0 = never.
    last_oplog_read: AtomicI64,
    /// Publisher partitions currently sleeping in backoff.
    partitions_in_backoff: AtomicUsize,
}

impl RelayStatus {
    pub fn mark_oplog_read(&self) {
        self.last_oplog_read
            .store(chrono::Utc::now().timestamp(), Ordering::Relaxed);
    }

    /// Seconds since the last successful oplog read, or `None` if no
    /// entry has been read yet.
    pub fn seconds_since_oplog_read(&self) -> Option<i64> {
        let last = self.last_oplog_read.load(Ordering::Relaxed);
        if last == 0 {
            return None;
        }
        Some((chrono::Utc::now().timestamp() - last).max(0))
    }

    pub fn enter_backoff(&self) {
        let count = self.partitions_in_backoff.fetch_add(1, Ordering::Relaxed) + 1;
        crate::metrics::set_partitions_in_backoff(count);
    }

    pub fn leave_backoff(&self) {
        let previous = self.partitions_in_backoff.fetch_sub(1, Ordering::Relaxed);
        crate::metrics::set_partitions_in_backoff(previous.saturating_sub(1));
    }

    pub fn partitions_in_backoff(&self) -> usize {
        self.partitions_in_backoff.load(Ordering::Relaxed)
    }
}

/// Snapshot of relay health for monitoring endpoints.
///
/// `ready` means the pipeline is up; `healthy` additionally requires that
/// the tailer has read recently and no partition is stuck in backoff.
#[derive(Debug, Clone)]
pub struct HealthCheck {
    pub state: RelayState,
    pub ready: bool,
    pub healthy: bool,
    /// Seconds since the last successful oplog read; `None` before the
    /// first read.
    pub seconds_since_oplog_read: Option<i64>,
    pub partitions_in_backoff: usize,
}
