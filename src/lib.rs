//! # Oplog Relay
//!
//! A change-data-capture bridge from a MongoDB replica set to Redis
//! pub/sub. It tails `local.oplog.rs`, turns each committed mutation into
//! a small message naming the affected document and its changed fields,
//! and publishes that message so downstream consumers (notably
//! Meteor-style reactive servers) can invalidate caches without polling
//! Mongo.
//!
//! ## Architecture
//!
//! A single producer feeds a bounded queue drained by a partitioned
//! consumer:
//!
//! ```text
//! ┌──────────────────────────────────────────────────────────────────────────┐
//! │                               oplog-relay                                │
//! │                                                                          │
//! │  ┌──────────────┐    ┌─────────────┐    ┌─────────────────────────────┐  │
//! │  │ OplogTailer  │───►│ Transformer │───►│ bounded channel             │  │
//! │  │ (local.      │    │ (filter,    │    │ (backpressure: full queue   │  │
//! │  │  oplog.rs)   │    │  fields,    │    │  throttles oplog reads)     │  │
//! │  └──────────────┘    │  channels)  │    └──────────────┬──────────────┘  │
//! │         ▲            └─────────────┘                   ▼                 │
//! │         │                               ┌─────────────────────────────┐  │
//! │  ┌──────────────┐                       │ RedisPublisher              │  │
//! │  │ resume       │◄───── checkpoint ─────│ (N partitions by docID,     │  │
//! │  │ (start ts)   │       in Redis        │  PUBLISH + CAS checkpoint)  │  │
//! │  └──────────────┘                       └─────────────────────────────┘  │
//! └──────────────────────────────────────────────────────────────────────────┘
//! ```
//!
//! ## Delivery guarantees
//!
//! - **At-least-once**: the checkpoint advances only after a successful
//!   publish, so anything unacknowledged at a crash is re-emitted on
//!   restart. Exactly-once is explicitly not attempted.
//! - **Per-document order**: the oplog is read single-threaded in
//!   `$natural` order and the publisher partitions by document id, so two
//!   publications for one document are never reordered. No ordering is
//!   promised across documents.
//!
//! ## Usage
//!
//! ```rust,no_run
//! use oplog_relay::{OplogRelay, RelayConfig};
//!
//! #[tokio::main]
//! async fn main() {
//!     let mut relay = OplogRelay::new(RelayConfig::default());
//!     relay.start().await.expect("failed to start");
//!
//!     tokio::select! {
//!         result = relay.wait() => {
//!             if let Err(e) = result {
//!                 eprintln!("relay failed: {e}");
//!             }
//!         }
//!         _ = tokio::signal::ctrl_c() => {}
//!     }
//!
//!     relay.shutdown().await;
//! }
//! ```

pub mod config;
pub mod entry;
pub mod error;
pub mod interval_max;
pub mod metrics;
pub mod pipeline;
pub mod publisher;
pub mod resilience;
pub mod resume;
pub mod tailer;
pub mod timestamp;
pub mod transform;

// Re-exports for convenience
pub use config::{FilterConfig, RelayConfig};
pub use entry::{OpKind, ParsedEntry, RawOplogEntry};
pub use error::{RelayError, Result};
pub use pipeline::{HealthCheck, OplogRelay, RelayState, RelayStatus};
pub use publisher::RedisPublisher;
pub use tailer::OplogTailer;
pub use timestamp::{Checkpoint, OplogTimestamp};
pub use transform::{Publication, Transformer};
