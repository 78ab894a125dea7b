// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Error types for the oplog relay.
//!
//! Errors are categorized by their source (Mongo, Redis, entry decoding)
//! and include the operation that failed to help with debugging.
//!
//! # Error Categories
//!
//! | Error Type | Retryable | Description |
//! |------------|-----------|-------------|
//! | `Mongo` | Yes | Cursor timeouts, network errors, server errors |
//! | `Redis` | Yes | PUBLISH failures, connection drops, script errors |
//! | `EntryParse` | No | Malformed oplog entry (counted and skipped) |
//! | `Config` | No | Configuration invalid |
//! | `InvalidState` | No | Relay lifecycle violation |
//! | `Shutdown` | No | Relay is shutting down |
//! | `Internal` | No | Unexpected internal error |
//!
//! # Retry Behavior
//!
//! Use [`RelayError::is_retryable()`] to decide whether an operation should
//! be retried with backoff. Retryable errors indicate transient network or
//! availability issues; non-retryable errors indicate bugs, configuration
//! problems, or malformed data.
//!
//! A Mongo cursor can also fail with a *position lost* server error
//! (capped-collection position lost or change-stream history lost). Those
//! are not surfaced as `RelayError` at all: the tailer recognizes them via
//! [`is_position_lost()`] and silently reissues the find from the last
//! observed timestamp.

use thiserror::Error;

/// Result type alias for relay operations.
pub type Result<T> = std::result::Result<T, RelayError>;

/// Server error codes after which a tailing cursor must be reissued from
/// the last observed timestamp rather than torn down.
///
/// - 136: CappedPositionLost
/// - 280: ChangeStreamFatalError
/// - 286: ChangeStreamHistoryLost
pub const POSITION_LOST_CODES: [i32; 3] = [136, 280, 286];

/// Errors that can occur while relaying oplog entries.
#[derive(Error, Debug)]
pub enum RelayError {
    /// Mongo connection, query, or cursor error.
    ///
    /// Typically retryable (the tailer reopens its cursor after a fixed
    /// delay; startup connection errors are surfaced to the supervisor).
    #[error("Mongo error ({operation}): {message}")]
    Mongo {
        operation: String,
        message: String,
        #[source]
        source: Option<mongodb::error::Error>,
    },

    /// Redis connection or command error.
    ///
    /// Typically retryable (the publisher backs off and retries; a
    /// publication is never dropped on a Redis error).
    #[error("Redis error ({operation}): {message}")]
    Redis {
        operation: String,
        message: String,
        #[source]
        source: Option<redis::RedisError>,
    },

    /// A single oplog entry could not be decoded or is missing required
    /// fields (e.g. an update without `o2._id`).
    ///
    /// Not retryable - the entry is counted under the `error` status and
    /// skipped so a poison entry cannot halt the pipeline.
    #[error("Entry parse error: {0}")]
    EntryParse(String),

    /// Invalid or missing configuration.
    ///
    /// Not retryable - fix the configuration and restart.
    #[error("Configuration error: {0}")]
    Config(String),

    /// Relay lifecycle violation (e.g. `start()` on a running relay).
    ///
    /// Not retryable - indicates a bug in the caller.
    #[error("Invalid state: expected {expected}, got {actual}")]
    InvalidState { expected: String, actual: String },

    /// Shutdown in progress.
    #[error("Shutdown in progress")]
    Shutdown,

    /// Unexpected internal error.
    #[error("Internal error: {0}")]
    Internal(String),
}

impl RelayError {
    /// Create a Mongo error from a `mongodb::error::Error`.
    pub fn mongo(operation: impl Into<String>, source: mongodb::error::Error) -> Self {
        Self::Mongo {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Mongo error without a source.
    pub fn mongo_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Mongo {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Create a Redis error from a `redis::RedisError`.
    pub fn redis(operation: impl Into<String>, source: redis::RedisError) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: source.to_string(),
            source: Some(source),
        }
    }

    /// Create a Redis error without a source.
    pub fn redis_msg(operation: impl Into<String>, message: impl Into<String>) -> Self {
        Self::Redis {
            operation: operation.into(),
            message: message.into(),
            source: None,
        }
    }

    /// Check if this error is retryable.
    pub fn is_retryable(&self) -> bool {
        match self {
            Self::Mongo { .. } => true,
            Self::Redis { .. } => true,
            Self::EntryParse(_) => false, // Malformed data at the source
            Self::Config(_) => false,
            Self::InvalidState { .. } => false,
            Self::Shutdown => false,
            Self::Internal(_) => false,
        }
    }
}

impl From<redis::RedisError> for RelayError {
    fn from(e: redis::RedisError) -> Self {
        Self::redis("unknown", e)
    }
}

impl From<mongodb::error::Error> for RelayError {
    fn from(e: mongodb::error::Error) -> Self {
        Self::mongo("unknown", e)
    }
}

/// Check whether a Mongo error is a cursor position-lost server error.
///
/// These are best handled by reissuing the find from the last observed
/// timestamp on the same connection; no reconnect is needed.
pub fn is_position_lost(err: &mongodb::error::Error) -> bool {
    match err.kind.as_ref() {
        mongodb::error::ErrorKind::Command(cmd) => POSITION_LOST_CODES.contains(&cmd.code),
        _ => false,
    }
}
