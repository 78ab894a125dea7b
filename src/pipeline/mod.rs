// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Relay coordinator.
//!
//! Ties the pipeline together:
//! 1. Connects to Mongo and Redis (fail fast on unreachable endpoints).
//! 2. Resolves the start timestamp via [`crate::resume`].
//! 3. Spawns the single oplog tailer task and the partitioned publisher,
//!    joined by a bounded publication channel.
//! 4. Handles graceful shutdown: the stop signal reaches the tailer
//!    first; closing the publication channel lets the publisher drain
//!    in-flight work before exiting.

mod types;

pub use types::{HealthCheck, RelayState, RelayStatus};

use crate::config::RelayConfig;
use crate::error::{RelayError, Result};
use crate::metrics;
use crate::publisher::RedisPublisher;
use crate::resilience::RetryConfig;
use crate::resume;
use crate::tailer::OplogTailer;
use crate::transform::{Publication, Transformer};
use mongodb::bson::Document;
use mongodb::Collection;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio::task::JoinHandle;
use tracing::{error, info, warn};

/// How long `shutdown()` waits for tasks to drain before giving up.
const DRAIN_TIMEOUT: Duration = Duration::from_secs(10);

/// The oplog-to-Redis relay pipeline.
///
/// ```rust,no_run
/// use oplog_relay::{OplogRelay, RelayConfig};
///
/// #[tokio::main]
/// async fn main() {
///     let mut relay = OplogRelay::new(RelayConfig::default());
///     relay.start().await.expect("failed to start");
///
///     // Runs until stopped; wait() surfaces unrecoverable errors so a
///     // supervisor can restart from the persisted checkpoint.
///     tokio::select! {
///         result = relay.wait() => {
///             if let Err(e) = result {
///                 eprintln!("relay failed: {e}");
///             }
///         }
///         _ = tokio::signal::ctrl_c() => {}
///     }
///
///     relay.shutdown().await;
/// }
/// ```
pub struct OplogRelay {
    config: RelayConfig,
    state_tx: watch::Sender<RelayState>,
    state_rx: watch::Receiver<RelayState>,
    shutdown_tx: watch::Sender<bool>,
    shutdown_rx: watch::Receiver<bool>,
    status: Arc<RelayStatus>,
    tailer_handle: Option<JoinHandle<()>>,
    publisher_handle: Option<JoinHandle<Result<()>>>,
}

impl OplogRelay {
    /// Create a relay in the `Created` state. Call
    /// [`start()`](Self::start) to connect and begin tailing.
    pub fn new(config: RelayConfig) -> Self {
        let (state_tx, state_rx) = watch::channel(RelayState::Created);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        Self {
            config,
            state_tx,
            state_rx,
            shutdown_tx,
            shutdown_rx,
            status: Arc::new(RelayStatus::default()),
            tailer_handle: None,
            publisher_handle: None,
        }
    }

    /// Current lifecycle state.
    pub fn state(&self) -> RelayState {
        *self.state_rx.borrow()
    }

    /// A receiver to watch state changes.
    pub fn state_receiver(&self) -> watch::Receiver<RelayState> {
        self.state_rx.clone()
    }

    pub fn is_running(&self) -> bool {
        self.state() == RelayState::Running
    }

    fn set_state(&self, state: RelayState) {
        let _ = self.state_tx.send(state);
        metrics::set_relay_state(&state.to_string());
    }

    /// Connect to both endpoints, resolve the resume position, and spawn
    /// the pipeline tasks.
    ///
    /// Fails fast on invalid configuration or unreachable endpoints; those
    /// errors map to a non-zero exit in the embedding daemon.
    pub async fn start(&mut self) -> Result<()> {
        if self.state() != RelayState::Created {
            return Err(RelayError::InvalidState {
                expected: "Created".to_string(),
                actual: self.state().to_string(),
            });
        }

        self.config.validate()?;
        let query_timeout = self.config.mongo_query_timeout_duration();
        let max_catch_up = self.config.max_catch_up_duration();

        info!(
            redis_prefix = %self.config.redis_prefix,
            partitions = self.config.publisher_parallelism,
            "Starting oplog relay"
        );
        self.set_state(RelayState::Connecting);

        let mongo = mongodb::Client::with_uri_str(&self.config.mongo_url)
            .await
            .map_err(|e| RelayError::mongo("connect", e))?;
        let oplog: Collection<Document> = mongo.database("local").collection("oplog.rs");

        let redis_client = redis::Client::open(self.config.redis_url.as_str())
            .map_err(|e| RelayError::redis("open", e))?;
        let mut redis = redis_client
            .get_connection_manager()
            .await
            .map_err(|e| RelayError::redis("connect", e))?;

        let start = resume::resolve_start_timestamp(
            &mut redis,
            &oplog,
            &self.config.redis_prefix,
            max_catch_up,
            query_timeout,
        )
        .await;
        info!(start = %start, "Resolved oplog start timestamp");

        let (publication_tx, publication_rx) =
            mpsc::channel::<Publication>(self.config.publish_buffer);

        let transformer = Transformer::new(
            self.config.redis_prefix.clone(),
            self.config.filter.clone(),
        );
        let tailer = OplogTailer::new(
            oplog,
            transformer,
            start,
            query_timeout,
            Arc::clone(&self.status),
        );
        let tailer_shutdown = self.shutdown_rx.clone();
        self.tailer_handle = Some(tokio::spawn(async move {
            tailer.run(publication_tx, tailer_shutdown).await;
        }));

        let publisher = RedisPublisher::new(
            redis,
            self.config.redis_prefix.clone(),
            self.config.publisher_parallelism,
            RetryConfig::default(),
            self.config.max_publish_attempts,
            Arc::clone(&self.status),
        );
        self.publisher_handle = Some(tokio::spawn(publisher.run(publication_rx)));

        self.set_state(RelayState::Running);
        info!("Oplog relay running");
        Ok(())
    }

    /// Wait for the pipeline to end on its own.
    ///
    /// Returns `Err` when the publisher exhausted its retry budget (or
    /// hit another unrecoverable error); the supervisor should restart the
    /// relay, which resumes from the persisted checkpoint.
    pub async fn wait(&mut self) -> Result<()> {
        // Awaited through `&mut` so that losing a select! race against a
        // signal leaves the handle in place for shutdown() to drain.
        let result = match self.publisher_handle.as_mut() {
            Some(handle) => match handle.await {
                Ok(result) => result,
                Err(e) => Err(RelayError::Internal(format!("publisher panic: {}", e))),
            },
            None => {
                return Err(RelayError::InvalidState {
                    expected: "Running".to_string(),
                    actual: self.state().to_string(),
                })
            }
        };
        self.publisher_handle = None;

        if let Err(e) = &result {
            error!(error = %e, "Relay pipeline failed");
            self.set_state(RelayState::Failed);
        }
        result
    }

    /// Stop the pipeline gracefully.
    ///
    /// The stop signal reaches the tailer first; it finishes its current
    /// read and closes the publication channel, after which the publisher
    /// flushes in-flight publications (completing publish + checkpoint or
    /// exhausting retries) and exits. Total shutdown is bounded by the
    /// Mongo query timeout plus the maximum retry backoff; tasks that
    /// exceed the drain timeout are abandoned with a warning.
    pub async fn shutdown(&mut self) {
        info!("Shutting down oplog relay");
        self.set_state(RelayState::ShuttingDown);

        let _ = self.shutdown_tx.send(true);

        if let Some(handle) = self.tailer_handle.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => warn!(error = %e, "Tailer panicked during shutdown"),
                Err(_) => warn!("Tailer timed out during shutdown"),
            }
        }

        if let Some(handle) = self.publisher_handle.take() {
            match tokio::time::timeout(DRAIN_TIMEOUT, handle).await {
                Ok(Ok(Ok(()))) => {}
                Ok(Ok(Err(e))) => {
                    warn!(error = %e, "Publisher reported an error during shutdown")
                }
                Ok(Err(e)) => warn!(error = %e, "Publisher panicked during shutdown"),
                Err(_) => warn!("Publisher timed out during shutdown (a publication may be redelivered on restart)"),
            }
        }

        self.set_state(RelayState::Stopped);
        info!("Oplog relay stopped");
    }

    /// Health snapshot for monitoring endpoints. Performs no I/O.
    pub fn health_check(&self) -> HealthCheck {
        let state = self.state();
        let seconds_since_oplog_read = self.status.seconds_since_oplog_read();
        let partitions_in_backoff = self.status.partitions_in_backoff();
        let stall_threshold = self.config.stall_threshold_duration().as_secs() as i64;

        let ready = state == RelayState::Running;
        let stalled = seconds_since_oplog_read
            .map(|age| age > stall_threshold)
            .unwrap_or(false);
        let healthy = ready && !stalled && partitions_in_backoff == 0;

        HealthCheck {
            state,
            ready,
            healthy,
            seconds_since_oplog_read,
            partitions_in_backoff,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn test_config() -> RelayConfig {
        RelayConfig::for_testing("mongodb://localhost:27017", "redis://localhost:6379")
    }

    #[test]
    fn test_relay_initial_state() {
        let relay = OplogRelay::new(test_config());
        assert_eq!(relay.state(), RelayState::Created);
        assert!(!relay.is_running());
    }

    #[test]
    fn test_relay_state_receiver() {
        let relay = OplogRelay::new(test_config());
        let rx = relay.state_receiver();
        assert_eq!(*rx.borrow(), RelayState::Created);
    }

    #[tokio::test]
    async fn test_start_rejects_invalid_config() {
        let mut config = test_config();
        config.mongo_url = String::new();

        let mut relay = OplogRelay::new(config);
        let result = relay.start().await;
        assert!(matches!(result, Err(RelayError::Config(_))));
    }

    #[tokio::test]
    async fn test_start_twice_is_invalid_state() {
        let mut relay = OplogRelay::new(test_config());
        let _ = relay.state_tx.send(RelayState::Running);

        let result = relay.start().await;
        match result {
            Err(RelayError::InvalidState { expected, actual }) => {
                assert_eq!(expected, "Created");
                assert_eq!(actual, "Running");
            }
            other => panic!("expected InvalidState, got {:?}", other.map(|_| ())),
        }
    }

    #[tokio::test]
    async fn test_wait_before_start_is_invalid_state() {
        let mut relay = OplogRelay::new(test_config());
        assert!(matches!(
            relay.wait().await,
            Err(RelayError::InvalidState { .. })
        ));
    }

    #[tokio::test]
    async fn test_shutdown_from_created() {
        let mut relay = OplogRelay::new(test_config());
        relay.shutdown().await;
        assert_eq!(relay.state(), RelayState::Stopped);
    }

    #[test]
    fn test_health_check_before_start() {
        let relay = OplogRelay::new(test_config());
        let health = relay.health_check();
        assert_eq!(health.state, RelayState::Created);
        assert!(!health.ready);
        assert!(!health.healthy);
        assert_eq!(health.seconds_since_oplog_read, None);
        assert_eq!(health.partitions_in_backoff, 0);
    }

    #[test]
    fn test_health_check_running_is_healthy() {
        let relay = OplogRelay::new(test_config());
        let _ = relay.state_tx.send(RelayState::Running);
        relay.status.mark_oplog_read();

        let health = relay.health_check();
        assert!(health.ready);
        assert!(health.healthy);
    }

    #[test]
    fn test_health_check_backoff_is_unhealthy() {
        let relay = OplogRelay::new(test_config());
        let _ = relay.state_tx.send(RelayState::Running);
        relay.status.mark_oplog_read();
        relay.status.enter_backoff();

        let health = relay.health_check();
        assert!(health.ready);
        assert!(!health.healthy);
        assert_eq!(health.partitions_in_backoff, 1);
    }
}
