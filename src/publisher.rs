// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Publishes to Redis and persists the resume checkpoint.
//!
//! Guarantees:
//!
//! - **At-least-once** per accepted publication: a publication is only
//!   dropped after its PUBLISH + checkpoint completed, or after the retry
//!   budget is exhausted - in which case `run()` returns the error and the
//!   supervisor restarts the pipeline from the persisted checkpoint.
//! - **Per-document order**: publications are routed to a partition by a
//!   stable hash of the document id, and each partition publishes strictly
//!   serially. A document always lands in one partition.
//! - **Monotonic checkpointing**: the stored checkpoint only advances,
//!   enforced by a server-side compare-and-set on `(seconds, ordinal)`.
//!   Losing the CAS means another writer already stored a newer position;
//!   that is success, not an error.
//! - **Dedup across restarts**: publications whose timestamp is not
//!   strictly greater than the checkpoint loaded at startup were already
//!   published by the previous instance and are suppressed.
//!
//! # Partition worker state machine
//!
//! ```text
//! IDLE ──recv Publication──▶ PUBLISHING
//! PUBLISHING ──all ok──▶ CHECKPOINTING
//! PUBLISHING ──err──▶ BACKOFF ──timer──▶ PUBLISHING
//! CHECKPOINTING ──ok──▶ IDLE
//! CHECKPOINTING ──stale (CAS lost)──▶ IDLE
//! CHECKPOINTING ──err──▶ BACKOFF
//! ```
//!
//! The terminal state is entered only once the partition's queue closes
//! after IDLE.

use crate::error::{RelayError, Result};
use crate::metrics;
use crate::pipeline::RelayStatus;
use crate::resilience::RetryConfig;
use crate::timestamp::{checkpoint_key, Checkpoint, OplogTimestamp};
use crate::transform::Publication;
use redis::aio::ConnectionManager;
use redis::AsyncCommands;
use std::sync::Arc;
use std::sync::LazyLock;
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

/// Capacity of each partition's queue. Small on purpose: the real
/// backpressure bound is the tailer-to-publisher channel.
const PARTITION_BUFFER: usize = 64;

/// Compare-and-set for the checkpoint key. Refuses to move the stored
/// `(seconds, ordinal)` backwards; a malformed stored value is overwritten.
/// Returns 1 when the checkpoint advanced, 0 when the stored value won.
static CHECKPOINT_CAS: LazyLock<redis::Script> = LazyLock::new(|| {
    redis::Script::new(
        r#"
local current = redis.call('GET', KEYS[1])
if current then
  local s, o = string.match(current, '^(%d+):(%d+):')
  if s then
    s = tonumber(s)
    o = tonumber(o)
    local ns = tonumber(ARGV[1])
    local no = tonumber(ARGV[2])
    if s > ns or (s == ns and o >= no) then
      return 0
    end
  end
end
redis.call('SET', KEYS[1], ARGV[3])
return 1
"#,
    )
});

/// Drains the publication channel into Redis through partitioned workers.
pub struct RedisPublisher {
    redis: ConnectionManager,
    prefix: String,
    partitions: usize,
    retry: RetryConfig,
    max_attempts: usize,
    status: Arc<RelayStatus>,
}

impl RedisPublisher {
    pub fn new(
        redis: ConnectionManager,
        prefix: impl Into<String>,
        partitions: usize,
        retry: RetryConfig,
        max_attempts: usize,
        status: Arc<RelayStatus>,
    ) -> Self {
        Self {
            redis,
            prefix: prefix.into(),
            partitions: partitions.max(1),
            retry,
            max_attempts: max_attempts.max(1),
            status,
        }
    }

    /// Drain `rx` until it closes (tailer gone) or a partition exhausts its
    /// retry budget.
    pub async fn run(mut self, mut rx: mpsc::Receiver<Publication>) -> Result<()> {
        let key = checkpoint_key(&self.prefix);

        let dedup_below = self.load_checkpoint(&key).await.map(|cp| {
            info!(
                timestamp = %cp.timestamp,
                written_at = cp.wall_time,
                "Loaded checkpoint; suppressing publications at or before it"
            );
            cp.timestamp
        });

        let mut senders = Vec::with_capacity(self.partitions);
        let mut workers = Vec::with_capacity(self.partitions);
        for partition in 0..self.partitions {
            let (tx, partition_rx) = mpsc::channel::<Publication>(PARTITION_BUFFER);
            let worker = PartitionWorker {
                partition,
                redis: self.redis.clone(),
                checkpoint_key: key.clone(),
                retry: self.retry.clone(),
                max_attempts: self.max_attempts,
                status: Arc::clone(&self.status),
            };
            senders.push(tx);
            workers.push(tokio::spawn(worker.run(partition_rx)));
        }

        while let Some(publication) = rx.recv().await {
            if should_suppress(dedup_below, publication.timestamp) {
                debug!(
                    timestamp = %publication.timestamp,
                    tx_idx = publication.tx_idx,
                    "Suppressing already-published publication"
                );
                metrics::record_publication_deduped();
                continue;
            }

            let partition = publication.partition(self.partitions);
            if senders[partition].send(publication).await.is_err() {
                // The worker exited early: its error is collected below.
                error!(partition, "Publisher partition is gone, stopping dispatch");
                break;
            }
        }

        // Closing the partition queues lets each worker finish its
        // in-flight publication and exit.
        drop(senders);

        let mut first_error = None;
        for (partition, handle) in workers.into_iter().enumerate() {
            match handle.await {
                Ok(Ok(())) => {}
                Ok(Err(e)) => {
                    error!(partition, error = %e, "Publisher partition failed");
                    first_error.get_or_insert(e);
                }
                Err(e) => {
                    error!(partition, error = %e, "Publisher partition panicked");
                    first_error
                        .get_or_insert_with(|| RelayError::Internal(format!("worker panic: {}", e)));
                }
            }
        }

        match first_error {
            Some(e) => Err(e),
            None => {
                info!("Redis publisher drained and stopped");
                Ok(())
            }
        }
    }

    async fn load_checkpoint(&mut self, key: &str) -> Option<Checkpoint> {
        let raw: Option<String> = match self.redis.get(key).await {
            Ok(value) => value,
            Err(e) => {
                error!(error = %e, key = %key, "Error loading checkpoint, dedup gate disabled");
                return None;
            }
        };
        let raw = raw?;
        match Checkpoint::decode(&raw) {
            Ok(cp) => Some(cp),
            Err(e) => {
                warn!(error = %e, "Ignoring malformed checkpoint");
                None
            }
        }
    }
}

/// Whether a publication was already published by a previous instance.
fn should_suppress(dedup_below: Option<OplogTimestamp>, timestamp: OplogTimestamp) -> bool {
    match dedup_below {
        Some(limit) => timestamp <= limit,
        None => false,
    }
}

/// One partition: strictly serial publishes for its share of documents.
struct PartitionWorker {
    partition: usize,
    redis: ConnectionManager,
    checkpoint_key: String,
    retry: RetryConfig,
    max_attempts: usize,
    status: Arc<RelayStatus>,
}

impl PartitionWorker {
    async fn run(mut self, mut rx: mpsc::Receiver<Publication>) -> Result<()> {
        while let Some(publication) = rx.recv().await {
            self.publish(publication).await?;
        }
        debug!(partition = self.partition, "Partition queue closed");
        Ok(())
    }

    /// Publish to every channel, then advance the checkpoint, retrying
    /// with exponential backoff. Never drops the publication; exhausting
    /// the budget surfaces the error to the supervisor.
    async fn publish(&mut self, publication: Publication) -> Result<()> {
        let mut attempt = 0;
        let mut published = false;

        loop {
            attempt += 1;

            let result = if published {
                self.write_checkpoint_for(&publication).await
            } else {
                match self.publish_channels(&publication).await {
                    Ok(()) => {
                        published = true;
                        self.write_checkpoint_for(&publication).await
                    }
                    Err(e) => Err(e),
                }
            };

            match result {
                Ok(()) => {
                    metrics::record_publication_published(
                        self.partition,
                        publication.channels.len(),
                    );
                    return Ok(());
                }
                Err(e) if attempt >= self.max_attempts => {
                    error!(
                        partition = self.partition,
                        attempts = attempt,
                        timestamp = %publication.timestamp,
                        error = %e,
                        "Redis publish failed past retry budget"
                    );
                    return Err(e);
                }
                Err(e) => {
                    let delay = self.retry.delay_for_attempt(attempt);
                    warn!(
                        partition = self.partition,
                        attempt,
                        delay_ms = delay.as_millis() as u64,
                        error = %e,
                        "Redis publish failed, backing off"
                    );
                    metrics::record_publish_retry();
                    self.status.enter_backoff();
                    tokio::time::sleep(delay).await;
                    self.status.leave_backoff();
                }
            }
        }
    }

    async fn publish_channels(&mut self, publication: &Publication) -> Result<()> {
        for channel in &publication.channels {
            let _subscribers: i64 = self
                .redis
                .publish(channel.as_str(), publication.msg.as_slice())
                .await
                .map_err(|e| RelayError::redis("PUBLISH", e))?;
        }
        Ok(())
    }

    async fn write_checkpoint_for(&mut self, publication: &Publication) -> Result<()> {
        let checkpoint = Checkpoint::now(publication.timestamp);
        let advanced = write_checkpoint(&mut self.redis, &self.checkpoint_key, &checkpoint).await?;

        if advanced {
            metrics::record_checkpoint_write("advanced");
        } else {
            // Another partition already stored a newer position.
            metrics::record_checkpoint_write("stale");
        }
        Ok(())
    }
}

/// Store `checkpoint` under `key` unless the stored position is already
/// at or past it. Returns whether the checkpoint advanced.
pub async fn write_checkpoint(
    redis: &mut ConnectionManager,
    key: &str,
    checkpoint: &Checkpoint,
) -> Result<bool> {
    let advanced: i64 = CHECKPOINT_CAS
        .key(key)
        .arg(checkpoint.timestamp.seconds)
        .arg(checkpoint.timestamp.ordinal)
        .arg(checkpoint.encode())
        .invoke_async(redis)
        .await
        .map_err(|e| RelayError::redis("checkpoint CAS", e))?;
    Ok(advanced == 1)
}
