//! Configuration for the oplog relay.
//!
//! Configuration is passed to [`OplogRelay::new()`](crate::OplogRelay::new)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use oplog_relay::config::RelayConfig;
//!
//! let config = RelayConfig {
//!     mongo_url: "mongodb://localhost:27017/?replicaSet=rs0".into(),
//!     redis_url: "redis://localhost:6379".into(),
//!     ..Default::default()
//! };
//! assert!(config.validate().is_ok());
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! mongo_url: "mongodb://mongo:27017/?replicaSet=rs0"
//! redis_url: "redis://redis:6379"
//! redis_prefix: "otr:"
//! max_catch_up: "60s"
//! mongo_query_timeout: "5s"
//! publisher_parallelism: 4
//! filter:
//!   deny_databases: ["admin", "local", "config"]
//!   deny_collection_prefixes: ["system."]
//! ```

use crate::error::{RelayError, Result};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Top-level relay configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Mongo connection string. Must point at a replica set (the oplog only
    /// exists on replica-set members).
    #[serde(alias = "mongoURL")]
    pub mongo_url: String,

    /// Redis connection string.
    #[serde(alias = "redisURL")]
    pub redis_url: String,

    /// Prefix for channel names and the checkpoint key, including its own
    /// separator (e.g. `"otr:"` yields channels like `otr:app.users`).
    #[serde(default = "default_redis_prefix", alias = "redisPrefix")]
    pub redis_prefix: String,

    /// Maximum checkpoint age to resume from, as a duration string.
    /// Checkpoints older than this force a jump to the end of the oplog -
    /// replaying an unbounded backlog is considered worse than a gap.
    #[serde(default = "default_max_catch_up", alias = "maxCatchUp")]
    pub max_catch_up: String,

    /// Per-read deadline on oplog cursor reads, as a duration string.
    #[serde(default = "default_mongo_query_timeout", alias = "mongoQueryTimeout")]
    pub mongo_query_timeout: String,

    /// Number of publisher partitions. Each partition publishes serially,
    /// preserving per-document order; partitions run in parallel.
    #[serde(default = "default_publisher_parallelism", alias = "publisherParallelism")]
    pub publisher_parallelism: usize,

    /// Capacity of the bounded channel between the tailer and the
    /// publisher. When full, the tailer blocks, throttling oplog reads
    /// instead of growing memory.
    #[serde(default = "default_publish_buffer")]
    pub publish_buffer: usize,

    /// Publish attempts per publication before the error is surfaced to
    /// the supervisor.
    #[serde(default = "default_max_publish_attempts")]
    pub max_publish_attempts: usize,

    /// Address the embedding daemon serves `/metrics` on. The relay itself
    /// only emits through the `metrics` facade; this is carried in config
    /// so one document describes the whole deployment.
    #[serde(default = "default_metrics_addr", alias = "metricsAddr")]
    pub metrics_addr: String,

    /// The tailer is reported unhealthy after this long without a
    /// successful oplog read, as a duration string.
    #[serde(default = "default_stall_threshold")]
    pub stall_threshold: String,

    /// Namespace allow/deny rules.
    #[serde(default)]
    pub filter: FilterConfig,
}

fn default_redis_prefix() -> String {
    "otr:".to_string()
}

fn default_max_catch_up() -> String {
    "60s".to_string()
}

fn default_mongo_query_timeout() -> String {
    "5s".to_string()
}

fn default_publisher_parallelism() -> usize {
    4
}

fn default_publish_buffer() -> usize {
    1024
}

fn default_max_publish_attempts() -> usize {
    10
}

fn default_metrics_addr() -> String {
    "0.0.0.0:9090".to_string()
}

fn default_stall_threshold() -> String {
    "60s".to_string()
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            mongo_url: "mongodb://localhost:27017/?replicaSet=rs0".to_string(),
            redis_url: "redis://localhost:6379".to_string(),
            redis_prefix: default_redis_prefix(),
            max_catch_up: default_max_catch_up(),
            mongo_query_timeout: default_mongo_query_timeout(),
            publisher_parallelism: default_publisher_parallelism(),
            publish_buffer: default_publish_buffer(),
            max_publish_attempts: default_max_publish_attempts(),
            metrics_addr: default_metrics_addr(),
            stall_threshold: default_stall_threshold(),
            filter: FilterConfig::default(),
        }
    }
}

impl RelayConfig {
    /// Minimal config for tests: tiny buffers, single partition, short
    /// timeouts.
    pub fn for_testing(mongo_url: &str, redis_url: &str) -> Self {
        Self {
            mongo_url: mongo_url.to_string(),
            redis_url: redis_url.to_string(),
            mongo_query_timeout: "1s".to_string(),
            publisher_parallelism: 1,
            publish_buffer: 16,
            max_publish_attempts: 3,
            ..Default::default()
        }
    }

    /// Parse `max_catch_up` to a Duration.
    pub fn max_catch_up_duration(&self) -> Duration {
        humantime::parse_duration(&self.max_catch_up).unwrap_or(Duration::from_secs(60))
    }

    /// Parse `mongo_query_timeout` to a Duration.
    pub fn mongo_query_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.mongo_query_timeout).unwrap_or(Duration::from_secs(5))
    }

    /// Parse `stall_threshold` to a Duration.
    pub fn stall_threshold_duration(&self) -> Duration {
        humantime::parse_duration(&self.stall_threshold).unwrap_or(Duration::from_secs(60))
    }

    /// Fail fast on configuration that could not possibly run.
    pub fn validate(&self) -> Result<()> {
        if self.mongo_url.is_empty() {
            return Err(RelayError::Config("mongo_url is empty".to_string()));
        }
        if self.redis_url.is_empty() {
            return Err(RelayError::Config("redis_url is empty".to_string()));
        }
        if self.publisher_parallelism == 0 || self.publisher_parallelism > 64 {
            return Err(RelayError::Config(format!(
                "publisher_parallelism must be 1..=64, got {}",
                self.publisher_parallelism
            )));
        }
        if self.publish_buffer == 0 {
            return Err(RelayError::Config("publish_buffer must be > 0".to_string()));
        }
        if self.max_publish_attempts == 0 {
            return Err(RelayError::Config(
                "max_publish_attempts must be > 0".to_string(),
            ));
        }
        if let Err(e) = humantime::parse_duration(&self.max_catch_up) {
            return Err(RelayError::Config(format!(
                "max_catch_up {:?} is not a duration: {}",
                self.max_catch_up, e
            )));
        }
        if let Err(e) = humantime::parse_duration(&self.mongo_query_timeout) {
            return Err(RelayError::Config(format!(
                "mongo_query_timeout {:?} is not a duration: {}",
                self.mongo_query_timeout, e
            )));
        }
        if let Err(e) = humantime::parse_duration(&self.stall_threshold) {
            return Err(RelayError::Config(format!(
                "stall_threshold {:?} is not a duration: {}",
                self.stall_threshold, e
            )));
        }
        Ok(())
    }
}

/// Namespace allow/deny rules applied by the transformer.
///
/// The deny rules run first; they default to Mongo's internal namespaces.
/// When `allow` is present, only the listed `db` or `db.collection`
/// entries pass.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FilterConfig {
    /// Databases that are never published.
    #[serde(default = "default_deny_databases")]
    pub deny_databases: Vec<String>,

    /// Collection name prefixes that are never published.
    #[serde(default = "default_deny_collection_prefixes")]
    pub deny_collection_prefixes: Vec<String>,

    /// Optional allow-list of `"db"` or `"db.collection"` entries. Absent
    /// means everything that survives the deny rules is published.
    #[serde(default)]
    pub allow: Option<Vec<String>>,
}

fn default_deny_databases() -> Vec<String> {
    vec![
        "admin".to_string(),
        "local".to_string(),
        "config".to_string(),
    ]
}

fn default_deny_collection_prefixes() -> Vec<String> {
    vec!["system.".to_string()]
}

impl Default for FilterConfig {
    fn default() -> Self {
        Self {
            deny_databases: default_deny_databases(),
            deny_collection_prefixes: default_deny_collection_prefixes(),
            allow: None,
        }
    }
}

impl FilterConfig {
    /// Whether an entry in `database`.`collection` should be dropped.
    pub fn ignores(&self, database: &str, collection: &str) -> bool {
        if self.deny_databases.iter().any(|d| d == database) {
            return true;
        }
        if self
            .deny_collection_prefixes
            .iter()
            .any(|p| collection.starts_with(p.as_str()))
        {
            return true;
        }
        if let Some(allow) = &self.allow {
            let namespace = format!("{}.{}", database, collection);
            return !allow.iter().any(|a| a == database || a == &namespace);
        }
        false
    }
}
