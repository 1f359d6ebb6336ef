// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Configuration for the replication core.
//!
//! Configuration can be constructed programmatically or deserialized from
//! YAML/JSON. Durations are human-readable strings (`"20s"`, `"500ms"`).
//!
//! # Quick Start
//!
//! ```rust
//! use grid_replication::config::ReplicationConfig;
//!
//! let config = ReplicationConfig {
//!     identifier: 1,
//!     ..Default::default()
//! };
//! config.validate().unwrap();
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── identifier: u8                 # This node's replication identity
//! ├── store: StoreConfig             # Name, segment count, read-only flag
//! ├── codec: CodecConfig             # Value compression for wire entries
//! ├── query: QueryConfig             # forEach bridge queue/timeouts
//! └── replicator: ReplicatorConfig   # Per-peer drain loop
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! identifier: 3
//!
//! store:
//!   name: "/grid/users"
//!   segments: 8
//!
//! codec:
//!   value_compression: "zstd"
//!
//! query:
//!   queue_capacity: 128
//!   offer_timeout: "20s"
//!   poll_interval: "1s"
//!
//! replicator:
//!   batch_size: 256
//!   idle_wait: "1s"
//! ```

use crate::codec::Compression;
use crate::error::{ReplicationError, Result};
use serde::{Deserialize, Serialize};
use std::str::FromStr;
use std::time::Duration;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level replication configuration for one store on one node.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicationConfig {
    /// This node's identifier for the store. Assigned out-of-band and
    /// assumed unique among cooperating nodes.
    pub identifier: u8,

    #[serde(default)]
    pub store: StoreConfig,

    #[serde(default)]
    pub codec: CodecConfig,

    #[serde(default)]
    pub query: QueryConfig,

    #[serde(default)]
    pub replicator: ReplicatorConfig,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            identifier: 1,
            store: StoreConfig::default(),
            codec: CodecConfig::default(),
            query: QueryConfig::default(),
            replicator: ReplicatorConfig::default(),
        }
    }
}

impl ReplicationConfig {
    /// Create a minimal config for testing.
    pub fn for_testing(identifier: u8) -> Self {
        Self {
            identifier,
            store: StoreConfig {
                name: format!("test-store-{}", identifier),
                ..Default::default()
            },
            codec: CodecConfig::default(),
            query: QueryConfig::testing(),
            replicator: ReplicatorConfig::testing(),
        }
    }

    /// Check the whole tree for values that cannot work at runtime.
    pub fn validate(&self) -> Result<()> {
        self.store.validate()?;
        self.codec.compression()?;
        self.query.validate()?;
        self.replicator.validate()?;
        Ok(())
    }

    /// Overlay `GRID_*` environment variables onto the defaults.
    ///
    /// Unparsable values are logged and ignored.
    pub fn from_env() -> Self {
        let mut config = Self::default();

        if let Some(id) = env_parse::<u8>("GRID_IDENTIFIER") {
            config.identifier = id;
        }
        if let Ok(name) = std::env::var("GRID_STORE_NAME") {
            config.store.name = name;
        }
        if let Some(segments) = env_parse::<usize>("GRID_STORE_SEGMENTS") {
            config.store.segments = segments;
        }
        if let Ok(ro) = std::env::var("GRID_STORE_READ_ONLY") {
            config.store.read_only = ro == "1" || ro.eq_ignore_ascii_case("true");
        }
        if let Ok(scheme) = std::env::var("GRID_VALUE_COMPRESSION") {
            config.codec.value_compression = scheme;
        }
        if let Some(capacity) = env_parse::<usize>("GRID_QUERY_QUEUE_CAPACITY") {
            config.query.queue_capacity = capacity;
        }
        if let Ok(timeout) = std::env::var("GRID_QUERY_OFFER_TIMEOUT") {
            config.query.offer_timeout = timeout;
        }
        if let Some(batch) = env_parse::<usize>("GRID_REPLICATOR_BATCH_SIZE") {
            config.replicator.batch_size = batch;
        }

        config
    }
}

fn env_parse<T: FromStr>(name: &str) -> Option<T> {
    let raw = std::env::var(name).ok()?;
    match raw.parse() {
        Ok(v) => Some(v),
        Err(_) => {
            tracing::warn!(variable = name, value = %raw, "Ignoring unparsable environment override");
            None
        }
    }
}

fn parse_duration(field: &str, value: &str) -> Result<Duration> {
    humantime::parse_duration(value)
        .map_err(|e| ReplicationError::Config(format!("{}: invalid duration '{}': {}", field, value, e)))
}

// ═══════════════════════════════════════════════════════════════════════════════
// StoreConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the local keyed store.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoreConfig {
    /// Name used in logs, metrics and closed-store errors.
    #[serde(default = "default_store_name")]
    pub name: String,

    /// Number of segments for parallel scans. Fixed for the store's lifetime.
    #[serde(default = "default_segments")]
    pub segments: usize,

    /// Reject every write method.
    #[serde(default)]
    pub read_only: bool,
}

fn default_store_name() -> String {
    "store".to_string()
}

fn default_segments() -> usize {
    1
}

impl Default for StoreConfig {
    fn default() -> Self {
        Self {
            name: default_store_name(),
            segments: 1,
            read_only: false,
        }
    }
}

impl StoreConfig {
    fn validate(&self) -> Result<()> {
        if self.segments == 0 {
            return Err(ReplicationError::Config("store.segments must be at least 1".into()));
        }
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// CodecConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Wire codec settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CodecConfig {
    /// Value compression scheme name: empty/"none", "zstd" or "lz4".
    #[serde(default)]
    pub value_compression: String,

    /// zstd compression level.
    #[serde(default = "default_zstd_level")]
    pub zstd_level: i32,
}

fn default_zstd_level() -> i32 {
    3
}

impl Default for CodecConfig {
    fn default() -> Self {
        Self {
            value_compression: String::new(),
            zstd_level: 3,
        }
    }
}

impl CodecConfig {
    /// Parse the configured scheme name.
    pub fn compression(&self) -> Result<Compression> {
        Compression::from_str(&self.value_compression)
    }

    /// Make this the process-wide value compression for wire encoding.
    pub fn install(&self) -> Result<Compression> {
        let compression = self.compression()?;
        crate::codec::set_value_compression(compression);
        crate::codec::set_zstd_level(self.zstd_level);
        Ok(compression)
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// QueryConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Settings for the read-side subscription pipeline.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueryConfig {
    /// Bounded queue capacity of the `for_each` bridge.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// How long the producer waits on a full queue before dropping the
    /// element and emitting a diagnostic dump.
    #[serde(default = "default_offer_timeout")]
    pub offer_timeout: String,

    /// How long the consumer waits on an empty queue before re-checking
    /// for finish/cancellation.
    #[serde(default = "default_poll_interval")]
    pub poll_interval: String,

    /// Per-listener buffer of a live `subscribe` feed.
    #[serde(default = "default_subscription_capacity")]
    pub subscription_capacity: usize,

    /// Thread-name prefixes left out of backpressure thread dumps.
    #[serde(default)]
    pub reserved_thread_prefixes: Vec<String>,
}

fn default_queue_capacity() -> usize {
    128
}

fn default_offer_timeout() -> String {
    "20s".to_string()
}

fn default_poll_interval() -> String {
    "1s".to_string()
}

fn default_subscription_capacity() -> usize {
    1024
}

impl Default for QueryConfig {
    fn default() -> Self {
        Self {
            queue_capacity: 128,
            offer_timeout: default_offer_timeout(),
            poll_interval: default_poll_interval(),
            subscription_capacity: 1024,
            reserved_thread_prefixes: Vec::new(),
        }
    }
}

impl QueryConfig {
    /// Short timeouts for tests.
    pub fn testing() -> Self {
        Self {
            queue_capacity: 128,
            offer_timeout: "200ms".to_string(),
            poll_interval: "20ms".to_string(),
            subscription_capacity: 256,
            reserved_thread_prefixes: Vec::new(),
        }
    }

    /// Parsed `offer_timeout`, falling back to 20s.
    pub fn offer_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.offer_timeout).unwrap_or(Duration::from_secs(20))
    }

    /// Parsed `poll_interval`, falling back to 1s.
    pub fn poll_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.poll_interval).unwrap_or(Duration::from_secs(1))
    }

    fn validate(&self) -> Result<()> {
        if self.queue_capacity == 0 {
            return Err(ReplicationError::Config("query.queue_capacity must be at least 1".into()));
        }
        if self.subscription_capacity == 0 {
            return Err(ReplicationError::Config(
                "query.subscription_capacity must be at least 1".into(),
            ));
        }
        parse_duration("query.offer_timeout", &self.offer_timeout)?;
        parse_duration("query.poll_interval", &self.poll_interval)?;
        Ok(())
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ReplicatorConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Per-peer drain loop settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReplicatorConfig {
    /// Maximum entries shipped per batch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Upper bound on an idle wait before re-checking the iterator, in case a
    /// notification is missed.
    #[serde(default = "default_idle_wait")]
    pub idle_wait: String,

    /// Pace entry shipping (useful while backfilling a reconnecting peer).
    #[serde(default)]
    pub rate_limit_enabled: bool,

    /// Sustained entries per second when rate limiting.
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst size when rate limiting.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,

    /// Sink failures in a row before a batch is given up and re-armed.
    #[serde(default = "default_max_send_attempts")]
    pub max_send_attempts: usize,
}

fn default_batch_size() -> usize {
    100
}

fn default_idle_wait() -> String {
    "1s".to_string()
}

fn default_rate_limit_per_sec() -> u32 {
    10_000
}

fn default_rate_limit_burst() -> u32 {
    1000
}

fn default_max_send_attempts() -> usize {
    5
}

impl Default for ReplicatorConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            idle_wait: default_idle_wait(),
            rate_limit_enabled: false,
            rate_limit_per_sec: 10_000,
            rate_limit_burst: 1000,
            max_send_attempts: 5,
        }
    }
}

impl ReplicatorConfig {
    /// Fast settings for tests.
    pub fn testing() -> Self {
        Self {
            batch_size: 16,
            idle_wait: "20ms".to_string(),
            max_send_attempts: 3,
            ..Default::default()
        }
    }

    /// Parsed `idle_wait`, falling back to 1s.
    pub fn idle_wait_duration(&self) -> Duration {
        humantime::parse_duration(&self.idle_wait).unwrap_or(Duration::from_secs(1))
    }

    /// Rate limit settings, or `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<crate::resilience::RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(crate::resilience::RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }

    fn validate(&self) -> Result<()> {
        if self.batch_size == 0 {
            return Err(ReplicationError::Config("replicator.batch_size must be at least 1".into()));
        }
        if self.max_send_attempts == 0 {
            return Err(ReplicationError::Config(
                "replicator.max_send_attempts must be at least 1".into(),
            ));
        }
        parse_duration("replicator.idle_wait", &self.idle_wait)?;
        Ok(())
    }
}
