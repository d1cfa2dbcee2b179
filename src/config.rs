//! Configuration for the replication engine.
//!
//! Configuration is passed to [`ReplicationCoordinator::open()`](crate::ReplicationCoordinator::open)
//! and can be constructed programmatically or deserialized from YAML/JSON.
//!
//! # Quick Start
//!
//! ```rust
//! use replica_sync::config::{ReplicationConfig, RemoteConfig};
//!
//! let config = ReplicationConfig {
//!     remote: RemoteConfig {
//!         base_url: "https://api.example.com".into(),
//!         ..Default::default()
//!     },
//!     ..Default::default()
//! };
//! ```
//!
//! # Configuration Structure
//!
//! ```text
//! ReplicationConfig
//! ├── remote: RemoteConfig          # Where the remote authority lives
//! ├── settings: ReplicationSettings
//! │   ├── pull: PullConfig          # Batch size, event-trigger rate limit
//! │   ├── push: PushConfig          # Batch size, retry ceiling
//! │   ├── schedule: ScheduleConfig  # Fallback interval, failure backoff
//! │   └── realtime: RealtimeConfig  # Listener reconnect policy
//! └── storage: StorageConfig        # SQLite checkpoints + outbox
//! ```
//!
//! # YAML Example
//!
//! ```yaml
//! remote:
//!   base_url: "https://api.example.com"
//!   request_timeout: "30s"
//!
//! settings:
//!   pull:
//!     batch_size: 200
//!   push:
//!     max_retries: 5
//!   schedule:
//!     fallback_interval: "1m"
//!
//! storage:
//!   sqlite_path: "/var/lib/app/replica.db"
//! ```

use crate::resilience::{RateLimitConfig, RetryConfig};
use serde::{Deserialize, Serialize};
use std::time::Duration;

/// Largest page the server will hand out for a single pull request.
pub const MAX_PULL_BATCH: usize = 1000;

// ═══════════════════════════════════════════════════════════════════════════════
// Top-level config
// ═══════════════════════════════════════════════════════════════════════════════

/// The top-level config object passed to the coordinator.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationConfig {
    /// Remote authority endpoint settings.
    #[serde(default)]
    pub remote: RemoteConfig,

    /// Tunables for pulling, pushing, scheduling and the realtime listener.
    #[serde(default)]
    pub settings: ReplicationSettings,

    /// Local persistence for checkpoints and the outbox.
    #[serde(default)]
    pub storage: StorageConfig,
}

impl ReplicationConfig {
    /// Create a config with in-memory storage and short timers for tests.
    pub fn for_testing() -> Self {
        Self {
            remote: RemoteConfig::default(),
            settings: ReplicationSettings {
                pull: PullConfig::default(),
                push: PushConfig::default(),
                schedule: ScheduleConfig {
                    fallback_interval: "1h".to_string(),
                    backoff_base_ms: 20,
                    backoff_max_ms: 200,
                    stop_drain_timeout: "2s".to_string(),
                },
                realtime: RealtimeConfig {
                    enabled: true,
                    reconnect_initial_delay_ms: 10,
                    reconnect_max_delay_ms: 100,
                    reconnect_backoff_factor: 2.0,
                    connect_timeout: "500ms".to_string(),
                },
            },
            storage: StorageConfig::in_memory(),
        }
    }
}

/// General settings for the replication logic.
#[derive(Debug, Clone, Serialize, Deserialize, Default)]
pub struct ReplicationSettings {
    #[serde(default)]
    pub pull: PullConfig,
    #[serde(default)]
    pub push: PushConfig,
    #[serde(default)]
    pub schedule: ScheduleConfig,
    #[serde(default)]
    pub realtime: RealtimeConfig,
}

// ═══════════════════════════════════════════════════════════════════════════════
// RemoteConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Remote authority endpoint.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RemoteConfig {
    /// Base URL, e.g. `https://api.example.com`. Paths like
    /// `/v1/replication/pull` are appended to it.
    #[serde(default = "default_base_url")]
    pub base_url: String,

    /// Per-request timeout as a duration string (e.g., "30s").
    #[serde(default = "default_request_timeout")]
    pub request_timeout: String,
}

fn default_base_url() -> String {
    "http://localhost:8080".to_string()
}

fn default_request_timeout() -> String {
    "30s".to_string()
}

impl Default for RemoteConfig {
    fn default() -> Self {
        Self {
            base_url: default_base_url(),
            request_timeout: default_request_timeout(),
        }
    }
}

impl RemoteConfig {
    /// Parse the request_timeout string to a Duration.
    pub fn request_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.request_timeout).unwrap_or(Duration::from_secs(30))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PullConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Puller configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PullConfig {
    /// Changes requested per fetch. A full batch triggers an immediate
    /// follow-up fetch.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Throttle pulls triggered by realtime events.
    /// A burst of notifications still coalesces to one queued pass, this only
    /// bounds how often those passes start.
    #[serde(default = "default_false")]
    pub rate_limit_enabled: bool,

    /// Event-triggered pulls per second (sustained rate).
    #[serde(default = "default_rate_limit_per_sec")]
    pub rate_limit_per_sec: u32,

    /// Burst allowance for event-triggered pulls.
    #[serde(default = "default_rate_limit_burst")]
    pub rate_limit_burst: u32,
}

fn default_batch_size() -> usize {
    100
}

fn default_false() -> bool {
    false
}

fn default_true() -> bool {
    true
}

fn default_rate_limit_per_sec() -> u32 {
    5
}

fn default_rate_limit_burst() -> u32 {
    10
}

impl Default for PullConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            rate_limit_enabled: false,
            rate_limit_per_sec: 5,
            rate_limit_burst: 10,
        }
    }
}

impl PullConfig {
    /// Batch size clamped to what the server accepts.
    pub fn effective_batch_size(&self) -> usize {
        self.batch_size.clamp(1, MAX_PULL_BATCH)
    }

    /// Create rate limit configuration from pull settings.
    ///
    /// Returns `None` if rate limiting is disabled.
    pub fn rate_limit_config(&self) -> Option<RateLimitConfig> {
        if self.rate_limit_enabled {
            Some(RateLimitConfig {
                burst_size: self.rate_limit_burst,
                refill_rate: self.rate_limit_per_sec,
            })
        } else {
            None
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// PushConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Pusher configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PushConfig {
    /// Outbox entries read per push request.
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,

    /// Failed deliveries tolerated before an entry is dead-lettered.
    /// An entry whose retry count exceeds this value is moved to the failed state.
    #[serde(default = "default_max_retries")]
    pub max_retries: u32,
}

fn default_max_retries() -> u32 {
    5
}

impl Default for PushConfig {
    fn default() -> Self {
        Self {
            batch_size: 100,
            max_retries: 5,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// ScheduleConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Pass scheduling: fallback polling and failure backoff.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ScheduleConfig {
    /// Interval between passes when nothing triggers one (covers lost
    /// notifications). Duration string, e.g. "30s".
    #[serde(default = "default_fallback_interval")]
    pub fallback_interval: String,

    /// Base backoff after a failed pass, in milliseconds.
    /// Actual backoff = min(base * 2^(consecutive_failures - 1), max).
    #[serde(default = "default_backoff_base_ms")]
    pub backoff_base_ms: u64,

    /// Maximum backoff in milliseconds (ceiling).
    #[serde(default = "default_backoff_max_ms")]
    pub backoff_max_ms: u64,

    /// How long `stop()` waits for in-flight passes before detaching them.
    #[serde(default = "default_stop_drain_timeout")]
    pub stop_drain_timeout: String,
}

fn default_fallback_interval() -> String {
    "30s".to_string()
}

fn default_backoff_base_ms() -> u64 {
    1000
}

fn default_backoff_max_ms() -> u64 {
    300_000 // 5 minutes
}

fn default_stop_drain_timeout() -> String {
    "10s".to_string()
}

impl Default for ScheduleConfig {
    fn default() -> Self {
        Self {
            fallback_interval: default_fallback_interval(),
            backoff_base_ms: 1000,
            backoff_max_ms: 300_000,
            stop_drain_timeout: default_stop_drain_timeout(),
        }
    }
}

impl ScheduleConfig {
    /// Parse the fallback interval, defaulting to 30 seconds.
    pub fn fallback_interval_duration(&self) -> Duration {
        humantime::parse_duration(&self.fallback_interval).unwrap_or(Duration::from_secs(30))
    }

    /// Parse the stop drain timeout, defaulting to 10 seconds.
    pub fn stop_drain_timeout_duration(&self) -> Duration {
        humantime::parse_duration(&self.stop_drain_timeout).unwrap_or(Duration::from_secs(10))
    }

    /// Backoff before the next pass after `consecutive_failures` failed passes.
    pub fn backoff_for_failures(&self, consecutive_failures: u32) -> Duration {
        let exponent = consecutive_failures.saturating_sub(1);
        let backoff_ms = self
            .backoff_base_ms
            .saturating_mul(2u64.saturating_pow(exponent));
        Duration::from_millis(backoff_ms.min(self.backoff_max_ms))
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// RealtimeConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Realtime listener configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RealtimeConfig {
    /// Whether to hold an event-stream session at all. When disabled the
    /// coordinator relies on the fallback interval.
    #[serde(default = "default_true")]
    pub enabled: bool,

    #[serde(default = "default_reconnect_initial_delay_ms")]
    pub reconnect_initial_delay_ms: u64,

    #[serde(default = "default_reconnect_max_delay_ms")]
    pub reconnect_max_delay_ms: u64,

    #[serde(default = "default_reconnect_backoff_factor")]
    pub reconnect_backoff_factor: f64,

    /// Timeout for each connect attempt (duration string).
    #[serde(default = "default_connect_timeout")]
    pub connect_timeout: String,
}

fn default_reconnect_initial_delay_ms() -> u64 {
    1000
}

fn default_reconnect_max_delay_ms() -> u64 {
    60_000
}

fn default_reconnect_backoff_factor() -> f64 {
    2.0
}

fn default_connect_timeout() -> String {
    "10s".to_string()
}

impl Default for RealtimeConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            reconnect_initial_delay_ms: 1000,
            reconnect_max_delay_ms: 60_000,
            reconnect_backoff_factor: 2.0,
            connect_timeout: default_connect_timeout(),
        }
    }
}

impl RealtimeConfig {
    /// Reconnect policy for the listener. Reconnection never gives up.
    pub fn retry_config(&self) -> RetryConfig {
        RetryConfig {
            max_attempts: usize::MAX,
            initial_delay: Duration::from_millis(self.reconnect_initial_delay_ms),
            max_delay: Duration::from_millis(self.reconnect_max_delay_ms),
            backoff_factor: self.reconnect_backoff_factor,
            connection_timeout: humantime::parse_duration(&self.connect_timeout)
                .unwrap_or(Duration::from_secs(10)),
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// StorageConfig
// ═══════════════════════════════════════════════════════════════════════════════

/// Local persistence configuration.
///
/// Checkpoints and outbox entries share one SQLite database.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StorageConfig {
    /// Path to the SQLite database.
    #[serde(default = "default_sqlite_path")]
    pub sqlite_path: String,

    /// Whether to use WAL mode for SQLite (recommended).
    #[serde(default = "default_true")]
    pub wal_mode: bool,
}

fn default_sqlite_path() -> String {
    "replica_sync.db".to_string()
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            sqlite_path: default_sqlite_path(),
            wal_mode: true,
        }
    }
}

impl StorageConfig {
    /// Create an in-memory config for testing.
    pub fn in_memory() -> Self {
        Self {
            sqlite_path: ":memory:".to_string(),
            wal_mode: false,
        }
    }

    /// Whether this config points at a throwaway in-memory database.
    pub fn is_in_memory(&self) -> bool {
        self.sqlite_path == ":memory:"
    }

    /// Config for a database file at `path`.
    pub fn at_path(path: impl AsRef<std::path::Path>) -> Self {
        Self {
            sqlite_path: path.as_ref().to_string_lossy().to_string(),
            wal_mode: true,
        }
    }
}

// ═══════════════════════════════════════════════════════════════════════════════
// Tests
// ═══════════════════════════════════════════════════════════════════════════════
