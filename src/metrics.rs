//! Metrics for observability.
//!
//! Emitted through the `metrics` facade; install any recorder (Prometheus
//! exporter, statsd, ...) in the application to collect them. Without a
//! recorder every call is a no-op.
//!
//! Covers:
//! - Pull and push passes (duration, documents, outcome)
//! - Checkpoint persistence
//! - Outbox depth and dead-lettered mutations
//! - Realtime listener state and reconnects
//! - Per-collection replication state
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! # Usage
//!
//! ```rust,no_run
//! use replica_sync::metrics;
//! use std::time::Duration;
//!
//! metrics::record_pull_pass("users", 42, 0, Duration::from_millis(80));
//! metrics::set_outbox_depth("users", 3);
//! ```

use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Passes
// =============================================================================

/// Record a completed pull pass.
pub fn record_pull_pass(collection: &str, applied: usize, failed: usize, duration: Duration) {
    counter!("replication_pull_passes_total", "collection" => collection.to_string()).increment(1);
    counter!("replication_pull_documents_applied_total", "collection" => collection.to_string())
        .increment(applied as u64);
    if failed > 0 {
        counter!("replication_pull_documents_failed_total", "collection" => collection.to_string())
            .increment(failed as u64);
    }
    histogram!("replication_pull_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record a completed push pass.
pub fn record_push_pass(collection: &str, accepted: usize, rejected: usize, duration: Duration) {
    counter!("replication_push_passes_total", "collection" => collection.to_string()).increment(1);
    counter!("replication_push_mutations_accepted_total", "collection" => collection.to_string())
        .increment(accepted as u64);
    if rejected > 0 {
        counter!("replication_push_mutations_rejected_total", "collection" => collection.to_string())
            .increment(rejected as u64);
    }
    histogram!("replication_push_duration_seconds", "collection" => collection.to_string())
        .record(duration.as_secs_f64());
}

/// Record a pass that ended in an error.
pub fn record_pass_failure(collection: &str, lane: &str, error_kind: &str) {
    counter!(
        "replication_pass_failures_total",
        "collection" => collection.to_string(),
        "lane" => lane.to_string(),
        "error_type" => error_kind.to_string()
    )
    .increment(1);
}

/// Record a document the local store refused to apply.
pub fn record_apply_failure(collection: &str) {
    counter!("replication_apply_failures_total", "collection" => collection.to_string()).increment(1);
}

/// Record what caused a pass to run.
pub fn record_trigger(collection: &str, lane: &str, source: &str) {
    counter!(
        "replication_triggers_total",
        "collection" => collection.to_string(),
        "lane" => lane.to_string(),
        "source" => source.to_string()
    )
    .increment(1);
}

// =============================================================================
// Persistence
// =============================================================================

/// Record a checkpoint write.
pub fn record_checkpoint_persist(collection: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_checkpoint_persists_total", "collection" => collection.to_string(), "status" => status)
        .increment(1);
}

/// Record an outbox enqueue.
pub fn record_outbox_enqueued(collection: &str) {
    counter!("replication_outbox_enqueued_total", "collection" => collection.to_string()).increment(1);
}

/// Pending outbox entries for a collection.
pub fn set_outbox_depth(collection: &str, depth: usize) {
    gauge!("replication_outbox_depth", "collection" => collection.to_string()).set(depth as f64);
}

/// Record mutations moved to the dead-letter set.
pub fn record_dead_lettered(collection: &str, count: usize) {
    counter!("replication_dead_lettered_total", "collection" => collection.to_string()).increment(count as u64);
}

/// Record SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn record_sqlite_retry(operation: &str) {
    counter!("replication_sqlite_retries_total", "operation" => operation.to_string()).increment(1);
}

// =============================================================================
// Realtime
// =============================================================================

/// Record a notification received.
pub fn record_realtime_event(collection: &str) {
    counter!("replication_realtime_events_total", "collection" => collection.to_string()).increment(1);
}

/// Record a dropped session that will be reconnected.
pub fn record_realtime_reconnect(scope: &str) {
    counter!("replication_realtime_reconnects_total", "scope" => scope.to_string()).increment(1);
}

/// Listener state gauge (0=disconnected, 1=connecting, 2=connected).
pub fn set_listener_state(scope: &str, state: &str) {
    let value = match state {
        "disconnected" => 0.0,
        "connecting" => 1.0,
        "connected" => 2.0,
        _ => -1.0,
    };
    gauge!("replication_listener_state", "scope" => scope.to_string()).set(value);
}

// =============================================================================
// State
// =============================================================================

/// Replication state gauge (0=stopped, 1=syncing, 2=idle, 3=error).
pub fn set_replication_state(collection: &str, state: &str) {
    let value = match state {
        "stopped" => 0.0,
        "syncing" => 1.0,
        "idle" => 2.0,
        "error" => 3.0,
        _ => -1.0,
    };
    gauge!("replication_state", "collection" => collection.to_string()).set(value);
}

/// Record a session token refresh.
pub fn record_session_refresh(success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("replication_session_refreshes_total", "status" => status).increment(1);
}
