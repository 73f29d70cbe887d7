//! Observability for the sync engine
//!
//! Provides:
//! - Prometheus metrics (queue depth, operation outcomes, cache hit rate, conflicts)
//! - Structured logging of lifecycle events with tracing

use crate::models::ConnectionState;
use prometheus::{
    register_histogram, register_int_counter, register_int_gauge, register_int_gauge_vec,
    Histogram, IntCounter, IntGauge, IntGaugeVec,
};
use std::sync::OnceLock;
use tracing::{error, info, warn};

/// Buckets for operation latency (in seconds), network round trips included
const LATENCY_BUCKETS: &[f64] = &[
    0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

static GLOBAL_METRICS: OnceLock<EngineMetricsInner> = OnceLock::new();

struct EngineMetricsInner {
    queue_depth: IntGaugeVec,
    operations_queued: IntCounter,
    operations_synced: IntCounter,
    operations_failed: IntCounter,
    operations_retried: IntCounter,
    operation_latency_seconds: Histogram,
    cache_hits: IntCounter,
    cache_misses: IntCounter,
    cache_entries: IntGauge,
    sync_attempts: IntCounter,
    sync_failures: IntCounter,
    conflicts_detected: IntCounter,
    conflicts_resolved: IntCounter,
    timestamp_ties: IntCounter,
    circuit_open_rejections: IntCounter,
    connection_state: IntGauge,
}

impl EngineMetricsInner {
    fn new() -> Self {
        Self {
            queue_depth: register_int_gauge_vec!(
                "sync_engine_queue_depth",
                "Pending operations per queue channel",
                &["channel"]
            )
            .expect("Failed to register queue_depth"),

            operations_queued: register_int_counter!(
                "sync_engine_operations_queued_total",
                "Total operations accepted into a queue"
            )
            .expect("Failed to register operations_queued"),

            operations_synced: register_int_counter!(
                "sync_engine_operations_synced_total",
                "Total operations confirmed by the backend"
            )
            .expect("Failed to register operations_synced"),

            operations_failed: register_int_counter!(
                "sync_engine_operations_failed_total",
                "Total operations that exhausted their retries"
            )
            .expect("Failed to register operations_failed"),

            operations_retried: register_int_counter!(
                "sync_engine_operations_retried_total",
                "Total operation attempts that were requeued for retry"
            )
            .expect("Failed to register operations_retried"),

            operation_latency_seconds: register_histogram!(
                "sync_engine_operation_latency_seconds",
                "Time spent executing a single operation attempt",
                LATENCY_BUCKETS.to_vec()
            )
            .expect("Failed to register operation_latency_seconds"),

            cache_hits: register_int_counter!(
                "sync_engine_cache_hits_total",
                "Cache reads served without a fetch"
            )
            .expect("Failed to register cache_hits"),

            cache_misses: register_int_counter!(
                "sync_engine_cache_misses_total",
                "Cache reads that required a fetch"
            )
            .expect("Failed to register cache_misses"),

            cache_entries: register_int_gauge!(
                "sync_engine_cache_entries",
                "Number of entries currently held by the sync cache"
            )
            .expect("Failed to register cache_entries"),

            sync_attempts: register_int_counter!(
                "sync_engine_sync_attempts_total",
                "Cache refreshes and sync passes started"
            )
            .expect("Failed to register sync_attempts"),

            sync_failures: register_int_counter!(
                "sync_engine_sync_failures_total",
                "Cache refreshes and sync passes that failed"
            )
            .expect("Failed to register sync_failures"),

            conflicts_detected: register_int_counter!(
                "sync_engine_conflicts_detected_total",
                "Divergences between local writes and remote data"
            )
            .expect("Failed to register conflicts_detected"),

            conflicts_resolved: register_int_counter!(
                "sync_engine_conflicts_resolved_total",
                "Conflicts resolved by policy or by the application"
            )
            .expect("Failed to register conflicts_resolved"),

            timestamp_ties: register_int_counter!(
                "sync_engine_conflict_ties_total",
                "Conflicts whose timestamps or versions tied and defaulted to remote"
            )
            .expect("Failed to register timestamp_ties"),

            circuit_open_rejections: register_int_counter!(
                "sync_engine_circuit_open_rejections_total",
                "Calls rejected by an open circuit breaker"
            )
            .expect("Failed to register circuit_open_rejections"),

            connection_state: register_int_gauge!(
                "sync_engine_connection_state",
                "Connection state (0=offline, 1=online, 2=reconnecting, 3=unstable)"
            )
            .expect("Failed to register connection_state"),
        }
    }
}

/// Engine metrics for Prometheus exposition
///
/// A cheap handle to the process-wide collectors; clones share them.
#[derive(Clone)]
pub struct EngineMetrics {
    inner: &'static EngineMetricsInner,
}

impl Default for EngineMetrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for EngineMetrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str("EngineMetrics")
    }
}

impl EngineMetrics {
    pub fn new() -> Self {
        Self {
            inner: GLOBAL_METRICS.get_or_init(EngineMetricsInner::new),
        }
    }

    pub fn set_queue_depth(&self, channel: &str, depth: usize) {
        self.inner
            .queue_depth
            .with_label_values(&[channel])
            .set(depth as i64);
    }

    pub fn inc_operations_queued(&self) {
        self.inner.operations_queued.inc();
    }

    pub fn inc_operations_synced(&self) {
        self.inner.operations_synced.inc();
    }

    pub fn inc_operations_failed(&self) {
        self.inner.operations_failed.inc();
    }

    pub fn inc_operations_retried(&self) {
        self.inner.operations_retried.inc();
    }

    pub fn observe_operation_latency(&self, duration_secs: f64) {
        self.inner.operation_latency_seconds.observe(duration_secs);
    }

    pub fn inc_cache_hits(&self) {
        self.inner.cache_hits.inc();
    }

    pub fn inc_cache_misses(&self) {
        self.inner.cache_misses.inc();
    }

    pub fn set_cache_entries(&self, count: usize) {
        self.inner.cache_entries.set(count as i64);
    }

    pub fn inc_sync_attempts(&self) {
        self.inner.sync_attempts.inc();
    }

    pub fn inc_sync_failures(&self) {
        self.inner.sync_failures.inc();
    }

    pub fn inc_conflicts_detected(&self) {
        self.inner.conflicts_detected.inc();
    }

    pub fn inc_conflicts_resolved(&self) {
        self.inner.conflicts_resolved.inc();
    }

    pub fn inc_timestamp_ties(&self) {
        self.inner.timestamp_ties.inc();
    }

    pub fn inc_circuit_open_rejections(&self) {
        self.inner.circuit_open_rejections.inc();
    }

    pub fn set_connection_state(&self, state: ConnectionState) {
        let value = match state {
            ConnectionState::Offline => 0,
            ConnectionState::Online => 1,
            ConnectionState::Reconnecting => 2,
            ConnectionState::Unstable => 3,
        };
        self.inner.connection_state.set(value);
    }
}

/// Structured logger for engine lifecycle events
#[derive(Debug, Clone)]
pub struct StructuredLogger {
    instance: String,
}

impl StructuredLogger {
    pub fn new(instance: impl Into<String>) -> Self {
        Self {
            instance: instance.into(),
        }
    }

    pub fn log_startup(&self, version: &str) {
        info!(
            event = "engine_started",
            instance = %self.instance,
            version = %version,
            "Sync engine started"
        );
    }

    pub fn log_shutdown(&self, reason: &str) {
        info!(
            event = "engine_shutdown",
            instance = %self.instance,
            reason = %reason,
            "Sync engine shutting down"
        );
    }

    /// Log a connection state transition
    pub fn log_connection_change(
        &self,
        from: ConnectionState,
        to: ConnectionState,
        latency_ms: Option<u64>,
    ) {
        match to {
            ConnectionState::Offline | ConnectionState::Unstable => {
                warn!(
                    event = "connection_changed",
                    instance = %self.instance,
                    from = %from,
                    to = %to,
                    latency_ms = ?latency_ms,
                    "Connection degraded"
                );
            }
            _ => {
                info!(
                    event = "connection_changed",
                    instance = %self.instance,
                    from = %from,
                    to = %to,
                    latency_ms = ?latency_ms,
                    "Connection state changed"
                );
            }
        }
    }

    pub fn log_operation_exhausted(
        &self,
        operation_id: &str,
        channel: &str,
        attempts: u32,
        last_error: &str,
    ) {
        error!(
            event = "operation_exhausted",
            instance = %self.instance,
            operation_id = %operation_id,
            channel = %channel,
            attempts = attempts,
            last_error = %last_error,
            "Operation failed permanently"
        );
    }

    pub fn log_conflict_detected(&self, conflict_id: &str, key: &str, resolution: &str) {
        warn!(
            event = "conflict_detected",
            instance = %self.instance,
            conflict_id = %conflict_id,
            key = %key,
            resolution = %resolution,
            "Data conflict detected"
        );
    }

    /// Log the outcome of a full sync pass
    pub fn log_sync_cycle(
        &self,
        operations_drained: usize,
        keys_refreshed: usize,
        duration_ms: u64,
        success: bool,
    ) {
        if success {
            info!(
                event = "sync_completed",
                instance = %self.instance,
                operations_drained = operations_drained,
                keys_refreshed = keys_refreshed,
                duration_ms = duration_ms,
                "Sync pass completed"
            );
        } else {
            warn!(
                event = "sync_failed",
                instance = %self.instance,
                operations_drained = operations_drained,
                keys_refreshed = keys_refreshed,
                duration_ms = duration_ms,
                "Sync pass finished with pending work"
            );
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_metrics_handles_share_collectors() {
        let a = EngineMetrics::new();
        let b = EngineMetrics::new();
        a.set_queue_depth("observability-test", 4);
        b.set_queue_depth("observability-test", 7);

        let families = prometheus::gather();
        let depth = families
            .iter()
            .find(|f| f.get_name() == "sync_engine_queue_depth")
            .expect("queue depth registered");
        let sample = depth
            .get_metric()
            .iter()
            .find(|m| m.get_label().iter().any(|l| l.get_value() == "observability-test"))
            .expect("channel label present");
        assert_eq!(sample.get_gauge().get_value(), 7.0);
    }
}
