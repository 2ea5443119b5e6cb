// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for the failover store.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `failover_store_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `backend`: configured backend name
//! - `family`: user, badge, interest_group, interest
//! - `op`: insert, update, delete
//! - `status`: success, error, skipped

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a connect attempt
pub fn record_connect(backend: &str, success: bool) {
    counter!(
        "failover_store_connects_total",
        "backend" => backend.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record a liveness probe
pub fn record_probe(backend: &str, alive: bool) {
    counter!(
        "failover_store_probes_total",
        "backend" => backend.to_string(),
        "status" => if alive { "success" } else { "error" }
    )
    .increment(1);
}

/// Set backend health status (1 = healthy, 0 = unhealthy)
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "failover_store_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record a promotion of a backup to master
pub fn record_failover(promoted: &str) {
    counter!(
        "failover_store_failovers_total",
        "backend" => promoted.to_string()
    )
    .increment(1);
}

/// Record that no backup could be promoted
pub fn record_exhausted() {
    counter!("failover_store_exhausted_total").increment(1);
}

/// Set which backend is master (1) or not (0)
pub fn set_master(backend: &str, is_master: bool) {
    gauge!(
        "failover_store_backend_master",
        "backend" => backend.to_string()
    )
    .set(if is_master { 1.0 } else { 0.0 });
}

/// Record a schema sync outcome
pub fn record_schema_sync(backend: &str, success: bool) {
    counter!(
        "failover_store_schema_syncs_total",
        "backend" => backend.to_string(),
        "status" => if success { "success" } else { "error" }
    )
    .increment(1);
}

/// Record replication operations applied to a backup
pub fn record_replication_ops(backend: &str, family: &str, op: &'static str, count: usize) {
    if count == 0 {
        return;
    }
    counter!(
        "failover_store_replication_ops_total",
        "backend" => backend.to_string(),
        "family" => family.to_string(),
        "op" => op
    )
    .increment(count as u64);
}

/// Record a failed family within a replication pass
pub fn record_replication_error(backend: &str, family: &str) {
    counter!(
        "failover_store_replication_errors_total",
        "backend" => backend.to_string(),
        "family" => family.to_string()
    )
    .increment(1);
}

/// Record the outcome of one backup within a pass
pub fn record_backup_pass(backend: &str, status: &'static str) {
    counter!(
        "failover_store_backup_passes_total",
        "backend" => backend.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record replication pass duration
pub fn record_pass_duration(duration: Duration) {
    histogram!("failover_store_replication_pass_seconds").record(duration.as_secs_f64());
}

/// Track connection state transitions
pub fn set_connection_state(state: &str) {
    counter!(
        "failover_store_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Record data-access call latency on drop.
pub struct LatencyTimer {
    operation: &'static str,
    family: String,
    start: Instant,
}

impl LatencyTimer {
    #[must_use]
    pub fn new(operation: &'static str, family: impl ToString) -> Self {
        Self {
            operation,
            family: family.to_string(),
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        histogram!(
            "failover_store_access_seconds",
            "operation" => self.operation,
            "family" => self.family.clone()
        )
        .record(self.start.elapsed().as_secs_f64());
    }
}
