// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for site-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `site_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `mode`: primary-remote, local-origin, direct-service
//! - `operation`: the operation segment of the request key: `all` and `id`
//!   for reads, `create`, `update` and `delete` for writes
//! - `status`: success, rejected, error, timeout
//!
//! Cache hits never reach a backend; they show up in
//! `site_sync_cache_lookups_total` instead.

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a backend request outcome
pub fn record_request(mode: &str, operation: &str, status: &str) {
    counter!(
        "site_sync_requests_total",
        "mode" => mode.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record request latency
pub fn record_latency(mode: &str, operation: &str, duration: Duration) {
    histogram!(
        "site_sync_request_seconds",
        "mode" => mode.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record a request cache lookup (`hit`, `miss` or `expired`)
pub fn record_cache_lookup(result: &'static str) {
    counter!("site_sync_cache_lookups_total", "result" => result).increment(1);
}

/// Set current cache entry count
pub fn set_cache_entries(count: usize) {
    gauge!("site_sync_cache_entries").set(count as f64);
}

/// Record a switch of the active backend mode during request execution
pub fn record_failover(from: &str, to: &str) {
    counter!(
        "site_sync_failovers_total",
        "from" => from.to_string(),
        "to" => to.to_string()
    )
    .increment(1);
}

/// Record a single mode probe
pub fn record_probe(mode: &str, reachable: bool, duration: Duration) {
    let status = if reachable { "reachable" } else { "unreachable" };
    counter!(
        "site_sync_probes_total",
        "mode" => mode.to_string(),
        "status" => status
    )
    .increment(1);
    histogram!("site_sync_probe_seconds", "mode" => mode.to_string())
        .record(duration.as_secs_f64());
}

/// Set degraded flag (1 = every probe failed)
pub fn set_backend_degraded(degraded: bool) {
    gauge!("site_sync_backend_degraded").set(if degraded { 1.0 } else { 0.0 });
}

/// Set active mode (one gauge per mode, 1 for the active one)
pub fn set_active_mode(mode: &str, active: bool) {
    gauge!("site_sync_active_mode", "mode" => mode.to_string())
        .set(if active { 1.0 } else { 0.0 });
}

/// Set backend health status
pub fn set_backend_healthy(mode: &str, healthy: bool) {
    gauge!(
        "site_sync_backend_healthy",
        "mode" => mode.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Set pending mutation queue depth
pub fn set_queue_depth(count: usize) {
    gauge!("site_sync_queue_depth").set(count as f64);
}

/// Record a mutation queued for later delivery
pub fn record_mutation_queued(entity: &str) {
    counter!("site_sync_mutations_queued_total", "entity" => entity.to_string()).increment(1);
}

/// Record a queue drain pass
pub fn record_drain(delivered: usize, stopped_early: bool) {
    let status = if stopped_early { "partial" } else { "complete" };
    counter!("site_sync_queue_drains_total", "status" => status).increment(1);
    counter!("site_sync_queue_delivered_total").increment(delivered as u64);
}

/// Record a queued mutation that will not be retried
pub fn record_permanent_failure(entity: &str) {
    counter!(
        "site_sync_queue_permanent_failures_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// Record reconciler writes to document regions
pub fn record_region_writes(count: usize) {
    counter!("site_sync_region_writes_total").increment(count as u64);
}

/// Record a change event ignored as stale
pub fn record_stale_event(entity: &str) {
    counter!("site_sync_stale_events_total", "entity" => entity.to_string()).increment(1);
}

/// Record a change feed or poll loop reconnect
pub fn record_subscriber_reconnect(entity: &str) {
    counter!(
        "site_sync_subscriber_reconnects_total",
        "entity" => entity.to_string()
    )
    .increment(1);
}

/// Record orchestrator state transitions
pub fn set_sync_state(state: &str) {
    counter!(
        "site_sync_state_transitions_total",
        "state" => state.to_string()
    )
    .increment(1);
}

/// Records one attempt's latency when dropped, whichever way it ended.
pub struct LatencyTimer<'a> {
    mode: &'static str,
    operation: &'a str,
    start: Instant,
}

impl<'a> LatencyTimer<'a> {
    pub fn new(mode: &'static str, operation: &'a str) -> Self {
        Self {
            mode,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer<'_> {
    fn drop(&mut self) {
        record_latency(self.mode, self.operation, self.start.elapsed());
    }
}
