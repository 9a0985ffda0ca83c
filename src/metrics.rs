// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tier-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host application is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tier_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `tier`: primary, cache, document
//! - `operation`: get, add, update, delete, exists, browse, invalidate
//! - `status`: success, error, not_found, conflict, timeout

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a repository operation outcome
pub fn record_operation(tier: &str, operation: &str, status: &str) {
    counter!(
        "tier_sync_operations_total",
        "tier" => tier.to_string(),
        "operation" => operation.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record operation latency
pub fn record_latency(tier: &str, operation: &str, duration: Duration) {
    histogram!(
        "tier_sync_operation_seconds",
        "tier" => tier.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record which tier answered a read
pub fn record_tier_hit(tier: &str) {
    counter!(
        "tier_sync_read_hits_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Record a miss (or a read error treated as one)
pub fn record_tier_miss(tier: &str) {
    counter!(
        "tier_sync_read_misses_total",
        "tier" => tier.to_string()
    )
    .increment(1);
}

/// Record a background population write
pub fn record_populate(tier: &str, status: &str) {
    counter!(
        "tier_sync_populate_total",
        "tier" => tier.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record an invalidation of a secondary tier entry
pub fn record_invalidation(tier: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!(
        "tier_sync_invalidations_total",
        "tier" => tier.to_string(),
        "status" => status
    )
    .increment(1);
}

/// Record a timed-out repository operation
pub fn record_timeout(operation: &str) {
    counter!(
        "tier_sync_timeouts_total",
        "operation" => operation.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNC WORKERS
// ═══════════════════════════════════════════════════════════════════════════

/// Record a finished sync cycle
pub fn record_sync_cycle(tier: &str, outcome: &str, duration: Duration) {
    counter!(
        "tier_sync_cycles_total",
        "tier" => tier.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
    histogram!(
        "tier_sync_cycle_seconds",
        "tier" => tier.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record records written to a secondary tier by a worker
pub fn record_propagated(tier: &str, count: usize) {
    counter!(
        "tier_sync_propagated_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Record records that exhausted their retry budget
pub fn record_skipped(tier: &str, count: usize) {
    counter!(
        "tier_sync_skipped_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

/// Set worker state (0 = idle, 1 = scanning, 2 = propagating, 3 = faulted, 4 = stopped)
pub fn set_worker_state(tier: &str, state: u8) {
    gauge!(
        "tier_sync_worker_state",
        "tier" => tier.to_string()
    )
    .set(state as f64);
}

/// Set how far the cursor trails the wall clock
pub fn set_cursor_lag(tier: &str, lag: Duration) {
    gauge!(
        "tier_sync_cursor_lag_seconds",
        "tier" => tier.to_string()
    )
    .set(lag.as_secs_f64());
}

/// Record records re-put by a reconcile pass
pub fn record_reconciled(tier: &str, count: usize) {
    counter!(
        "tier_sync_reconciled_total",
        "tier" => tier.to_string()
    )
    .increment(count as u64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CIRCUIT BREAKER - Resilience metrics
// ═══════════════════════════════════════════════════════════════════════════

/// Record circuit breaker call outcome
pub fn record_circuit_breaker_call(circuit: &str, outcome: &str) {
    counter!(
        "tier_sync_circuit_breaker_calls_total",
        "circuit" => circuit.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

/// Set number of live client connections
pub fn set_connections(count: usize) {
    gauge!("tier_sync_connections").set(count as f64);
}

/// A timing guard that records latency on drop
pub struct LatencyTimer {
    tier: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    pub fn new(tier: &'static str, operation: &'static str) -> Self {
        Self {
            tier,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.tier, self.operation, self.start.elapsed());
    }
}
