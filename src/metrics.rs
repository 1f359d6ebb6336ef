// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics through the `metrics` facade for:
//! - Local mutations and remote entry application
//! - Per-peer shipping and backlog
//! - Wire decode failures
//! - Query pipeline delivery, drops and backpressure stalls
//! - Collection RPC commands
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `grid_replication_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration, size)
//!
//! No recorder is installed by this crate; without one every call is a no-op.

use metrics::{counter, gauge, histogram};
use std::time::Duration;

/// Record a local mutation (put/remove/CAS/clear-deletion).
pub fn record_local_mutation(store: &str, op: &'static str) {
    counter!("grid_replication_local_mutations_total", "store" => store.to_string(), "op" => op).increment(1);
}

/// Record the outcome of applying a remote entry.
pub fn record_remote_apply(store: &str, origin: u8, applied: bool) {
    let outcome = if applied { "applied" } else { "discarded" };
    counter!(
        "grid_replication_remote_entries_total",
        "store" => store.to_string(),
        "origin" => origin.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record entries shipped to a peer.
pub fn record_entries_shipped(peer: u8, count: usize) {
    counter!("grid_replication_entries_shipped_total", "peer" => peer.to_string()).increment(count as u64);
}

/// Record a batch send latency.
pub fn record_batch_send_latency(peer: u8, duration: Duration) {
    histogram!("grid_replication_batch_send_duration_seconds", "peer" => peer.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed batch send.
pub fn record_send_failure(peer: u8) {
    counter!("grid_replication_send_failures_total", "peer" => peer.to_string()).increment(1);
}

/// Gauge of undelivered entries for a peer.
pub fn set_peer_backlog(peer: u8, backlog: usize) {
    gauge!("grid_replication_peer_backlog", "peer" => peer.to_string()).set(backlog as f64);
}

/// Record a bootstrap/backfill re-arm.
pub fn record_backfill(peer: u8, rearmed: usize) {
    counter!("grid_replication_backfills_total", "peer" => peer.to_string()).increment(1);
    counter!("grid_replication_backfill_entries_total", "peer" => peer.to_string()).increment(rearmed as u64);
}

/// Record a wire record that was skipped.
pub fn record_decode_failure(reason: &'static str) {
    counter!("grid_replication_decode_failures_total", "reason" => reason).increment(1);
}

/// Record elements delivered to a query consumer.
pub fn record_query_delivered(count: u64) {
    counter!("grid_replication_query_elements_delivered_total").increment(count);
}

/// Record an element dropped by the query pipeline.
pub fn record_query_dropped(path: &'static str) {
    counter!("grid_replication_query_elements_dropped_total", "path" => path).increment(1);
}

/// Record a backpressure stall (bounded offer timed out).
pub fn record_backpressure_stall(waited: Duration) {
    counter!("grid_replication_backpressure_stalls_total").increment(1);
    histogram!("grid_replication_backpressure_wait_seconds").record(waited.as_secs_f64());
}

/// Gauge for live change listeners on a store.
pub fn set_active_listeners(store: &str, count: usize) {
    gauge!("grid_replication_active_listeners", "store" => store.to_string()).set(count as f64);
}

/// Record a collection RPC command outcome.
pub fn record_rpc_command(command: &str, success: bool) {
    let outcome = if success { "ok" } else { "error" };
    counter!(
        "grid_replication_rpc_commands_total",
        "command" => command.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}

/// Record circuit breaker call outcome.
pub fn record_circuit_call(circuit_name: &str, outcome: &'static str) {
    counter!(
        "grid_replication_circuit_calls_total",
        "circuit" => circuit_name.to_string(),
        "outcome" => outcome
    )
    .increment(1);
}
