// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tree-sync.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The embedding application chooses the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tree_sync_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `reason`: debounce, immediate, manual (flushes); not_loaded, ignored_key (dropped events)
//! - `status`: success, error
//! - `source`: snapshot, change (applied events)

use metrics::{counter, gauge, histogram};
use std::time::{Duration, Instant};

/// Record a save accepted into a pending tree
pub fn record_save() {
    counter!("tree_sync_saves_total").increment(1);
}

/// Record one flush cycle and the number of update entries it carried
pub fn record_flush(reason: &str, status: &str, entries: usize) {
    counter!(
        "tree_sync_flushes_total",
        "reason" => reason.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
    histogram!("tree_sync_batch_entries").record(entries as f64);
}

/// Record store operation latency
pub fn record_latency(operation: &str, duration: Duration) {
    histogram!(
        "tree_sync_store_seconds",
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Set the number of sync roots with outstanding work
pub fn set_active_roots(count: usize) {
    gauge!("tree_sync_active_roots").set(count as f64);
}

/// Record a remote change parked as a confirmed value for a pending save
pub fn record_confirmed_echo() {
    counter!("tree_sync_confirmed_echoes_total").increment(1);
}

/// Record a remote value applied to the local tree
pub fn record_applied_event(source: &str) {
    counter!(
        "tree_sync_applied_events_total",
        "source" => source.to_string()
    )
    .increment(1);
}

/// Record a remote event the listener discarded
pub fn record_dropped_event(reason: &str) {
    counter!(
        "tree_sync_dropped_events_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

/// Record a listener failure (initial load error or store cancellation)
pub fn record_listener_error(kind: &str) {
    counter!(
        "tree_sync_listener_errors_total",
        "kind" => kind.to_string()
    )
    .increment(1);
}

/// Timer guard that records store latency on drop
pub struct LatencyTimer {
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(operation: &'static str) -> Self {
        Self {
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.operation, self.start.elapsed());
    }
}
