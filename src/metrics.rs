// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics instrumentation for tally-engine.
//!
//! Uses the `metrics` crate for backend-agnostic metrics collection.
//! The host process is responsible for choosing the exporter (Prometheus, OTEL, etc.)
//!
//! # Metric Naming Convention
//! - `tally_engine_` prefix for all metrics
//! - `_total` suffix for counters
//! - `_seconds` suffix for duration histograms
//!
//! # Labels
//! - `component`: buffer, ranking, snapshot, archive, platform
//! - `mode`: full, incremental, catch_up
//! - `status`: success, error, busy

use std::time::{Duration, Instant};

use metrics::{counter, gauge, histogram};

// ═══════════════════════════════════════════════════════════════════════════
// LIVE PATH - increments and cache maintenance on every counted message
// ═══════════════════════════════════════════════════════════════════════════

/// Record a live message event and whether each best-effort write landed
pub fn record_increment(component: &str, status: &str) {
    counter!(
        "tally_engine_increments_total",
        "component" => component.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record a live event ignored before any write (bot author, no guild)
pub fn record_ignored_event(reason: &str) {
    counter!(
        "tally_engine_ignored_events_total",
        "reason" => reason.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// WRITE-BEHIND - periodic drain of dirty accumulators into the counter store
// ═══════════════════════════════════════════════════════════════════════════

/// Record one guild flush
pub fn record_flush(records: usize, increments: u64, success: bool) {
    let status = if success { "success" } else { "error" };
    counter!("tally_engine_flushes_total", "status" => status).increment(1);
    if success {
        counter!("tally_engine_flushed_records_total").increment(records as u64);
        counter!("tally_engine_flushed_increments_total").increment(increments);
    }
}

/// Record increments dropped because a drained batch failed to commit
pub fn record_data_loss(increments: u64) {
    counter!("tally_engine_data_loss_increments_total").increment(increments);
}

/// Record hash fields that could not be decoded into counter keys
pub fn record_malformed_fields(count: usize) {
    counter!("tally_engine_malformed_fields_total").increment(count as u64);
}

/// Record flush cycle duration
pub fn record_flush_duration(duration: Duration) {
    histogram!("tally_engine_flush_seconds").record(duration.as_secs_f64());
}

/// Set number of guilds found dirty at the start of a flush cycle
pub fn set_dirty_guilds(count: usize) {
    gauge!("tally_engine_dirty_guilds").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// CACHES - ranking and page snapshots
// ═══════════════════════════════════════════════════════════════════════════

/// Record a page snapshot lookup
pub fn record_snapshot(hit: bool) {
    let result = if hit { "hit" } else { "miss" };
    counter!("tally_engine_snapshot_lookups_total", "result" => result).increment(1);
}

/// Record a ranking rebuild and its size
pub fn record_ranking_rebuild(users: usize) {
    counter!("tally_engine_ranking_rebuilds_total").increment(1);
    histogram!("tally_engine_ranking_rebuild_users").record(users as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// SYNCHRONIZATION - resync runs, locks and history paging
// ═══════════════════════════════════════════════════════════════════════════

/// Record the outcome of a sync run
pub fn record_sync_run(mode: &str, status: &str) {
    counter!(
        "tally_engine_sync_runs_total",
        "mode" => mode.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

/// Record sync run wall time
pub fn record_sync_duration(mode: &str, duration: Duration) {
    histogram!(
        "tally_engine_sync_seconds",
        "mode" => mode.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Record messages counted by a sync run
pub fn record_sync_messages(mode: &str, count: u64) {
    counter!(
        "tally_engine_sync_messages_total",
        "mode" => mode.to_string()
    )
    .increment(count);
}

/// Record a lock acquisition attempt
pub fn record_lock(acquired: bool) {
    let result = if acquired { "acquired" } else { "busy" };
    counter!("tally_engine_sync_lock_total", "result" => result).increment(1);
}

/// Record one history page request
pub fn record_page_fetch(status: &str) {
    counter!("tally_engine_page_fetches_total", "status" => status.to_string()).increment(1);
}

/// Set number of sync runs in flight on this instance
pub fn set_active_syncs(count: usize) {
    gauge!("tally_engine_active_syncs").set(count as f64);
}

// ═══════════════════════════════════════════════════════════════════════════
// COMMANDS
// ═══════════════════════════════════════════════════════════════════════════

/// Record one dispatched command and how its reply turned out
pub fn record_command(command: &str, outcome: &str) {
    counter!(
        "tally_engine_commands_total",
        "command" => command.to_string(),
        "outcome" => outcome.to_string()
    )
    .increment(1);
}

// ═══════════════════════════════════════════════════════════════════════════
// ERROR TRACKING - Categorized error counters for alerting
// ═══════════════════════════════════════════════════════════════════════════

/// Record an error with category for alerting
pub fn record_error(component: &str, operation: &str) {
    counter!(
        "tally_engine_errors_total",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Set backend health status
pub fn set_backend_healthy(backend: &str, healthy: bool) {
    gauge!(
        "tally_engine_backend_healthy",
        "backend" => backend.to_string()
    )
    .set(if healthy { 1.0 } else { 0.0 });
}

/// Record operation latency
pub fn record_latency(component: &str, operation: &str, duration: Duration) {
    histogram!(
        "tally_engine_operation_seconds",
        "component" => component.to_string(),
        "operation" => operation.to_string()
    )
    .record(duration.as_secs_f64());
}

/// Guard that records latency on drop.
pub struct LatencyTimer {
    component: &'static str,
    operation: &'static str,
    start: Instant,
}

impl LatencyTimer {
    /// Start a new latency timer
    pub fn new(component: &'static str, operation: &'static str) -> Self {
        Self {
            component,
            operation,
            start: Instant::now(),
        }
    }
}

impl Drop for LatencyTimer {
    fn drop(&mut self) {
        record_latency(self.component, self.operation, self.start.elapsed());
    }
}
