// Copyright (c) 2025-2026 Adrian Robinson. Licensed under the AGPL-3.0.
// See LICENSE file in the project root for full license text.

//! Metrics for observability.
//!
//! Exports Prometheus-compatible metrics for:
//! - Log tailing (transactions read, idle polls, read errors)
//! - Translation (facts, skips, placeholders, duration)
//! - Destination commits (applied, failures, duration)
//! - Resume position and controller state
//! - Resume store retries and lease events
//!
//! # Metric Naming Convention
//!
//! All metrics are prefixed with `mirror_` and follow Prometheus conventions:
//! - Counters end in `_total`
//! - Gauges represent current state
//! - Histograms track distributions (duration)
//!
//! Every per-pair metric carries a `pair` label (`"{source}=>{destination}"`).
//! Installing an exporter is the host's job; without one these calls are no-ops.
//!
//! # Usage
//!
//! ```rust,no_run
//! use mirror_engine::metrics;
//! use std::time::Duration;
//!
//! metrics::record_transactions_read("prod=>dr", 12);
//! metrics::record_commit("prod=>dr", Duration::from_millis(8));
//! ```

use crate::translate::TranslationStats;
use metrics::{counter, gauge, histogram};
use std::time::Duration;

// =============================================================================
// Tailer
// =============================================================================

/// Record transactions delivered by a log range read.
pub fn record_transactions_read(pair: &str, count: usize) {
    counter!("mirror_transactions_read_total", "pair" => pair.to_string()).increment(count as u64);
}

/// Record transactions dropped by the ordering guard (already emitted).
pub fn record_transactions_duplicate(pair: &str, count: usize) {
    counter!("mirror_transactions_duplicate_total", "pair" => pair.to_string()).increment(count as u64);
}

/// Record an empty range read followed by a poll sleep.
pub fn record_idle_poll(pair: &str) {
    counter!("mirror_idle_polls_total", "pair" => pair.to_string()).increment(1);
}

/// Record a failed source read (log range or snapshot).
pub fn record_source_read_error(pair: &str, operation: &str) {
    counter!(
        "mirror_source_read_errors_total",
        "pair" => pair.to_string(),
        "operation" => operation.to_string()
    )
    .increment(1);
}

/// Record log range read latency.
pub fn record_read_latency(pair: &str, duration: Duration) {
    histogram!("mirror_read_duration_seconds", "pair" => pair.to_string())
        .record(duration.as_secs_f64());
}

// =============================================================================
// Translation + commit
// =============================================================================

/// Record translation of one transaction.
pub fn record_translation(pair: &str, stats: &TranslationStats, duration: Duration) {
    let pair = pair.to_string();
    counter!("mirror_facts_translated_total", "pair" => pair.clone())
        .increment(stats.facts.saturating_sub(stats.skipped) as u64);
    if stats.skipped > 0 {
        counter!("mirror_facts_skipped_total", "pair" => pair.clone()).increment(stats.skipped as u64);
    }
    if stats.placeholders > 0 {
        counter!("mirror_placeholders_allocated_total", "pair" => pair.clone())
            .increment(stats.placeholders as u64);
    }
    histogram!("mirror_translate_duration_seconds", "pair" => pair).record(duration.as_secs_f64());
}

/// Record a successful destination commit.
pub fn record_commit(pair: &str, duration: Duration) {
    counter!("mirror_transactions_applied_total", "pair" => pair.to_string()).increment(1);
    histogram!("mirror_commit_duration_seconds", "pair" => pair.to_string())
        .record(duration.as_secs_f64());
}

/// Record a failed destination commit.
pub fn record_commit_failure(pair: &str) {
    counter!("mirror_commit_failures_total", "pair" => pair.to_string()).increment(1);
}

/// Record a translation failure.
pub fn record_translation_failure(pair: &str) {
    counter!("mirror_translation_failures_total", "pair" => pair.to_string()).increment(1);
}

/// Gauge for the last fully replicated source `t`.
pub fn set_resume_position(pair: &str, t: u64) {
    gauge!("mirror_resume_position", "pair" => pair.to_string()).set(t as f64);
}

// =============================================================================
// Controller + resume store
// =============================================================================

/// Gauge for controller state.
pub fn set_controller_state(pair: &str, state: &str) {
    // Encode state as numeric for alerting
    let value = match state {
        "Created" => 0.0,
        "Running" => 1.0,
        "Stopped" => 2.0,
        "Failed" => 3.0,
        _ => -1.0,
    };
    gauge!("mirror_controller_state", "pair" => pair.to_string()).set(value);
}

/// Record resume store SQLite retry (for SQLITE_BUSY/SQLITE_LOCKED).
pub fn resume_store_retries_total(operation: &str) {
    counter!("mirror_resume_store_retries_total", "operation" => operation.to_string()).increment(1);
}

/// Record a position write.
pub fn record_position_persist(pair: &str, success: bool) {
    let status = if success { "success" } else { "failure" };
    counter!("mirror_position_persists_total", "pair" => pair.to_string(), "status" => status).increment(1);
}

/// Record a lease event (`acquired`, `renewed`, `lost`, `released`, `refused`).
pub fn record_lease_event(pair: &str, event: &str) {
    counter!(
        "mirror_lease_events_total",
        "pair" => pair.to_string(),
        "event" => event.to_string()
    )
    .increment(1);
}
