// src/metrics.rs
//! Observability surface for the ingestion pipeline (C10, spec §4.10).
//!
//! Kept in the same dual-mode shape this crate always used: with the
//! `observability` feature enabled, these call through to the real
//! `metrics` crate facade (wired to Prometheus by the binary); disabled,
//! they compile to no-ops so the rest of the crate never has to branch
//! on the feature itself.

#[cfg(feature = "observability")]
pub use metrics::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter, Unit,
};

#[cfg(not(feature = "observability"))]
pub enum Unit {}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! counter {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! gauge {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! histogram {
    ($name:expr, $value:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! increment_counter {
    ($name:expr $(, $label:expr => $label_value:expr)* $(,)?) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_counter {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_gauge {
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
#[macro_export]
macro_rules! describe_histogram {
    ($name:expr, $unit:expr, $desc:expr) => {};
    ($name:expr, $desc:expr) => {};
}

#[cfg(not(feature = "observability"))]
use crate::{
    counter, describe_counter, describe_gauge, describe_histogram, gauge, histogram,
    increment_counter,
};

use std::time::Duration;

/// Registers descriptions for every metric this crate emits. Call once at
/// startup from the worker binary.
pub fn describe_metrics() {
    describe_gauge!("ingest_worker_up", "Worker process liveness (1=up).");

    describe_counter!(
        "ingest_normalization_failed_total",
        Unit::Count,
        "Files that failed normalization (C3) after exhausting all known raw shapes."
    );

    describe_gauge!(
        "ingest_circuit_breaker_state",
        "FTP circuit breaker state per host (0=closed, 1=open, 2=half-open)."
    );
    describe_counter!(
        "ingest_circuit_breaker_opened_total",
        Unit::Count,
        "Number of times the FTP circuit breaker tripped open, labeled by host."
    );
    describe_counter!(
        "ingest_ftp_operations_total",
        Unit::Count,
        "FTP pool operations, labeled by op (list/download) and outcome (success/failure)."
    );

    describe_gauge!(
        "ingest_queue_depth",
        "Current job count per queue and state (waiting/active/delayed), labeled by queue."
    );
    describe_counter!(
        "ingest_jobs_completed_total",
        Unit::Count,
        "Jobs that reached a terminal completed state, labeled by queue."
    );
    describe_counter!(
        "ingest_jobs_failed_total",
        Unit::Count,
        "Jobs that exhausted retries and moved to the dead letter, labeled by queue."
    );
    describe_counter!(
        "ingest_jobs_retried_total",
        Unit::Count,
        "Jobs rescheduled after a retriable failure, labeled by queue."
    );

    describe_counter!(
        "ingest_sync_lock_contended_total",
        Unit::Count,
        "Attempts to acquire a per-line sync lock that were already held."
    );

    describe_histogram!(
        "ingest_db_batch_duration_ms",
        Unit::Milliseconds,
        "Time to commit one persistence batch."
    );
    describe_histogram!(
        "ingest_db_batch_size",
        Unit::Count,
        "Number of operations committed per persistence batch."
    );
    describe_counter!(
        "ingest_price_snapshots_total",
        Unit::Count,
        "Price snapshots written because a category price moved beyond the change epsilon."
    );

    describe_counter!(
        "ingest_webhooks_received_total",
        Unit::Count,
        "Webhook admission outcomes, labeled by outcome (accepted/skipped_paused/skipped_dedup/rejected)."
    );

    describe_counter!(
        "ingest_reaper_stalled_jobs_requeued_total",
        Unit::Count,
        "Active jobs the reaper found stalled past the heartbeat threshold and requeued."
    );
    describe_counter!(
        "ingest_reaper_sync_locks_released_total",
        Unit::Count,
        "Sync locks the reaper force-released after exceeding lockTtlMs."
    );
    describe_counter!(
        "ingest_reaper_webhook_events_reclaimed_total",
        Unit::Count,
        "WebhookEvents stuck in processing the reaper marked failed."
    );

    describe_counter!(
        "ingest_deferred_marks_total",
        Unit::Count,
        "Sailings marked needs_price_update because Discovery exceeded max_inline_batch."
    );
    describe_gauge!(
        "ingest_deferred_queue_depth",
        "Current count of sailings pending a deferred price update."
    );
}

pub fn increment_normalization_failed() {
    counter!("ingest_normalization_failed_total", 1);
}

pub fn set_circuit_breaker_state(host: &str, state: f64) {
    gauge!("ingest_circuit_breaker_state", state, "host" => host.to_string());
}

pub fn increment_circuit_breaker_opened(host: &str) {
    counter!("ingest_circuit_breaker_opened_total", 1, "host" => host.to_string());
}

pub fn increment_ftp_operation(op: &str, outcome: &str) {
    counter!("ingest_ftp_operations_total", 1, "op" => op.to_string(), "outcome" => outcome.to_string());
}

pub fn set_queue_depth(queue: &str, state: &str, depth: f64) {
    gauge!("ingest_queue_depth", depth, "queue" => queue.to_string(), "state" => state.to_string());
}

pub fn increment_job_completed(queue: &str) {
    counter!("ingest_jobs_completed_total", 1, "queue" => queue.to_string());
}

pub fn increment_job_failed(queue: &str) {
    counter!("ingest_jobs_failed_total", 1, "queue" => queue.to_string());
}

pub fn increment_job_retried(queue: &str) {
    counter!("ingest_jobs_retried_total", 1, "queue" => queue.to_string());
}

pub fn increment_sync_lock_contended() {
    counter!("ingest_sync_lock_contended_total", 1);
}

pub fn record_db_batch_duration(duration: Duration) {
    histogram!("ingest_db_batch_duration_ms", duration.as_secs_f64() * 1000.0);
}

pub fn record_db_batch_size(size: usize) {
    histogram!("ingest_db_batch_size", size as f64);
}

pub fn increment_price_snapshots() {
    counter!("ingest_price_snapshots_total", 1);
}

pub fn increment_webhook_received(outcome: &str) {
    counter!("ingest_webhooks_received_total", 1, "outcome" => outcome.to_string());
}

pub fn increment_reaper_stalled_jobs_requeued(count: u64) {
    counter!("ingest_reaper_stalled_jobs_requeued_total", count);
}

pub fn increment_reaper_sync_locks_released(count: u64) {
    counter!("ingest_reaper_sync_locks_released_total", count);
}

pub fn increment_reaper_webhook_events_reclaimed(count: u64) {
    counter!("ingest_reaper_webhook_events_reclaimed_total", count);
}

pub fn increment_deferred_marks(count: u64) {
    counter!("ingest_deferred_marks_total", count);
}

pub fn set_deferred_queue_depth(depth: f64) {
    gauge!("ingest_deferred_queue_depth", depth);
}
