// src/worker.rs
//! Worker pool (C6): pulls jobs off [`crate::queue::JobQueue`], enforces
//! per-line mutual exclusion via [`crate::sync_lock::SyncLockTable`], and
//! drives the discovery -> download -> normalize -> extract -> persist
//! pipeline (spec §4.5/§5).
//!
//! Modeled on this crate's own health-checker task shape
//! (`ftp_pool.rs::spawn_health_checker`) generalized from a single
//! background loop to a configurable pool of per-queue worker tasks, each
//! an independent `tokio::spawn`ed unit reading from a shared queue.

use crate::deferred::{DeferPriority, DeferredQueue};
use crate::ftp_pool::FtpPool;
use crate::notifications::Notifier;
use crate::persistence::writer::{DbOperation, FileUpsert, PersistenceWriter};
use crate::queue::{Job, JobPayload, JobQueue};
use crate::sync_lock::SyncLockTable;
use crate::system_flags::SystemFlags;
use crate::types::QueueName;
use crate::{discovery, normalizer, price_extractor};
use log::{error, info, warn};
use rand::Rng;
use sqlx::PgPool;
use std::collections::HashSet;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Shared dependencies every worker task reads from; cloned cheaply (all
/// fields are `Arc`/`Clone` handles) into each spawned task.
#[derive(Clone)]
pub struct WorkerContext {
    pub ftp_pool: Arc<FtpPool>,
    pub queue: Arc<JobQueue>,
    pub sync_locks: Arc<SyncLockTable>,
    pub flags: Arc<SystemFlags>,
    pub deferred: Arc<DeferredQueue>,
    pub writer: Arc<PersistenceWriter>,
    pub db_pool: PgPool,
    pub notifier: Notifier,
    pub heartbeat: Duration,
    pub stalled: Duration,
    pub relock_backoff: Duration,
    pub window_months: u32,
    pub max_inline_batch: usize,
}

/// Spawns `webhook_concurrency` workers on `webhook-intake` and
/// `line_concurrency` workers on `cruise-line-processing`.
pub fn spawn_pool(
    ctx: Arc<WorkerContext>,
    webhook_concurrency: usize,
    line_concurrency: usize,
) -> Vec<tokio::task::JoinHandle<()>> {
    let mut handles = Vec::with_capacity(webhook_concurrency + line_concurrency);

    for worker_id in 0..webhook_concurrency {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            run_webhook_intake_loop(ctx, format!("webhook-worker-{}", worker_id)).await;
        }));
    }

    for worker_id in 0..line_concurrency {
        let ctx = ctx.clone();
        handles.push(tokio::spawn(async move {
            run_line_processing_loop(ctx, format!("line-worker-{}", worker_id)).await;
        }));
    }

    handles
}

async fn run_webhook_intake_loop(ctx: Arc<WorkerContext>, owner: String) {
    loop {
        let reserved = ctx
            .queue
            .reserve(QueueName::WebhookIntake, Duration::from_secs(5))
            .await;
        let Some((job, cancelled)) = reserved else {
            continue;
        };

        let JobPayload::WebhookIntake { event_id } = job.payload else {
            ctx.queue.mark_skipped(QueueName::WebhookIntake, job.id);
            continue;
        };

        if cancelled.load(Ordering::SeqCst) {
            ctx.queue.mark_skipped(QueueName::WebhookIntake, job.id);
            continue;
        }

        match materialize_line_batch(&ctx, event_id).await {
            Ok(()) => {
                ctx.queue.complete(QueueName::WebhookIntake, job.id);
                crate::metrics::increment_job_completed(QueueName::WebhookIntake.as_str());
            }
            Err(e) => {
                warn!("{} failed to materialize webhook {}: {}", owner, event_id, e);
                ctx.queue.fail(QueueName::WebhookIntake, job.id, true);
                crate::metrics::increment_job_retried(QueueName::WebhookIntake.as_str());
            }
        }
    }
}

/// Reads the pending `WebhookEvent`, marks it `processing`, and enqueues the
/// `cruise-line-processing` job for its line (spec §4.6 step 5).
async fn materialize_line_batch(ctx: &WorkerContext, event_id: Uuid) -> anyhow::Result<()> {
    let row: Option<(i32,)> = sqlx::query_as(&format!(
        "SELECT line_id FROM {}.webhook_events WHERE id = $1",
        crate::persistence::SCHEMA
    ))
    .bind(event_id)
    .fetch_optional(&ctx.db_pool)
    .await?;

    let Some((line_id,)) = row else {
        warn!("webhook event {} not found, dropping", event_id);
        return Ok(());
    };

    sqlx::query(&format!(
        "UPDATE {}.webhook_events SET status = 'processing' WHERE id = $1",
        crate::persistence::SCHEMA
    ))
    .bind(event_id)
    .execute(&ctx.db_pool)
    .await?;

    ctx.queue.enqueue(JobPayload::CruiseLineProcessing {
        line_id,
        webhook_event_id: event_id,
    });
    Ok(())
}

async fn run_line_processing_loop(ctx: Arc<WorkerContext>, owner: String) {
    loop {
        let reserved = ctx
            .queue
            .reserve(QueueName::CruiseLineProcessing, Duration::from_secs(5))
            .await;
        let Some((job, cancelled)) = reserved else {
            continue;
        };

        match job.payload.clone() {
            JobPayload::CruiseLineProcessing { line_id, webhook_event_id } => {
                handle_line_job(&ctx, &owner, job, line_id, Some(webhook_event_id), cancelled).await;
            }
            JobPayload::BatchSync => {
                handle_batch_sync_job(&ctx, &owner, job, cancelled).await;
            }
            JobPayload::WebhookIntake { .. } => {
                ctx.queue.mark_skipped(QueueName::CruiseLineProcessing, job.id);
            }
        }
    }
}

async fn handle_line_job(
    ctx: &Arc<WorkerContext>,
    owner: &str,
    job: Job,
    line_id: i32,
    webhook_event_id: Option<Uuid>,
    cancelled: Arc<AtomicBool>,
) {
    if !ctx.sync_locks.try_acquire(line_id, owner) {
        crate::metrics::increment_sync_lock_contended();
        requeue_after_relock_backoff(ctx.clone(), job.payload.clone());
        ctx.queue.mark_skipped(QueueName::CruiseLineProcessing, job.id);
        return;
    }
    SyncLockTable::persist_acquire(&ctx.db_pool, line_id, owner).await;

    let heartbeat_handle = spawn_heartbeat(ctx.clone(), QueueName::CruiseLineProcessing, job.id, cancelled.clone());

    let outcome = process_line_batch(ctx, line_id, None, webhook_event_id, cancelled.clone()).await;

    heartbeat_handle.abort();
    ctx.sync_locks.release(line_id);
    SyncLockTable::persist_release(&ctx.db_pool, line_id).await;

    match outcome {
        Ok(ProcessOutcome::Completed { processed, failed }) => {
            ctx.queue.complete(QueueName::CruiseLineProcessing, job.id);
            crate::metrics::increment_job_completed(QueueName::CruiseLineProcessing.as_str());
            if let Some(event_id) = webhook_event_id {
                mark_webhook_event(ctx, event_id, "completed", None).await;
            }
            ctx.notifier.batch_completed(line_id, processed, failed).await;
        }
        Ok(ProcessOutcome::Deferred { file_count }) => {
            ctx.queue.complete(QueueName::CruiseLineProcessing, job.id);
            if let Some(event_id) = webhook_event_id {
                mark_webhook_event(ctx, event_id, "completed", None).await;
            }
            info!(
                "{} deferred {} files for line {} (exceeds max_inline_batch)",
                owner, file_count, line_id
            );
        }
        Ok(ProcessOutcome::Cancelled) => {
            ctx.queue.mark_skipped(QueueName::CruiseLineProcessing, job.id);
            if let Some(event_id) = webhook_event_id {
                mark_webhook_event(ctx, event_id, "skipped", Some("cancelled")).await;
            }
        }
        Err(e) => {
            error!("{} line {} batch failed: {}", owner, line_id, e);
            ctx.queue.fail(QueueName::CruiseLineProcessing, job.id, e.is_retriable());
            crate::metrics::increment_job_retried(QueueName::CruiseLineProcessing.as_str());
            if let Some(event_id) = webhook_event_id {
                mark_webhook_event(ctx, event_id, "failed", Some(&e.to_string())).await;
            }
            ctx.notifier
                .job_failed(QueueName::CruiseLineProcessing.as_str(), job.id, &e.to_string())
                .await;
        }
    }
}

async fn handle_batch_sync_job(ctx: &Arc<WorkerContext>, owner: &str, job: Job, cancelled: Arc<AtomicBool>) {
    if ctx.flags.batch_sync_paused() {
        ctx.queue.mark_skipped(QueueName::CruiseLineProcessing, job.id);
        return;
    }

    let marks = ctx.deferred.select_for_drain(ctx.flags.snapshot().max_cruises_per_webhook);
    if marks.is_empty() {
        ctx.queue.complete(QueueName::CruiseLineProcessing, job.id);
        return;
    }

    let mut by_line: std::collections::HashMap<i32, Vec<String>> = std::collections::HashMap::new();
    for mark in &marks {
        by_line.entry(mark.line_id).or_default().push(mark.code_to_cruise_id.clone());
    }

    let mut drained = Vec::new();
    for (line_id, codes) in by_line {
        if !ctx.sync_locks.try_acquire(line_id, owner) {
            continue;
        }
        SyncLockTable::persist_acquire(&ctx.db_pool, line_id, owner).await;
        let filter: HashSet<String> = codes.iter().cloned().collect();
        let result = process_line_batch(ctx, line_id, Some(filter), None, cancelled.clone()).await;
        ctx.sync_locks.release(line_id);
        SyncLockTable::persist_release(&ctx.db_pool, line_id).await;
        if result.is_ok() {
            drained.extend(codes);
        }
    }

    ctx.deferred.remove_drained(&drained);
    ctx.queue.complete(QueueName::CruiseLineProcessing, job.id);
}

/// Periodically enqueues a [`JobPayload::BatchSync`] job so the marks left by
/// [`DeferredQueue::mark_pending`] for oversized lines actually get drained
/// (spec §4.7/§4.13: "a separate periodic batch-sync job drains these marks
/// at a throttled rate"). Modeled on `reaper::spawn`'s tick-and-tolerate loop.
pub fn spawn_batch_sync_scheduler(
    queue: Arc<JobQueue>,
    flags: Arc<SystemFlags>,
    deferred: Arc<DeferredQueue>,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if flags.batch_sync_paused() {
                continue;
            }
            if deferred.is_empty() {
                continue;
            }
            queue.enqueue(JobPayload::BatchSync);
        }
    })
}

enum ProcessOutcome {
    Completed { processed: usize, failed: usize },
    Deferred { file_count: usize },
    Cancelled,
}

/// The discovery -> download -> normalize -> extract -> persist pipeline for
/// one line (spec §4.2-§4.7). When `filter` is `Some`, only files whose
/// `codeToCruiseId` is in the set are processed (the deferred-drain path).
async fn process_line_batch(
    ctx: &Arc<WorkerContext>,
    line_id: i32,
    filter: Option<HashSet<String>>,
    webhook_event_id: Option<Uuid>,
    cancelled: Arc<AtomicBool>,
) -> Result<ProcessOutcome, crate::errors::IngestError> {
    let mut files = discovery::discover(&ctx.ftp_pool, line_id, ctx.window_months).await;

    if let Some(filter) = &filter {
        files.retain(|f| filter.contains(&f.code_to_cruise_id));
    } else if files.len() > ctx.max_inline_batch {
        for file in &files {
            if ctx
                .deferred
                .mark_pending(&file.code_to_cruise_id, line_id, DeferPriority::Normal)
                .is_ok()
            {
                let _ = ctx.writer.send(DbOperation::MarkNeedsPriceUpdate {
                    code_to_cruise_id: file.code_to_cruise_id.clone(),
                });
            }
        }
        crate::metrics::increment_deferred_marks(files.len() as u64);
        return Ok(ProcessOutcome::Deferred { file_count: files.len() });
    }

    ctx.notifier.batch_started(line_id, files.len()).await;

    let mut processed = 0usize;
    let mut failed = 0usize;

    for file in files {
        if cancelled.load(Ordering::SeqCst) {
            return Ok(ProcessOutcome::Cancelled);
        }

        let bytes = match ctx.ftp_pool.download(&file.path).await {
            Ok(bytes) => bytes,
            Err(e) if e.is_retriable() => return Err(e),
            Err(e) => {
                warn!("skipping {}: {}", file.path, e);
                failed += 1;
                continue;
            }
        };

        let raw = match normalizer::detect_and_reconstruct(&file.path, &bytes) {
            Ok(raw) => raw,
            Err(_) => {
                failed += 1;
                continue;
            }
        };

        let record = normalizer::canonicalize(&raw);
        let prices = price_extractor::extract(raw.value(), line_id);

        let upsert = FileUpsert {
            line_name: field_str(raw.value(), "linename"),
            ship_name: field_str(raw.value(), "shipname"),
            port_names: port_names_from(raw.value(), &record),
            region_names: region_names_from(raw.value(), &record),
            record,
            prices,
            webhook_event_id,
        };

        if ctx.writer.send(DbOperation::UpsertFile(Box::new(upsert))).is_err() {
            return Err(crate::errors::IngestError::DbConflict(
                "persistence writer unavailable".to_string(),
            ));
        }
        processed += 1;
    }

    Ok(ProcessOutcome::Completed { processed, failed })
}

fn field_str(v: &serde_json::Value, key: &str) -> Option<String> {
    v.get(key).and_then(|x| x.as_str()).map(str::to_string)
}

fn port_names_from(_v: &serde_json::Value, record: &crate::types::CanonicalRecord) -> Vec<(i32, Option<String>)> {
    record.port_ids.iter().map(|id| (*id, None)).collect()
}

fn region_names_from(_v: &serde_json::Value, record: &crate::types::CanonicalRecord) -> Vec<(i32, Option<String>)> {
    record.region_ids.iter().map(|id| (*id, None)).collect()
}

async fn mark_webhook_event(ctx: &WorkerContext, event_id: Uuid, status: &str, error_message: Option<&str>) {
    let result = sqlx::query(&format!(
        "UPDATE {}.webhook_events SET status = $1, processed_at = NOW(), error_message = $2 WHERE id = $3",
        crate::persistence::SCHEMA
    ))
    .bind(status)
    .bind(error_message)
    .bind(event_id)
    .execute(&ctx.db_pool)
    .await;
    if let Err(e) = result {
        error!("failed to update webhook event {} status: {}", event_id, e);
    }
}

/// Re-enqueues a cruise-line-processing job after `relockBackoffMs` (jittered),
/// without counting it against the job's retry budget, per spec §4.5.
fn requeue_after_relock_backoff(ctx: Arc<WorkerContext>, payload: JobPayload) {
    let delay = jittered(ctx.relock_backoff);
    tokio::spawn(async move {
        tokio::time::sleep(delay).await;
        ctx.queue.enqueue(payload);
    });
}

fn jittered(base: Duration) -> Duration {
    let factor: f64 = rand::thread_rng().gen_range(0.5..1.5);
    Duration::from_millis((base.as_millis() as f64 * factor) as u64)
}

fn spawn_heartbeat(
    ctx: Arc<WorkerContext>,
    queue: QueueName,
    job_id: Uuid,
    cancelled: Arc<AtomicBool>,
) -> tokio::task::JoinHandle<()> {
    let interval = ctx.heartbeat;
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if cancelled.load(Ordering::SeqCst) {
                break;
            }
            ctx.queue.heartbeat(queue, job_id);
        }
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn jittered_delay_stays_within_expected_range() {
        let base = Duration::from_millis(1000);
        for _ in 0..20 {
            let d = jittered(base);
            assert!(d.as_millis() >= 500 && d.as_millis() <= 1500);
        }
    }
}
