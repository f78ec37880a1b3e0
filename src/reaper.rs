// src/reaper.rs
//! Periodic sweeper (C11, spec §4.9): reclaims stalled jobs, stuck
//! WebhookEvents, and expired SyncLocks in one pass every `interval_ms`.
//!
//! Modeled on this crate's own `ftp_pool.rs::spawn_health_checker` periodic
//! task shape, generalized from session health to three independent sweeps
//! over queue/lock/event state.

use crate::notifications::Notifier;
use crate::queue::JobQueue;
use crate::sync_lock::SyncLockTable;
use crate::types::QueueName;
use chrono::Duration as ChronoDuration;
use log::{info, warn};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

pub struct ReaperConfig {
    pub interval: Duration,
    pub stalled: Duration,
    pub webhook_event_stuck: ChronoDuration,
    pub lock_ttl: ChronoDuration,
    pub event_retention: ChronoDuration,
}

/// Spawns the reaper loop. Runs until the process exits; failures in one
/// sweep are logged and do not stop subsequent ticks.
pub fn spawn(
    config: ReaperConfig,
    queue: Arc<JobQueue>,
    sync_locks: Arc<SyncLockTable>,
    db_pool: PgPool,
    notifier: Notifier,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(config.interval);
        loop {
            ticker.tick().await;
            sweep_stalled_jobs(&queue, &config, &notifier).await;
            sweep_stale_sync_locks(&sync_locks, &config, &notifier).await;
            match SyncLockTable::persist_release_stale(&db_pool, config.lock_ttl).await {
                Ok(released) if !released.is_empty() => {
                    info!("reaper: force-released {} stale persisted sync locks", released.len());
                }
                Ok(_) => {}
                Err(e) => warn!("reaper: persisted sync lock sweep failed: {}", e),
            }
            if let Err(e) = sweep_stuck_webhook_events(&db_pool, &config, &notifier).await {
                warn!("reaper: webhook event sweep failed: {}", e);
            }
            if let Err(e) = prune_old_webhook_events(&db_pool, &config).await {
                warn!("reaper: webhook event retention prune failed: {}", e);
            }
        }
    })
}

async fn sweep_stalled_jobs(queue: &Arc<JobQueue>, config: &ReaperConfig, notifier: &Notifier) {
    let mut total = 0u64;
    for queue_name in [QueueName::WebhookIntake, QueueName::CruiseLineProcessing] {
        let stalled = queue.stalled_jobs(queue_name, config.stalled);
        for job_id in &stalled {
            queue.requeue_stalled(queue_name, *job_id);
        }
        total += stalled.len() as u64;
    }
    if total > 0 {
        info!("reaper: requeued {} stalled jobs", total);
        crate::metrics::increment_reaper_stalled_jobs_requeued(total);
        notifier.reaper_action(&format!("requeued {} stalled jobs", total)).await;
    }
}

async fn sweep_stale_sync_locks(sync_locks: &Arc<SyncLockTable>, config: &ReaperConfig, notifier: &Notifier) {
    let released = sync_locks.release_stale(config.lock_ttl);
    if !released.is_empty() {
        info!("reaper: force-released {} stale sync locks", released.len());
        crate::metrics::increment_reaper_sync_locks_released(released.len() as u64);
        notifier
            .reaper_action(&format!("released {} stale sync locks", released.len()))
            .await;
    }
}

/// Marks `WebhookEvent`s stuck in `processing` for longer than
/// `webhook_event_stuck` as `failed` with reason `stalled`, per spec §4.9.
async fn sweep_stuck_webhook_events(
    db_pool: &PgPool,
    config: &ReaperConfig,
    notifier: &Notifier,
) -> Result<(), sqlx::Error> {
    let cutoff = chrono::Utc::now() - config.webhook_event_stuck;
    let result = sqlx::query(&format!(
        "UPDATE {schema}.webhook_events
         SET status = 'failed', processed_at = NOW(), error_message = 'stalled'
         WHERE status = 'processing' AND received_at < $1",
        schema = crate::persistence::SCHEMA
    ))
    .bind(cutoff)
    .execute(db_pool)
    .await?;

    let count = result.rows_affected();
    if count > 0 {
        info!("reaper: marked {} stuck webhook events failed", count);
        crate::metrics::increment_reaper_webhook_events_reclaimed(count);
        notifier
            .reaper_action(&format!("marked {} stuck webhook events failed", count))
            .await;
    }
    Ok(())
}

/// Prunes `WebhookEvent` rows past `event_retention`, per spec §9 open
/// question 2 (defaults are indicative; resolved here as a 30-day window).
async fn prune_old_webhook_events(db_pool: &PgPool, config: &ReaperConfig) -> Result<(), sqlx::Error> {
    let cutoff = chrono::Utc::now() - config.event_retention;
    let result = sqlx::query(&format!(
        "DELETE FROM {schema}.webhook_events WHERE received_at < $1 AND status IN ('completed', 'failed', 'skipped')",
        schema = crate::persistence::SCHEMA
    ))
    .bind(cutoff)
    .execute(db_pool)
    .await?;

    let count = result.rows_affected();
    if count > 0 {
        info!("reaper: pruned {} expired webhook events", count);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::queue::JobPayload;
    use crate::sync_lock::SyncLockTable;
    use uuid::Uuid;

    #[tokio::test]
    async fn stalled_job_sweep_requeues_past_heartbeat() {
        let queue = JobQueue::new(3, 5, 10, 100);
        let _id = queue.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, _c) = queue
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(15)).await;

        let stalled = queue.stalled_jobs(QueueName::WebhookIntake, Duration::from_millis(5));
        assert_eq!(stalled, vec![job.id]);
        queue.requeue_stalled(QueueName::WebhookIntake, job.id);
        assert_eq!(queue.depth(QueueName::WebhookIntake), 1);
    }

    #[test]
    fn stale_lock_sweep_releases_expired_entries() {
        let table = SyncLockTable::new();
        table.try_acquire(22, "worker-1");
        let released = table.release_stale(ChronoDuration::seconds(-1));
        assert_eq!(released, vec![22]);
    }
}
