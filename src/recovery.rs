// src/recovery.rs
//! Startup/periodic reconciliation between the `webhook_events` ledger and
//! the in-process job queue (C5/C8).
//!
//! `JobQueue` is durable only for the lifetime of the worker process; a
//! `WebhookEvent` left `pending` by a crashed worker, or reset to `pending`
//! by `ingest-admin webhooks retry` while this process was down (or while
//! it's up but hadn't yet observed the reset), would otherwise sit forever
//! with nothing to materialize it into a `cruise-line-processing` job. This
//! poller closes that gap the same way `system_flags::spawn_refresh_loop`
//! keeps flags in sync: a short interval reading from Postgres, tolerating
//! transient errors between ticks.

use crate::queue::{JobPayload, JobQueue};
use log::{info, warn};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use uuid::Uuid;

/// Spawns the reconciliation loop. Runs once immediately (covering a
/// fresh process start) and then every `interval`.
pub fn spawn_pending_webhook_reconciler(
    queue: Arc<JobQueue>,
    db_pool: PgPool,
    interval: Duration,
) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            if let Err(e) = reconcile_once(&queue, &db_pool).await {
                warn!("pending webhook reconciliation failed: {}", e);
            }
        }
    })
}

async fn reconcile_once(queue: &Arc<JobQueue>, db_pool: &PgPool) -> Result<(), sqlx::Error> {
    let pending: Vec<(Uuid,)> = sqlx::query_as(&format!(
        "SELECT id FROM {}.webhook_events WHERE status = 'pending'",
        crate::persistence::SCHEMA
    ))
    .fetch_all(db_pool)
    .await?;

    let mut requeued = 0u64;
    for (event_id,) in pending {
        if !queue.contains_webhook_event(event_id) {
            queue.enqueue(JobPayload::WebhookIntake { event_id });
            requeued += 1;
        }
    }

    if requeued > 0 {
        info!("recovery: enqueued {} orphaned pending webhook events", requeued);
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::types::QueueName;

    #[tokio::test]
    async fn does_not_reenqueue_job_already_in_flight() {
        let queue = JobQueue::new(3, 5, 10, 100);
        let event_id = Uuid::new_v4();
        queue.enqueue(JobPayload::WebhookIntake { event_id });
        assert!(queue.contains_webhook_event(event_id));
        // A second enqueue attempt should be recognized as redundant by the
        // same check `reconcile_once` uses, leaving queue depth unchanged.
        if !queue.contains_webhook_event(event_id) {
            queue.enqueue(JobPayload::WebhookIntake { event_id });
        }
        assert_eq!(queue.depth(QueueName::WebhookIntake), 1);
    }
}
