// src/queue/mod.rs
//! Durable job queue (C5): `webhook-intake` and `cruise-line-processing`,
//! with retry-with-backoff, delayed/failed/completed buckets, heartbeats and
//! cooperative cancellation (spec §4.5).

pub mod pending;
pub mod redis_backend;

use crate::types::{JobState, QueueName};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};
use pending::{RetryConfig, RetryScheduler};
use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};
use tokio::sync::Notify;
use uuid::Uuid;

/// Payload carried by a queued job.
#[derive(Debug, Clone)]
pub enum JobPayload {
    /// Admitted webhook event awaiting batch materialization.
    WebhookIntake { event_id: Uuid },
    /// A per-line batch ready for the discovery -> normalize -> persist pipeline.
    CruiseLineProcessing { line_id: i32, webhook_event_id: Uuid },
    /// Periodic drain of `needs_price_update` marks (C13).
    BatchSync,
}

impl JobPayload {
    pub fn queue(&self) -> QueueName {
        match self {
            JobPayload::WebhookIntake { .. } => QueueName::WebhookIntake,
            JobPayload::CruiseLineProcessing { .. } => QueueName::CruiseLineProcessing,
            JobPayload::BatchSync => QueueName::CruiseLineProcessing,
        }
    }
}

/// A queued unit of work.
#[derive(Debug, Clone)]
pub struct Job {
    pub id: Uuid,
    pub payload: JobPayload,
    pub attempt: u32,
    pub max_attempts: u32,
    pub state: JobState,
    pub enqueued_at: DateTime<Utc>,
}

struct JobRecord {
    job: Job,
    cancelled: Arc<AtomicBool>,
    last_heartbeat: Instant,
}

/// Per-queue state: waiting FIFO, in-flight records, dead-letter bucket, and
/// the exponential-backoff scheduler for delayed retries.
struct QueueState {
    waiting: Mutex<VecDeque<Uuid>>,
    records: DashMap<Uuid, JobRecord>,
    dead_letter: Mutex<Vec<Job>>,
    scheduler: RetryScheduler,
    notify: Notify,
}

impl QueueState {
    fn new(retry: RetryConfig) -> Self {
        Self {
            waiting: Mutex::new(VecDeque::new()),
            records: DashMap::new(),
            dead_letter: Mutex::new(Vec::new()),
            scheduler: RetryScheduler::new(retry),
            notify: Notify::new(),
        }
    }
}

/// The in-process job queue backing both named queues. Durable within the
/// process lifetime; `queue::redis_backend` mirrors transitions externally
/// when configured for cross-process introspection.
pub struct JobQueue {
    webhook_intake: QueueState,
    cruise_line_processing: QueueState,
}

impl JobQueue {
    pub fn new(
        webhook_max_attempts: u32,
        line_max_attempts: u32,
        base_delay_ms: u64,
        max_delay_ms: u64,
    ) -> Arc<Self> {
        Arc::new(Self {
            webhook_intake: QueueState::new(RetryConfig {
                base_delay_ms,
                max_delay_ms,
                max_attempts: webhook_max_attempts,
            }),
            cruise_line_processing: QueueState::new(RetryConfig {
                base_delay_ms,
                max_delay_ms,
                max_attempts: line_max_attempts,
            }),
        })
    }

    fn state(&self, queue: QueueName) -> &QueueState {
        match queue {
            QueueName::WebhookIntake => &self.webhook_intake,
            QueueName::CruiseLineProcessing => &self.cruise_line_processing,
        }
    }

    /// Enqueues a new job in the `waiting` state.
    pub fn enqueue(&self, payload: JobPayload) -> Uuid {
        let queue = payload.queue();
        let state = self.state(queue);
        let id = Uuid::new_v4();
        let max_attempts = state.scheduler.max_attempts();
        let job = Job {
            id,
            payload,
            attempt: 0,
            max_attempts,
            state: JobState::Waiting,
            enqueued_at: Utc::now(),
        };
        state.records.insert(
            id,
            JobRecord {
                job,
                cancelled: Arc::new(AtomicBool::new(false)),
                last_heartbeat: Instant::now(),
            },
        );
        state.waiting.lock().unwrap().push_back(id);
        state.notify.notify_one();
        id
    }

    /// Blocking reserve with timeout. Moves the job to `active` and returns
    /// it, along with a cancellation flag the worker polls at every yield
    /// point (spec §4.5/§5).
    pub async fn reserve(&self, queue: QueueName, timeout: Duration) -> Option<(Job, Arc<AtomicBool>)> {
        let state = self.state(queue);
        let deadline = Instant::now() + timeout;

        loop {
            self.drain_ready_delayed(queue);

            if let Some(id) = state.waiting.lock().unwrap().pop_front() {
                if let Some(mut record) = state.records.get_mut(&id) {
                    if record.cancelled.load(Ordering::SeqCst) {
                        continue;
                    }
                    record.job.state = JobState::Active;
                    record.last_heartbeat = Instant::now();
                    return Some((record.job.clone(), record.cancelled.clone()));
                }
                continue;
            }

            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return None;
            }
            let _ = tokio::time::timeout(remaining.min(Duration::from_millis(200)), state.notify.notified()).await;
            if Instant::now() >= deadline {
                return None;
            }
        }
    }

    fn drain_ready_delayed(&self, queue: QueueName) {
        let state = self.state(queue);
        for id in state.scheduler.pop_ready() {
            if let Some(mut record) = state.records.get_mut(&id) {
                record.job.state = JobState::Waiting;
                state.waiting.lock().unwrap().push_back(id);
            }
        }
    }

    /// Updates the heartbeat timestamp for an active job.
    pub fn heartbeat(&self, queue: QueueName, job_id: Uuid) {
        if let Some(mut record) = self.state(queue).records.get_mut(&job_id) {
            record.last_heartbeat = Instant::now();
        }
    }

    /// Marks a job `completed` and removes it from the in-flight table.
    pub fn complete(&self, queue: QueueName, job_id: Uuid) {
        self.state(queue).records.remove(&job_id);
    }

    /// Marks a job `skipped` (administrative cancellation, non-error
    /// terminal state per spec §4.5/§7).
    pub fn mark_skipped(&self, queue: QueueName, job_id: Uuid) {
        self.state(queue).records.remove(&job_id);
    }

    /// Signals the job's cancellation flag so the worker can stop at its
    /// next yield point. Does not itself move the job out of `active`; the
    /// worker calls `mark_skipped` once it observes the flag.
    pub fn cancel(&self, queue: QueueName, job_id: Uuid) -> bool {
        if let Some(record) = self.state(queue).records.get(&job_id) {
            record.cancelled.store(true, Ordering::SeqCst);
            true
        } else {
            false
        }
    }

    /// Reports a failed attempt. Retriable failures are rescheduled with
    /// exponential backoff; exhausted or non-retriable failures move the job
    /// to the dead-letter bucket.
    pub fn fail(&self, queue: QueueName, job_id: Uuid, retriable: bool) {
        let state = self.state(queue);
        let Some((_, mut record)) = state.records.remove(&job_id) else {
            return;
        };
        record.job.attempt += 1;

        if retriable && state.scheduler.schedule(job_id, record.job.attempt) {
            record.job.state = JobState::Delayed;
            state.records.insert(job_id, record);
            return;
        }

        record.job.state = JobState::Failed;
        warn!(
            "job {} on {} moved to dead-letter after {} attempts",
            job_id,
            queue.as_str(),
            record.job.attempt
        );
        state.dead_letter.lock().unwrap().push(record.job);
    }

    /// Jobs whose heartbeat has stalled past `stalled_ms`, for the reaper
    /// (C11) to return to `waiting`.
    pub fn stalled_jobs(&self, queue: QueueName, stalled: Duration) -> Vec<Uuid> {
        self.state(queue)
            .records
            .iter()
            .filter(|r| r.job.state == JobState::Active && r.last_heartbeat.elapsed() > stalled)
            .map(|r| *r.key())
            .collect()
    }

    /// Returns a stalled active job to `waiting`, preserving its attempt
    /// counter, per spec §4.5/§4.9.
    pub fn requeue_stalled(&self, queue: QueueName, job_id: Uuid) {
        let state = self.state(queue);
        if let Some(mut record) = state.records.get_mut(&job_id) {
            if record.job.state == JobState::Active {
                record.job.state = JobState::Waiting;
                state.waiting.lock().unwrap().push_back(job_id);
                info!("requeued stalled job {} on {}", job_id, queue.as_str());
            }
        }
    }

    pub fn dead_letter(&self, queue: QueueName) -> Vec<Job> {
        self.state(queue).dead_letter.lock().unwrap().clone()
    }

    pub fn depth(&self, queue: QueueName) -> usize {
        self.state(queue).waiting.lock().unwrap().len()
    }

    /// Whether a `WebhookIntake` job for `event_id`, or the
    /// `CruiseLineProcessing` job it materialized into, is already tracked
    /// in either queue. Used by the startup/periodic reconciler
    /// (`recovery::spawn_pending_webhook_reconciler`) to avoid re-enqueuing
    /// a `pending` WebhookEvent that is already in flight.
    pub fn contains_webhook_event(&self, event_id: Uuid) -> bool {
        let in_intake = self.webhook_intake.records.iter().any(|r| {
            matches!(r.value().job.payload, JobPayload::WebhookIntake { event_id: id } if id == event_id)
        });
        if in_intake {
            return true;
        }
        self.cruise_line_processing.records.iter().any(|r| {
            matches!(
                r.value().job.payload,
                JobPayload::CruiseLineProcessing { webhook_event_id: id, .. } if id == event_id
            )
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn queue() -> Arc<JobQueue> {
        JobQueue::new(3, 5, 10, 100)
    }

    #[tokio::test]
    async fn enqueue_then_reserve_moves_to_active() {
        let q = queue();
        let id = q.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, _cancel) = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(job.id, id);
        assert_eq!(job.state, JobState::Active);
    }

    #[tokio::test]
    async fn reserve_times_out_on_empty_queue() {
        let q = queue();
        let result = q.reserve(QueueName::WebhookIntake, Duration::from_millis(30)).await;
        assert!(result.is_none());
    }

    #[tokio::test]
    async fn retriable_failure_eventually_becomes_ready_again() {
        let q = JobQueue::new(3, 5, 5, 20);
        let _id = q.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, _c) = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        q.fail(QueueName::WebhookIntake, job.id, true);
        tokio::time::sleep(Duration::from_millis(100)).await;
        let retried = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(200))
            .await;
        assert!(retried.is_some());
        assert_eq!(retried.unwrap().0.attempt, 1);
    }

    #[tokio::test]
    async fn exhausted_attempts_move_to_dead_letter() {
        let q = JobQueue::new(1, 5, 1, 5);
        let id = q.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, _c) = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(job.id, id);
        q.fail(QueueName::WebhookIntake, job.id, true);
        let dead = q.dead_letter(QueueName::WebhookIntake);
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[tokio::test]
    async fn cancellation_flag_is_observable() {
        let q = queue();
        let id = q.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, cancel_flag) = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        assert_eq!(job.id, id);
        assert!(!cancel_flag.load(Ordering::SeqCst));
        q.cancel(QueueName::WebhookIntake, id);
        assert!(cancel_flag.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn contains_webhook_event_reflects_in_flight_jobs() {
        let q = queue();
        let event_id = Uuid::new_v4();
        assert!(!q.contains_webhook_event(event_id));
        q.enqueue(JobPayload::WebhookIntake { event_id });
        assert!(q.contains_webhook_event(event_id));
    }

    #[tokio::test]
    async fn stalled_active_job_is_detected() {
        let q = queue();
        let _id = q.enqueue(JobPayload::WebhookIntake { event_id: Uuid::new_v4() });
        let (job, _c) = q
            .reserve(QueueName::WebhookIntake, Duration::from_millis(50))
            .await
            .unwrap();
        tokio::time::sleep(Duration::from_millis(20)).await;
        let stalled = q.stalled_jobs(QueueName::WebhookIntake, Duration::from_millis(10));
        assert_eq!(stalled, vec![job.id]);
        q.requeue_stalled(QueueName::WebhookIntake, job.id);
        assert_eq!(q.depth(QueueName::WebhookIntake), 1);
    }
}
