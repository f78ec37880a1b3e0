// src/queue/pending.rs
//! Exponential-backoff-with-full-jitter retry scheduling (spec §4.5), lifted
//! directly from the pending-pool retry queue this crate inherited: the same
//! `DashMap`-keyed entry, `calculate_delay`, and attempt-capped drop, but
//! keyed by job id instead of pool address.

use dashmap::DashMap;
use log::{trace, warn};
use rand::Rng;
use std::time::{Duration, Instant};
use uuid::Uuid;

#[derive(Clone, Debug)]
pub struct RetryConfig {
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    pub max_attempts: u32,
}

struct DelayedEntry {
    ready_at: Instant,
}

/// Tracks jobs that are waiting out a retry delay before returning to the
/// `waiting` bucket.
pub struct RetryScheduler {
    entries: DashMap<Uuid, DelayedEntry>,
    config: RetryConfig,
}

impl RetryScheduler {
    pub fn new(config: RetryConfig) -> Self {
        Self {
            entries: DashMap::new(),
            config,
        }
    }

    /// `delay = min(maxBackoff, base * 2^attempt) * rand(0.5..1.5)` per spec §4.5.
    pub fn calculate_delay(&self, attempt: u32) -> Duration {
        let base = self.config.base_delay_ms.max(1) as f64;
        let max = self.config.max_delay_ms.max(self.config.base_delay_ms) as f64;
        let factor = 2f64.powi(attempt.min(20) as i32);
        let backoff = (base * factor).min(max);
        let jitter = rand::thread_rng().gen_range(0.5..1.5);
        Duration::from_millis((backoff * jitter).round() as u64)
    }

    pub fn max_attempts(&self) -> u32 {
        self.config.max_attempts
    }

    /// Schedules `job_id` to become ready after the backoff for `attempt`.
    /// Returns `false` (and logs) if `attempt` already exhausted `max_attempts`
    /// — the caller should move the job to `failed` instead of delaying it.
    pub fn schedule(&self, job_id: Uuid, attempt: u32) -> bool {
        if attempt >= self.config.max_attempts {
            warn!(
                "job {} exhausted {} attempts; not rescheduling",
                job_id, attempt
            );
            return false;
        }
        let delay = self.calculate_delay(attempt);
        trace!("job {} scheduled for retry in {:?}", job_id, delay);
        self.entries.insert(
            job_id,
            DelayedEntry {
                ready_at: Instant::now() + delay,
            },
        );
        true
    }

    /// Pops all job ids whose delay has elapsed.
    pub fn pop_ready(&self) -> Vec<Uuid> {
        let now = Instant::now();
        let ready: Vec<Uuid> = self
            .entries
            .iter()
            .filter(|e| e.value().ready_at <= now)
            .map(|e| *e.key())
            .collect();
        for id in &ready {
            self.entries.remove(id);
        }
        ready
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delay_grows_exponentially_and_caps() {
        let scheduler = RetryScheduler::new(RetryConfig {
            base_delay_ms: 1000,
            max_delay_ms: 10_000,
            max_attempts: 5,
        });
        let d0 = scheduler.calculate_delay(0);
        let d3 = scheduler.calculate_delay(3);
        let d_huge = scheduler.calculate_delay(30);
        assert!(d0.as_millis() >= 500 && d0.as_millis() <= 1500);
        assert!(d3.as_millis() > d0.as_millis());
        assert!(d_huge.as_millis() <= 15_000); // capped at max * upper jitter bound
    }

    #[test]
    fn refuses_to_schedule_past_max_attempts() {
        let scheduler = RetryScheduler::new(RetryConfig {
            base_delay_ms: 10,
            max_delay_ms: 100,
            max_attempts: 2,
        });
        let id = Uuid::new_v4();
        assert!(scheduler.schedule(id, 0));
        assert!(scheduler.schedule(id, 1));
        assert!(!scheduler.schedule(id, 2));
    }
}
