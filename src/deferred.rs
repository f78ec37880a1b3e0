// src/deferred.rs
//! Deferred-update mark path (C13, spec §4.7/§4.13).
//!
//! For lines whose Discovery result exceeds `max_inline_batch`, the worker
//! marks affected sailings `needs_price_update = true` instead of processing
//! them inline. This queue tracks those marks in memory until the periodic
//! `batch-sync` job drains them, the same full/priority/age-bounded shape
//! this crate's infrastructure already used for deferred per-entity work.

use dashmap::DashMap;
use log::{debug, info, warn};
use thiserror::Error;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum DeferPriority {
    Low,
    Normal,
    High,
}

#[derive(Debug, Clone)]
pub struct DeferredMark {
    pub code_to_cruise_id: String,
    pub line_id: i32,
    pub requested_at: chrono::DateTime<chrono::Utc>,
    pub priority: DeferPriority,
}

/// Queue of sailings marked `needs_price_update = true`, bounded so a
/// pathologically large line cannot exhaust memory.
pub struct DeferredQueue {
    marks: DashMap<String, DeferredMark>,
    max_pending: usize,
    max_age: chrono::Duration,
}

impl DeferredQueue {
    pub fn new(max_pending: usize, max_age: chrono::Duration) -> Self {
        Self {
            marks: DashMap::new(),
            max_pending,
            max_age,
        }
    }

    /// Marks `code_to_cruise_id` as needing a background price update.
    /// Rejects low-priority marks once the queue is full and cleanup of
    /// stale low-priority entries didn't make room, per spec §4.7's
    /// deferred-path contract.
    pub fn mark_pending(
        &self,
        code_to_cruise_id: &str,
        line_id: i32,
        priority: DeferPriority,
    ) -> Result<(), DeferredQueueError> {
        if self.marks.len() >= self.max_pending {
            self.cleanup_stale_low_priority();
            if priority == DeferPriority::Low && self.marks.len() >= self.max_pending {
                debug!(
                    "deferred queue full ({}); rejecting low-priority mark for {}",
                    self.marks.len(),
                    code_to_cruise_id
                );
                return Err(DeferredQueueError::QueueFull);
            }
        }

        self.marks.insert(
            code_to_cruise_id.to_string(),
            DeferredMark {
                code_to_cruise_id: code_to_cruise_id.to_string(),
                line_id,
                requested_at: chrono::Utc::now(),
                priority,
            },
        );
        Ok(())
    }

    /// Selects up to `limit` marks to drain, highest priority and oldest
    /// first, throttling the batch-sync job per spec §4.7/§4.8
    /// (`max_cruises_per_webhook` bounds a single drain pass).
    pub fn select_for_drain(&self, limit: usize) -> Vec<DeferredMark> {
        let mut pending: Vec<DeferredMark> = self.marks.iter().map(|e| e.value().clone()).collect();
        pending.sort_by(|a, b| {
            b.priority
                .cmp(&a.priority)
                .then(a.requested_at.cmp(&b.requested_at))
        });
        let selected: Vec<DeferredMark> = pending.into_iter().take(limit).collect();
        if !selected.is_empty() {
            info!(
                "selected {} sailings for deferred price-update drain ({} pending)",
                selected.len(),
                self.marks.len()
            );
        }
        selected
    }

    /// Removes marks once their price update has been applied.
    pub fn remove_drained(&self, code_to_cruise_ids: &[String]) {
        for id in code_to_cruise_ids {
            self.marks.remove(id);
        }
    }

    fn cleanup_stale_low_priority(&self) {
        let now = chrono::Utc::now();
        let stale: Vec<String> = self
            .marks
            .iter()
            .filter(|e| {
                e.value().priority == DeferPriority::Low
                    && now - e.value().requested_at > self.max_age
            })
            .map(|e| e.key().clone())
            .collect();
        for id in stale {
            if self.marks.remove(&id).is_some() {
                warn!("dropped stale low-priority deferred mark {}", id);
            }
        }
    }

    pub fn len(&self) -> usize {
        self.marks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.marks.is_empty()
    }
}

#[derive(Debug, Error)]
pub enum DeferredQueueError {
    #[error("deferred queue is full")]
    QueueFull,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn drains_highest_priority_oldest_first() {
        let queue = DeferredQueue::new(100, chrono::Duration::hours(1));
        queue.mark_pending("A", 22, DeferPriority::Low).unwrap();
        queue.mark_pending("B", 22, DeferPriority::High).unwrap();
        let drained = queue.select_for_drain(10);
        assert_eq!(drained[0].code_to_cruise_id, "B");
    }

    #[test]
    fn full_queue_rejects_low_priority() {
        let queue = DeferredQueue::new(2, chrono::Duration::hours(1));
        queue.mark_pending("A", 22, DeferPriority::High).unwrap();
        queue.mark_pending("B", 22, DeferPriority::High).unwrap();
        assert!(matches!(
            queue.mark_pending("C", 22, DeferPriority::Low),
            Err(DeferredQueueError::QueueFull)
        ));
    }

    #[test]
    fn drained_marks_are_removed() {
        let queue = DeferredQueue::new(10, chrono::Duration::hours(1));
        queue.mark_pending("A", 22, DeferPriority::Normal).unwrap();
        queue.remove_drained(&["A".to_string()]);
        assert!(queue.is_empty());
    }
}
