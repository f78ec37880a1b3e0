// src/sync_lock.rs
//! Per-line mutual exclusion (spec §3 `SyncLock`, §4.5, §4.9).
//!
//! A `DashMap`-backed map from `lineId` to its current lock, the same shape
//! this crate's infrastructure already used to track per-entity pending
//! state, repurposed here from per-block validation tracking to per-line
//! cruise-batch processing.

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use log::{info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SyncLockStatus {
    Processing,
    Released,
}

#[derive(Debug, Clone)]
pub struct SyncLockEntry {
    pub line_id: i32,
    pub acquired_at: DateTime<Utc>,
    pub owner: String,
    pub status: SyncLockStatus,
    pub completed_at: Option<DateTime<Utc>>,
}

/// Tracks at most one non-terminal [`SyncLockEntry`] per `lineId` (spec §3
/// invariant 4).
pub struct SyncLockTable {
    locks: DashMap<i32, SyncLockEntry>,
}

impl SyncLockTable {
    pub fn new() -> Self {
        Self {
            locks: DashMap::new(),
        }
    }

    /// Attempts to acquire the lock for `line_id`. Returns `false` if another
    /// owner already holds a non-released lock; the caller (worker) should
    /// re-queue the job with `relockBackoffMs` per spec §4.5.
    pub fn try_acquire(&self, line_id: i32, owner: &str) -> bool {
        let mut acquired = false;
        self.locks
            .entry(line_id)
            .and_modify(|entry| {
                if entry.status == SyncLockStatus::Released {
                    *entry = SyncLockEntry {
                        line_id,
                        acquired_at: Utc::now(),
                        owner: owner.to_string(),
                        status: SyncLockStatus::Processing,
                        completed_at: None,
                    };
                    acquired = true;
                }
            })
            .or_insert_with(|| {
                acquired = true;
                SyncLockEntry {
                    line_id,
                    acquired_at: Utc::now(),
                    owner: owner.to_string(),
                    status: SyncLockStatus::Processing,
                    completed_at: None,
                }
            });

        if acquired {
            info!("sync lock acquired for line {} by {}", line_id, owner);
        }
        acquired
    }

    /// Releases the lock for `line_id`, regardless of terminal outcome
    /// (completed/failed/skipped all release it).
    pub fn release(&self, line_id: i32) {
        if let Some(mut entry) = self.locks.get_mut(&line_id) {
            entry.status = SyncLockStatus::Released;
            entry.completed_at = Some(Utc::now());
        }
    }

    pub fn is_locked(&self, line_id: i32) -> bool {
        self.locks
            .get(&line_id)
            .map(|e| e.status == SyncLockStatus::Processing)
            .unwrap_or(false)
    }

    /// Releases locks held past `ttl`, for the reaper (C11) per spec §4.9.
    pub fn release_stale(&self, ttl: chrono::Duration) -> Vec<i32> {
        let now = Utc::now();
        let mut released = Vec::new();
        for mut entry in self.locks.iter_mut() {
            if entry.status == SyncLockStatus::Processing && now - entry.acquired_at > ttl {
                warn!(
                    "releasing stale sync lock for line {} (held since {})",
                    entry.line_id, entry.acquired_at
                );
                entry.status = SyncLockStatus::Released;
                entry.completed_at = Some(now);
                released.push(entry.line_id);
            }
        }
        released
    }

    pub fn snapshot(&self) -> Vec<SyncLockEntry> {
        self.locks.iter().map(|e| e.value().clone()).collect()
    }

    /// Mirrors an in-memory acquisition into the persisted `sync_locks` table
    /// (spec §3's `SyncLock` entity, with its partial-unique-index-enforced
    /// "at most one non-terminal row per lineId" invariant). Best-effort:
    /// the in-process `DashMap` above remains the authority for this
    /// worker's own exclusion; the DB row exists so `ingest-admin syncs
    /// locks`/`release-lock` and the reaper's DB sweep have something real
    /// to observe, and so a second `ingest-worker` process racing on the
    /// same line is still rejected by the unique index even if its own
    /// in-memory table has no entry for that line yet.
    pub async fn persist_acquire(pool: &sqlx::PgPool, line_id: i32, owner: &str) {
        let result = sqlx::query(&format!(
            "INSERT INTO {schema}.sync_locks (line_id, owner, status)
             VALUES ($1, $2, 'processing')
             ON CONFLICT (line_id) WHERE status != 'released' DO NOTHING",
            schema = crate::persistence::SCHEMA
        ))
        .bind(line_id)
        .bind(owner)
        .execute(pool)
        .await;
        if let Err(e) = result {
            warn!("failed to persist sync lock acquisition for line {}: {}", line_id, e);
        }
    }

    /// Mirrors a release into the persisted `sync_locks` table.
    pub async fn persist_release(pool: &sqlx::PgPool, line_id: i32) {
        let result = sqlx::query(&format!(
            "UPDATE {schema}.sync_locks SET status = 'released', completed_at = NOW()
             WHERE line_id = $1 AND status != 'released'",
            schema = crate::persistence::SCHEMA
        ))
        .bind(line_id)
        .execute(pool)
        .await;
        if let Err(e) = result {
            warn!("failed to persist sync lock release for line {}: {}", line_id, e);
        }
    }

    /// Releases persisted `sync_locks` rows held past `ttl`, the DB-side
    /// counterpart to [`Self::release_stale`] for the reaper (C11, spec
    /// §4.9). Returns the line ids released.
    pub async fn persist_release_stale(pool: &sqlx::PgPool, ttl: chrono::Duration) -> Result<Vec<i32>, sqlx::Error> {
        let cutoff = Utc::now() - ttl;
        let rows: Vec<(i32,)> = sqlx::query_as(&format!(
            "UPDATE {schema}.sync_locks SET status = 'released', completed_at = NOW()
             WHERE status != 'released' AND acquired_at < $1
             RETURNING line_id",
            schema = crate::persistence::SCHEMA
        ))
        .bind(cutoff)
        .fetch_all(pool)
        .await?;
        Ok(rows.into_iter().map(|(id,)| id).collect())
    }
}

impl Default for SyncLockTable {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn second_acquire_fails_while_processing() {
        let table = SyncLockTable::new();
        assert!(table.try_acquire(22, "worker-1"));
        assert!(!table.try_acquire(22, "worker-2"));
    }

    #[test]
    fn release_then_reacquire_succeeds() {
        let table = SyncLockTable::new();
        assert!(table.try_acquire(22, "worker-1"));
        table.release(22);
        assert!(table.try_acquire(22, "worker-2"));
    }

    #[test]
    fn at_most_one_non_terminal_lock_per_line() {
        let table = SyncLockTable::new();
        table.try_acquire(22, "worker-1");
        table.try_acquire(29, "worker-2");
        let non_terminal = table
            .snapshot()
            .into_iter()
            .filter(|e| e.status == SyncLockStatus::Processing && e.line_id == 22)
            .count();
        assert_eq!(non_terminal, 1);
    }

    #[test]
    fn stale_lock_is_released_by_reaper_sweep() {
        let table = SyncLockTable::new();
        table.try_acquire(22, "worker-1");
        let released = table.release_stale(chrono::Duration::seconds(-1));
        assert_eq!(released, vec![22]);
        assert!(!table.is_locked(22));
    }
}
