// src/system_flags.rs
//! Process-wide pause switches and admission flags (C9, spec §4.8).
//!
//! A single-writer/many-reader snapshot shared across async tasks via
//! `arc_swap::ArcSwap`, the same primitive this crate's settings/health
//! surfaces already used for that role.

use arc_swap::ArcSwap;
use log::warn;
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;

/// Well-known system flag keys (spec §4.8).
#[derive(Debug, Clone)]
pub struct FlagSnapshot {
    pub webhooks_paused: bool,
    pub batch_sync_paused: bool,
    pub sync_in_progress: bool,
    pub sync_started_at: Option<chrono::DateTime<chrono::Utc>>,
    pub sync_operator: Option<String>,
    pub webhook_deduplication_window_sec: i64,
    pub max_cruises_per_webhook: usize,
}

impl Default for FlagSnapshot {
    fn default() -> Self {
        Self {
            webhooks_paused: false,
            batch_sync_paused: false,
            sync_in_progress: false,
            sync_started_at: None,
            sync_operator: None,
            webhook_deduplication_window_sec: 300,
            max_cruises_per_webhook: 500,
        }
    }
}

/// Shared, eventually-consistent view of system flags, read at every
/// admission/yield point per spec §4.8/§5.
pub struct SystemFlags {
    current: ArcSwap<FlagSnapshot>,
}

impl SystemFlags {
    pub fn new(initial: FlagSnapshot) -> Arc<Self> {
        Arc::new(Self {
            current: ArcSwap::from_pointee(initial),
        })
    }

    pub fn snapshot(&self) -> Arc<FlagSnapshot> {
        self.current.load_full()
    }

    pub fn webhooks_paused(&self) -> bool {
        self.current.load().webhooks_paused
    }

    pub fn batch_sync_paused(&self) -> bool {
        self.current.load().batch_sync_paused
    }

    /// Installs a new snapshot in one atomic swap, changes are immediate for
    /// all readers per spec §4.8 ("changing a flag is immediate").
    pub fn replace(&self, next: FlagSnapshot) {
        self.current.store(Arc::new(next));
    }

    pub fn set_webhooks_paused(&self, paused: bool) {
        let mut next = (**self.current.load()).clone();
        next.webhooks_paused = paused;
        self.replace(next);
    }

    pub fn set_batch_sync_paused(&self, paused: bool) {
        let mut next = (**self.current.load()).clone();
        next.batch_sync_paused = paused;
        self.replace(next);
    }

    pub fn begin_sync(&self, operator: &str) {
        let mut next = (**self.current.load()).clone();
        next.sync_in_progress = true;
        next.sync_started_at = Some(chrono::Utc::now());
        next.sync_operator = Some(operator.to_string());
        self.replace(next);
    }

    pub fn end_sync(&self) {
        let mut next = (**self.current.load()).clone();
        next.sync_in_progress = false;
        next.sync_started_at = None;
        next.sync_operator = None;
        self.replace(next);
    }
}

/// Reads the well-known key/value rows from the `system_flags` table (spec
/// §4.8), preserving any in-memory sync-session fields not stored there.
pub async fn refresh_from_db(pool: &PgPool, previous: &FlagSnapshot) -> Result<FlagSnapshot, sqlx::Error> {
    let rows: Vec<(String, String)> = sqlx::query_as(&format!(
        "SELECT key, value FROM {}.system_flags",
        crate::persistence::SCHEMA
    ))
    .fetch_all(pool)
    .await?;

    let mut next = previous.clone();
    for (key, value) in rows {
        match key.as_str() {
            "webhooks_paused" => next.webhooks_paused = value == "true",
            "batch_sync_paused" => next.batch_sync_paused = value == "true",
            "sync_in_progress" => next.sync_in_progress = value == "true",
            "webhook_deduplication_window" => {
                if let Ok(v) = value.parse() {
                    next.webhook_deduplication_window_sec = v;
                }
            }
            "max_cruises_per_webhook" => {
                if let Ok(v) = value.parse() {
                    next.max_cruises_per_webhook = v;
                }
            }
            _ => {}
        }
    }
    Ok(next)
}

/// Spawns a short poll loop keeping `flags` in sync with the `system_flags`
/// table, tolerating transient DB errors between ticks.
pub fn spawn_refresh_loop(flags: Arc<SystemFlags>, pool: PgPool, interval: Duration) -> tokio::task::JoinHandle<()> {
    tokio::spawn(async move {
        let mut ticker = tokio::time::interval(interval);
        loop {
            ticker.tick().await;
            let previous = flags.snapshot();
            match refresh_from_db(&pool, &previous).await {
                Ok(next) => flags.replace(next),
                Err(e) => warn!("system flags refresh failed: {}", e),
            }
        }
    })
}

impl Default for SystemFlags {
    fn default() -> Self {
        Self {
            current: ArcSwap::from_pointee(FlagSnapshot::default()),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn flag_changes_are_visible_immediately() {
        let flags = SystemFlags::new(FlagSnapshot::default());
        assert!(!flags.webhooks_paused());
        flags.set_webhooks_paused(true);
        assert!(flags.webhooks_paused());
    }

    #[test]
    fn sync_lifecycle_round_trips() {
        let flags = SystemFlags::new(FlagSnapshot::default());
        flags.begin_sync("ops@example.com");
        let snap = flags.snapshot();
        assert!(snap.sync_in_progress);
        assert_eq!(snap.sync_operator.as_deref(), Some("ops@example.com"));
        flags.end_sync();
        assert!(!flags.snapshot().sync_in_progress);
    }
}
