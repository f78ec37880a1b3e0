//! # Ingestion Worker Service
//!
//! Boots the full pipeline: FTP pool, persistence layer, job queue, worker
//! pool, reaper, system-flags poller and the webhook HTTP server.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin ingest-worker
//! ```
//!
//! Press Ctrl+C to stop gracefully.

use anyhow::Result;
use chrono::Duration as ChronoDuration;
use std::sync::Arc;
use std::time::Duration;
use tokio::signal;
use traveltek_ingest::deferred::DeferredQueue;
use traveltek_ingest::ftp_pool::FtpPool;
use traveltek_ingest::notifications::Notifier;
use traveltek_ingest::persistence::{self, writer::PersistenceWriter};
use traveltek_ingest::queue::JobQueue;
use traveltek_ingest::reaper::{self, ReaperConfig};
use traveltek_ingest::recovery;
use traveltek_ingest::settings::Settings;
use traveltek_ingest::sync_lock::SyncLockTable;
use traveltek_ingest::system_flags::{self, FlagSnapshot, SystemFlags};
use traveltek_ingest::webhook::{self, WebhookState};
use traveltek_ingest::worker::{self, WorkerContext};

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    #[cfg(feature = "observability")]
    traveltek_ingest::metrics::describe_metrics();

    println!("Starting ingestion worker");

    let settings = Settings::new()?;
    log::info!("settings loaded (environment={})", settings.environment);

    let ftp_pool = FtpPool::new(&settings)?;
    log::info!("FTP pool ready for {}", settings.ftp.host);

    let db_pool = persistence::connect(&settings.database.url, settings.database.pool_max).await?;
    log::info!("database connected and schema initialized");

    let writer = Arc::new(PersistenceWriter::new(
        db_pool.clone(),
        settings.persistence.batch_size,
        Duration::from_millis(settings.persistence.flush_interval_ms),
    ));

    let queue = JobQueue::new(
        3, // webhook-intake default max attempts
        5, // cruise-line-processing default max attempts
        200,
        30_000,
    );

    let sync_locks = Arc::new(SyncLockTable::new());
    let flags = SystemFlags::new(FlagSnapshot {
        webhook_deduplication_window_sec: settings.webhook.dedup_window_sec,
        max_cruises_per_webhook: settings.discovery.max_inline_batch,
        ..FlagSnapshot::default()
    });
    let deferred = Arc::new(DeferredQueue::new(50_000, ChronoDuration::days(7)));
    let notifier = Notifier::new(settings.notifications.slack_webhook_url.clone());
    ftp_pool.set_notifier(notifier.clone()).await;

    system_flags::spawn_refresh_loop(flags.clone(), db_pool.clone(), Duration::from_secs(10));
    let recovery_handle =
        recovery::spawn_pending_webhook_reconciler(queue.clone(), db_pool.clone(), Duration::from_secs(15));

    let worker_ctx = Arc::new(WorkerContext {
        ftp_pool: ftp_pool.clone(),
        queue: queue.clone(),
        sync_locks: sync_locks.clone(),
        flags: flags.clone(),
        deferred: deferred.clone(),
        writer,
        db_pool: db_pool.clone(),
        notifier: notifier.clone(),
        heartbeat: Duration::from_millis(settings.queue.heartbeat_ms),
        stalled: Duration::from_millis(settings.queue.stalled_ms),
        relock_backoff: Duration::from_millis(settings.queue.relock_backoff_ms),
        window_months: settings.discovery.window_months,
        max_inline_batch: settings.discovery.max_inline_batch,
    });

    let worker_handles = worker::spawn_pool(
        worker_ctx,
        settings.queue.webhook_concurrency,
        settings.queue.line_concurrency,
    );
    log::info!(
        "worker pool started ({} webhook, {} line workers)",
        settings.queue.webhook_concurrency,
        settings.queue.line_concurrency
    );

    let batch_sync_handle = worker::spawn_batch_sync_scheduler(
        queue.clone(),
        flags.clone(),
        deferred,
        Duration::from_millis(settings.discovery.batch_sync_interval_ms),
    );

    let reaper_handle = reaper::spawn(
        ReaperConfig {
            interval: Duration::from_millis(settings.reaper.interval_ms),
            stalled: Duration::from_millis(settings.queue.stalled_ms),
            webhook_event_stuck: ChronoDuration::seconds(settings.reaper.webhook_event_stuck_secs),
            lock_ttl: ChronoDuration::milliseconds(settings.reaper.lock_ttl_ms as i64),
            event_retention: ChronoDuration::days(settings.reaper.event_retention_days),
        },
        queue.clone(),
        sync_locks.clone(),
        db_pool.clone(),
        notifier.clone(),
    );

    let webhook_state = WebhookState {
        db_pool,
        queue: queue.clone(),
        flags,
        dedup_window_sec: settings.webhook.dedup_window_sec,
    };
    let app = webhook::router(webhook_state);
    let listener = tokio::net::TcpListener::bind("0.0.0.0:8080").await?;
    log::info!("webhook server listening on 0.0.0.0:8080");
    let server_handle = tokio::spawn(async move {
        if let Err(e) = axum::serve(listener, app).await {
            log::error!("webhook server error: {}", e);
        }
    });

    println!("Ingestion worker running. Press Ctrl+C to stop gracefully...");
    signal::ctrl_c().await?;
    println!("Shutdown signal received, stopping tasks...");

    for handle in worker_handles {
        handle.abort();
    }
    reaper_handle.abort();
    recovery_handle.abort();
    batch_sync_handle.abort();
    server_handle.abort();

    println!("Shutdown complete");
    Ok(())
}
