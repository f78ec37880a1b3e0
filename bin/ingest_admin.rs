//! # Ingestion Admin CLI
//!
//! Operator tooling for the Traveltek ingestion pipeline: pause/resume the
//! process-wide system flags (C9), introspect pending syncs and stuck
//! locks, and administratively retry a failed webhook event.
//!
//! Implemented as a CLI (rather than additional HTTP routes) per
//! `DESIGN.md`'s Open Question decision #2: this crate's own ops tooling
//! (`bin/ingest_worker.rs`'s sibling, modeled on the teacher's
//! `bin/background_discoverer.rs` bootstrap shape) is a CLI, and a CLI
//! avoids adding unauthenticated HTTP surface for mutating state.
//!
//! ## Usage
//!
//! ```bash
//! cargo run --bin ingest-admin -- flags show
//! cargo run --bin ingest-admin -- flags pause-webhooks
//! cargo run --bin ingest-admin -- flags resume-webhooks
//! cargo run --bin ingest-admin -- flags pause-batch-sync
//! cargo run --bin ingest-admin -- flags resume-batch-sync
//! cargo run --bin ingest-admin -- syncs pending
//! cargo run --bin ingest-admin -- syncs locks
//! cargo run --bin ingest-admin -- syncs release-lock --line-id 22
//! cargo run --bin ingest-admin -- webhooks retry --event-id <uuid>
//! ```

use anyhow::{Context, Result};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use colored::Colorize;
use sqlx::PgPool;
use traveltek_ingest::persistence::{self, SCHEMA};
use traveltek_ingest::settings::Settings;
use uuid::Uuid;

#[derive(Parser)]
#[command(name = "ingest-admin", about = "Operator CLI for the Traveltek ingestion pipeline")]
struct Cli {
    #[command(subcommand)]
    command: Command,
}

#[derive(Subcommand)]
enum Command {
    /// Inspect or toggle process-wide system flags (spec §4.8).
    Flags {
        #[command(subcommand)]
        action: FlagsAction,
    },
    /// Introspect deferred sync marks and per-line locks (spec §4.9/§4.13).
    Syncs {
        #[command(subcommand)]
        action: SyncsAction,
    },
    /// Administratively retry or inspect webhook events (spec §4.10).
    Webhooks {
        #[command(subcommand)]
        action: WebhooksAction,
    },
}

#[derive(Subcommand)]
enum FlagsAction {
    /// Print the current value of every well-known flag.
    Show,
    /// Set `webhooks_paused = true`; new webhooks are recorded as `skipped`.
    PauseWebhooks,
    /// Set `webhooks_paused = false`.
    ResumeWebhooks,
    /// Set `batch_sync_paused = true`; the deferred-drain job becomes a no-op.
    PauseBatchSync,
    /// Set `batch_sync_paused = false`.
    ResumeBatchSync,
}

#[derive(Subcommand)]
enum SyncsAction {
    /// List cruise lines with non-terminal sync locks.
    Locks,
    /// Count sailings currently marked `needs_price_update = true`, by line.
    Pending,
    /// Release a stuck lock by line id (mirrors what the reaper does on TTL).
    ReleaseLock {
        #[arg(long = "line-id")]
        line_id: i32,
    },
}

#[derive(Subcommand)]
enum WebhooksAction {
    /// List the most recent webhook events.
    Recent {
        #[arg(long, default_value_t = 20)]
        limit: i64,
    },
    /// Reset a `failed` event back to `pending` and re-enqueue it, per spec
    /// §4.10 ("`failed` may be retried administratively... increments
    /// `retryCount`").
    Retry {
        #[arg(long = "event-id")]
        event_id: Uuid,
    },
}

#[tokio::main]
async fn main() -> Result<()> {
    dotenv::dotenv().ok();
    env_logger::init();

    let cli = Cli::parse();

    let settings = match Settings::new() {
        Ok(settings) => settings,
        Err(e) => {
            eprintln!("{} configuration error: {}", "error:".red().bold(), e);
            std::process::exit(1)
        }
    };

    let pool = persistence::connect(&settings.database.url, settings.database.pool_max)
        .await
        .context("connecting to database")?;

    let result = match cli.command {
        Command::Flags { action } => run_flags(&pool, action).await,
        Command::Syncs { action } => run_syncs(&pool, action).await,
        Command::Webhooks { action } => run_webhooks(&pool, action).await,
    };

    if let Err(e) = result {
        eprintln!("{} {}", "error:".red().bold(), e);
        std::process::exit(2);
    }

    Ok(())
}

async fn run_flags(pool: &PgPool, action: FlagsAction) -> Result<()> {
    match action {
        FlagsAction::Show => {
            let rows: Vec<(String, String, DateTime<Utc>)> = sqlx::query_as(&format!(
                "SELECT key, value, updated_at FROM {}.system_flags ORDER BY key",
                SCHEMA
            ))
            .fetch_all(pool)
            .await?;

            println!("{}", "system flags".bold());
            for (key, value, updated_at) in rows {
                println!("  {:<32} {:<10} (updated {})", key, value, updated_at);
            }
        }
        FlagsAction::PauseWebhooks => set_flag(pool, "webhooks_paused", "true").await?,
        FlagsAction::ResumeWebhooks => set_flag(pool, "webhooks_paused", "false").await?,
        FlagsAction::PauseBatchSync => set_flag(pool, "batch_sync_paused", "true").await?,
        FlagsAction::ResumeBatchSync => set_flag(pool, "batch_sync_paused", "false").await?,
    }
    Ok(())
}

async fn set_flag(pool: &PgPool, key: &str, value: &str) -> Result<()> {
    sqlx::query(&format!(
        "INSERT INTO {schema}.system_flags (key, value) VALUES ($1, $2)
         ON CONFLICT (key) DO UPDATE SET value = EXCLUDED.value, updated_at = NOW()",
        schema = SCHEMA
    ))
    .bind(key)
    .bind(value)
    .execute(pool)
    .await?;
    println!("{} {} = {}", "ok:".green().bold(), key, value);
    Ok(())
}

async fn run_syncs(pool: &PgPool, action: SyncsAction) -> Result<()> {
    match action {
        SyncsAction::Locks => {
            let rows: Vec<(i32, DateTime<Utc>, String, String)> = sqlx::query_as(&format!(
                "SELECT line_id, acquired_at, owner, status FROM {}.sync_locks
                 WHERE status != 'released' ORDER BY acquired_at",
                SCHEMA
            ))
            .fetch_all(pool)
            .await?;

            if rows.is_empty() {
                println!("no active sync locks");
            } else {
                println!("{}", "active sync locks".bold());
                for (line_id, acquired_at, owner, status) in rows {
                    println!(
                        "  line {:<6} owner={:<24} status={:<12} since {}",
                        line_id, owner, status, acquired_at
                    );
                }
            }
        }
        SyncsAction::Pending => {
            let rows: Vec<(i32, i64)> = sqlx::query_as(&format!(
                "SELECT cruise_line_id, COUNT(*) FROM {}.cruises
                 WHERE needs_price_update = true GROUP BY cruise_line_id ORDER BY 2 DESC",
                SCHEMA
            ))
            .fetch_all(pool)
            .await?;

            if rows.is_empty() {
                println!("no sailings pending deferred price update");
            } else {
                println!("{}", "pending deferred updates by line".bold());
                for (line_id, count) in rows {
                    println!("  line {:<6} {} sailings", line_id, count);
                }
            }
        }
        SyncsAction::ReleaseLock { line_id } => {
            let result = sqlx::query(&format!(
                "UPDATE {}.sync_locks SET status = 'released', completed_at = NOW()
                 WHERE line_id = $1 AND status != 'released'",
                SCHEMA
            ))
            .bind(line_id)
            .execute(pool)
            .await?;

            if result.rows_affected() == 0 {
                println!("no active lock found for line {}", line_id);
            } else {
                println!("{} released lock for line {}", "ok:".green().bold(), line_id);
            }
        }
    }
    Ok(())
}

async fn run_webhooks(pool: &PgPool, action: WebhooksAction) -> Result<()> {
    match action {
        WebhooksAction::Recent { limit } => {
            let rows: Vec<(Uuid, i32, String, String, DateTime<Utc>)> = sqlx::query_as(&format!(
                "SELECT id, line_id, event_type, status, received_at FROM {}.webhook_events
                 ORDER BY received_at DESC LIMIT $1",
                SCHEMA
            ))
            .bind(limit)
            .fetch_all(pool)
            .await?;

            println!("{}", "recent webhook events".bold());
            for (id, line_id, event_type, status, received_at) in rows {
                println!(
                    "  {} line={:<6} {:<32} {:<10} {}",
                    id, line_id, event_type, status, received_at
                );
            }
        }
        WebhooksAction::Retry { event_id } => {
            let result = sqlx::query(&format!(
                "UPDATE {}.webhook_events
                 SET status = 'pending', retry_count = retry_count + 1,
                     processed_at = NULL, error_message = NULL
                 WHERE id = $1 AND status = 'failed'",
                SCHEMA
            ))
            .bind(event_id)
            .execute(pool)
            .await?;

            if result.rows_affected() == 0 {
                println!("event {} is not in a failed state, nothing to retry", event_id);
            } else {
                println!("{} reset event {} to pending", "ok:".green().bold(), event_id);
            }
        }
    }
    Ok(())
}
