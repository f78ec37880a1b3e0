// src/persistence/mod.rs
//! Database connection, schema and the batched writer (C7).
//!
//! Connection bootstrap and idempotent schema creation follow this crate's
//! existing `pg_advisory_xact_lock`-guarded migration pattern: acquire an
//! advisory lock inside a transaction, `CREATE TABLE IF NOT EXISTS` /
//! `ADD COLUMN IF NOT EXISTS` everything, commit. No external migration
//! runner, matching spec.md's silence on migrations and this crate's own
//! prior approach.

pub mod writer;

use anyhow::Result;
use log::{info, warn};
use sqlx::postgres::PgPoolOptions;
use sqlx::{Executor, PgPool};
use std::time::Duration;

pub const SCHEMA: &str = "traveltek";

const MIGRATION_LOCK_ID: i64 = 0x54_52_41_56_45_4C_54_4B; // "TRAVELTK" in hex, truncated to i64

/// Connects to Postgres with retry-with-backoff to survive DNS/startup races
/// (e.g. in Compose), then runs schema initialization once inside an
/// advisory-locked transaction.
pub async fn connect(database_url: &str, pool_max: u32) -> Result<PgPool> {
    let mut last_err: Option<anyhow::Error> = None;
    let max_attempts: u32 = 10;

    for attempt in 1..=max_attempts {
        match PgPoolOptions::new()
            .max_connections(pool_max)
            .acquire_timeout(Duration::from_secs(5))
            .connect(database_url)
            .await
        {
            Ok(pool) => {
                info!("connected to database (attempt {}/{})", attempt, max_attempts);
                match initialize_schema(&pool).await {
                    Ok(()) => return Ok(pool),
                    Err(e) => last_err = Some(e),
                }
            }
            Err(e) => last_err = Some(e.into()),
        }

        let delay_ms = (1u64 << attempt.min(6)) * 200;
        warn!(
            "db connect/init attempt {}/{} failed, retrying in {}ms",
            attempt, max_attempts, delay_ms
        );
        tokio::time::sleep(Duration::from_millis(delay_ms)).await;
    }

    Err(last_err.unwrap_or_else(|| anyhow::anyhow!("unknown database connection error")))
}

/// Idempotent schema creation, guarded by a transaction-scoped advisory lock
/// so concurrent worker processes don't race on `CREATE TABLE`.
pub async fn initialize_schema(pool: &PgPool) -> Result<()> {
    let mut tx = pool.begin().await?;

    sqlx::query("SELECT pg_advisory_xact_lock($1)")
        .bind(MIGRATION_LOCK_ID)
        .execute(tx.as_mut())
        .await?;

    tx.execute(format!("CREATE SCHEMA IF NOT EXISTS {}", SCHEMA).as_str())
        .await?;
    tx.execute("CREATE EXTENSION IF NOT EXISTS \"uuid-ossp\"").await?;

    create_lookup_tables(&mut tx).await?;
    create_cruise_tables(&mut tx).await?;
    create_operational_tables(&mut tx).await?;
    create_cheapest_price_trigger(&mut tx).await?;

    tx.commit().await?;
    info!("schema initialization complete");
    Ok(())
}

async fn create_lookup_tables(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.cruise_lines (
                line_id INTEGER PRIMARY KEY,
                line_id_override INTEGER,
                name TEXT,
                code TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.ships (
                ship_id INTEGER PRIMARY KEY,
                line_id INTEGER NOT NULL REFERENCES {schema}.cruise_lines(line_id),
                name TEXT,
                content JSONB,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.ports (
                port_id INTEGER PRIMARY KEY,
                name TEXT,
                country_code TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.regions (
                region_id INTEGER PRIMARY KEY,
                name TEXT,
                parent_region_id INTEGER,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    Ok(())
}

async fn create_cruise_tables(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.cruises (
                code_to_cruise_id TEXT PRIMARY KEY,
                cruise_id BIGINT,
                cruise_line_id INTEGER NOT NULL REFERENCES {schema}.cruise_lines(line_id),
                ship_id INTEGER NOT NULL REFERENCES {schema}.ships(ship_id),
                name TEXT,
                sailing_date DATE,
                return_date DATE,
                nights INTEGER,
                embark_port_id INTEGER,
                disembark_port_id INTEGER,
                port_ids INTEGER[] NOT NULL DEFAULT '{{}}',
                region_ids INTEGER[] NOT NULL DEFAULT '{{}}',
                interior_price NUMERIC(12,2),
                oceanview_price NUMERIC(12,2),
                balcony_price NUMERIC(12,2),
                suite_price NUMERIC(12,2),
                cheapest_price NUMERIC(12,2),
                cheapest_cabin_type TEXT,
                raw_data JSONB,
                is_active BOOLEAN NOT NULL DEFAULT TRUE,
                show_cruise BOOLEAN NOT NULL DEFAULT TRUE,
                needs_price_update BOOLEAN NOT NULL DEFAULT FALSE,
                price_update_requested_at TIMESTAMPTZ,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE INDEX IF NOT EXISTS idx_cruises_line_sailing ON {schema}.cruises (cruise_line_id, sailing_date)",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.itinerary_days (
                code_to_cruise_id TEXT NOT NULL REFERENCES {schema}.cruises(code_to_cruise_id) ON DELETE CASCADE,
                day_number INTEGER NOT NULL,
                port_id INTEGER,
                arrive_time TEXT,
                depart_time TEXT,
                description TEXT,
                PRIMARY KEY (code_to_cruise_id, day_number)
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.cheapest_pricing (
                code_to_cruise_id TEXT PRIMARY KEY REFERENCES {schema}.cruises(code_to_cruise_id) ON DELETE CASCADE,
                interior_price NUMERIC(12,2),
                oceanview_price NUMERIC(12,2),
                balcony_price NUMERIC(12,2),
                suite_price NUMERIC(12,2),
                cheapest_price NUMERIC(12,2),
                cheapest_cabin_type TEXT,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.price_snapshots (
                id UUID PRIMARY KEY DEFAULT uuid_generate_v4(),
                code_to_cruise_id TEXT NOT NULL REFERENCES {schema}.cruises(code_to_cruise_id) ON DELETE CASCADE,
                interior_price NUMERIC(12,2),
                oceanview_price NUMERIC(12,2),
                balcony_price NUMERIC(12,2),
                suite_price NUMERIC(12,2),
                triggering_webhook_event_id UUID,
                raw_data_hash TEXT,
                created_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE INDEX IF NOT EXISTS idx_price_snapshots_cruise_time ON {schema}.price_snapshots (code_to_cruise_id, created_at)",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    Ok(())
}

async fn create_operational_tables(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.webhook_events (
                id UUID PRIMARY KEY DEFAULT uuid_generate_v4(),
                line_id INTEGER NOT NULL,
                event_type TEXT NOT NULL,
                payload JSONB NOT NULL,
                dedup_key_hash TEXT NOT NULL,
                received_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                status TEXT NOT NULL DEFAULT 'pending',
                processed_at TIMESTAMPTZ,
                error_message TEXT,
                retry_count INTEGER NOT NULL DEFAULT 0
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE INDEX IF NOT EXISTS idx_webhook_events_line_received ON {schema}.webhook_events (line_id, received_at)",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE INDEX IF NOT EXISTS idx_webhook_events_dedup ON {schema}.webhook_events (dedup_key_hash)",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.sync_locks (
                line_id INTEGER NOT NULL,
                acquired_at TIMESTAMPTZ NOT NULL DEFAULT NOW(),
                owner TEXT NOT NULL,
                status TEXT NOT NULL DEFAULT 'processing',
                completed_at TIMESTAMPTZ
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE UNIQUE INDEX IF NOT EXISTS idx_sync_locks_active ON {schema}.sync_locks (line_id) WHERE status != 'released'",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "CREATE TABLE IF NOT EXISTS {schema}.system_flags (
                key TEXT PRIMARY KEY,
                value TEXT NOT NULL,
                updated_at TIMESTAMPTZ NOT NULL DEFAULT NOW()
            )",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "INSERT INTO {schema}.system_flags (key, value) VALUES
                ('webhooks_paused', 'false'),
                ('batch_sync_paused', 'false'),
                ('sync_in_progress', 'false'),
                ('webhook_deduplication_window', '300'),
                ('max_cruises_per_webhook', '500')
             ON CONFLICT (key) DO NOTHING",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    Ok(())
}

/// Database-side cheapest-price derivation (C12), per spec.md's explicit
/// "database-side derivation" architecture decision: a trigger fired after
/// any category-price change on `cruises` keeps `cheapest_pricing` in sync,
/// satisfying spec.md §3 invariant 3 independent of the Rust write path.
async fn create_cheapest_price_trigger(tx: &mut sqlx::Transaction<'_, sqlx::Postgres>) -> Result<()> {
    tx.execute(
        format!(
            "CREATE OR REPLACE FUNCTION {schema}.maintain_cheapest_pricing() RETURNS TRIGGER AS $$
             DECLARE
                computed_cheapest NUMERIC(12,2);
                computed_type TEXT;
             BEGIN
                SELECT price, cabin_type INTO computed_cheapest, computed_type FROM (
                    VALUES
                        (NEW.interior_price, 'interior'),
                        (NEW.oceanview_price, 'oceanview'),
                        (NEW.balcony_price, 'balcony'),
                        (NEW.suite_price, 'suite')
                ) AS categories(price, cabin_type)
                WHERE price IS NOT NULL AND price > 0
                ORDER BY price ASC, CASE cabin_type
                    WHEN 'interior' THEN 0 WHEN 'oceanview' THEN 1
                    WHEN 'balcony' THEN 2 WHEN 'suite' THEN 3 END ASC
                LIMIT 1;

                INSERT INTO {schema}.cheapest_pricing (
                    code_to_cruise_id, interior_price, oceanview_price, balcony_price,
                    suite_price, cheapest_price, cheapest_cabin_type, updated_at
                ) VALUES (
                    NEW.code_to_cruise_id, NEW.interior_price, NEW.oceanview_price,
                    NEW.balcony_price, NEW.suite_price, computed_cheapest, computed_type, NOW()
                )
                ON CONFLICT (code_to_cruise_id) DO UPDATE SET
                    interior_price = EXCLUDED.interior_price,
                    oceanview_price = EXCLUDED.oceanview_price,
                    balcony_price = EXCLUDED.balcony_price,
                    suite_price = EXCLUDED.suite_price,
                    cheapest_price = EXCLUDED.cheapest_price,
                    cheapest_cabin_type = EXCLUDED.cheapest_cabin_type,
                    updated_at = NOW();

                -- Mirror onto the cruises row itself so it and cheapest_pricing
                -- agree per the data model's invariant 3. Touches only
                -- cheapest_price/cheapest_cabin_type, which this trigger does not
                -- fire on, so this does not recurse.
                UPDATE {schema}.cruises
                    SET cheapest_price = computed_cheapest,
                        cheapest_cabin_type = computed_type
                    WHERE code_to_cruise_id = NEW.code_to_cruise_id;

                RETURN NEW;
             END;
             $$ LANGUAGE plpgsql",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    tx.execute(
        format!(
            "DROP TRIGGER IF EXISTS trg_maintain_cheapest_pricing ON {schema}.cruises",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;
    tx.execute(
        format!(
            "CREATE TRIGGER trg_maintain_cheapest_pricing
             AFTER INSERT OR UPDATE OF interior_price, oceanview_price, balcony_price, suite_price
             ON {schema}.cruises
             FOR EACH ROW EXECUTE FUNCTION {schema}.maintain_cheapest_pricing()",
            schema = SCHEMA
        )
        .as_str(),
    )
    .await?;

    Ok(())
}
