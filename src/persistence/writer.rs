// src/persistence/writer.rs
//! Async batched writer (C7), modeled directly on this crate's
//! `mpsc::unbounded_channel` + `tokio::select!` batched-flush writer: a
//! background task accumulates operations and commits them in a single
//! transaction on `batch_size` or `flush_interval`, generalized here from
//! pool-upsert operations to cruise/itinerary/pricing/snapshot upserts
//! (spec §4.7).

use crate::errors::IngestError;
use crate::persistence::SCHEMA;
use crate::types::{CanonicalRecord, ExtractedPrices};
use log::{error, info, warn};
use rust_decimal::Decimal;
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use tokio::sync::mpsc;
use tokio::time::{interval, Duration};
use uuid::Uuid;

/// One provider file's worth of writes, ordered lookups-first inside
/// `apply_file_upsert` per spec §4.7.
#[derive(Debug, Clone)]
pub struct FileUpsert {
    pub record: CanonicalRecord,
    pub prices: ExtractedPrices,
    pub line_name: Option<String>,
    pub ship_name: Option<String>,
    pub port_names: Vec<(i32, Option<String>)>,
    pub region_names: Vec<(i32, Option<String>)>,
    pub webhook_event_id: Option<Uuid>,
}

#[derive(Debug, Clone)]
pub enum DbOperation {
    UpsertFile(Box<FileUpsert>),
    MarkNeedsPriceUpdate { code_to_cruise_id: String },
}

/// Non-blocking producer handle; the background task performs all I/O.
pub struct PersistenceWriter {
    tx: mpsc::UnboundedSender<DbOperation>,
}

impl PersistenceWriter {
    pub fn new(pool: PgPool, batch_size: usize, flush_interval: Duration) -> Self {
        let (tx, rx) = mpsc::unbounded_channel();
        tokio::spawn(Self::writer_task(pool, rx, batch_size, flush_interval));
        Self { tx }
    }

    pub fn send(&self, op: DbOperation) -> Result<(), IngestError> {
        self.tx
            .send(op)
            .map_err(|_| IngestError::DbConflict("persistence writer task has stopped".to_string()))
    }

    async fn writer_task(
        pool: PgPool,
        mut rx: mpsc::UnboundedReceiver<DbOperation>,
        batch_size: usize,
        flush_interval: Duration,
    ) {
        let mut batch = Vec::with_capacity(batch_size);
        let mut ticker = interval(flush_interval);
        info!(
            "persistence writer started (batch_size={}, flush_interval={:?})",
            batch_size, flush_interval
        );

        loop {
            tokio::select! {
                op = rx.recv() => {
                    match op {
                        Some(op) => {
                            batch.push(op);
                            if batch.len() >= batch_size {
                                Self::flush_batch(&pool, &mut batch).await;
                            }
                        }
                        None => {
                            if !batch.is_empty() {
                                Self::flush_batch(&pool, &mut batch).await;
                            }
                            info!("persistence writer shutting down");
                            break;
                        }
                    }
                }
                _ = ticker.tick() => {
                    if !batch.is_empty() {
                        Self::flush_batch(&pool, &mut batch).await;
                    }
                }
            }
        }
    }

    /// Commits a batch in one transaction. On failure the batch is retried
    /// once; persistent failure splits the batch in half and recurses,
    /// surfacing the offending record, per spec §4.7.
    async fn flush_batch(pool: &PgPool, batch: &mut Vec<DbOperation>) {
        if batch.is_empty() {
            return;
        }
        let ops = std::mem::take(batch);
        Self::commit_with_retry(pool, ops, 0).await;
    }

    async fn commit_with_retry(pool: &PgPool, ops: Vec<DbOperation>, depth: u32) {
        let started = std::time::Instant::now();
        match Self::commit(pool, &ops).await {
            Ok(()) => {
                crate::metrics::record_db_batch_size(ops.len());
                crate::metrics::record_db_batch_duration(started.elapsed());
            }
            Err(e) if depth == 0 => {
                warn!("batch commit failed, retrying once: {}", e);
                Self::commit_with_retry_inner(pool, ops, depth + 1).await;
            }
            Err(e) => {
                error!("batch commit failed after retry: {}", e);
                Self::split_and_recurse(pool, ops).await;
            }
        }
    }

    async fn commit_with_retry_inner(pool: &PgPool, ops: Vec<DbOperation>, depth: u32) {
        match Self::commit(pool, &ops).await {
            Ok(()) => {}
            Err(e) => {
                error!("batch commit retry failed: {}", e);
                let _ = depth;
                Self::split_and_recurse(pool, ops).await;
            }
        }
    }

    async fn split_and_recurse(pool: &PgPool, ops: Vec<DbOperation>) {
        if ops.len() <= 1 {
            if let Some(op) = ops.into_iter().next() {
                error!("persistent failure for single offending record: {:?}", op);
            }
            return;
        }
        let mid = ops.len() / 2;
        let (left, right) = ops.split_at(mid);
        Box::pin(Self::commit_with_retry(pool, left.to_vec(), 0)).await;
        Box::pin(Self::commit_with_retry(pool, right.to_vec(), 0)).await;
    }

    async fn commit(pool: &PgPool, ops: &[DbOperation]) -> Result<(), sqlx::Error> {
        let mut tx = pool.begin().await?;
        for op in ops {
            match op {
                DbOperation::UpsertFile(upsert) => {
                    apply_file_upsert(&mut tx, upsert).await?;
                }
                DbOperation::MarkNeedsPriceUpdate { code_to_cruise_id } => {
                    sqlx::query(&format!(
                        "UPDATE {}.cruises SET needs_price_update = TRUE, price_update_requested_at = NOW() WHERE code_to_cruise_id = $1",
                        SCHEMA
                    ))
                    .bind(code_to_cruise_id)
                    .execute(tx.as_mut())
                    .await?;
                }
            }
        }
        tx.commit().await
    }
}

/// Applies one file's writes in lookups-first, sailing-last order (spec
/// §4.7): line -> ship -> ports -> regions -> cruise -> itinerary ->
/// (cheapest_pricing is trigger-maintained) -> price_snapshot on change.
async fn apply_file_upsert(
    tx: &mut sqlx::Transaction<'_, sqlx::Postgres>,
    upsert: &FileUpsert,
) -> Result<(), sqlx::Error> {
    let record = &upsert.record;

    sqlx::query(&format!(
        "INSERT INTO {schema}.cruise_lines (line_id, name, updated_at) VALUES ($1, $2, NOW())
         ON CONFLICT (line_id) DO UPDATE SET
            name = COALESCE(EXCLUDED.name, {schema}.cruise_lines.name),
            updated_at = NOW()",
        schema = SCHEMA
    ))
    .bind(record.line_id)
    .bind(&upsert.line_name)
    .execute(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {schema}.ships (ship_id, line_id, name, content, updated_at) VALUES ($1, $2, $3, $4, NOW())
         ON CONFLICT (ship_id) DO UPDATE SET
            name = COALESCE(EXCLUDED.name, {schema}.ships.name),
            content = COALESCE(EXCLUDED.content, {schema}.ships.content),
            updated_at = NOW()",
        schema = SCHEMA
    ))
    .bind(record.ship_id)
    .bind(record.line_id)
    .bind(&upsert.ship_name)
    .bind(&record.ship_content)
    .execute(tx.as_mut())
    .await?;

    for (port_id, name) in &upsert.port_names {
        sqlx::query(&format!(
            "INSERT INTO {schema}.ports (port_id, name, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (port_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, {schema}.ports.name),
                updated_at = NOW()",
            schema = SCHEMA
        ))
        .bind(port_id)
        .bind(name)
        .execute(tx.as_mut())
        .await?;
    }

    for (region_id, name) in &upsert.region_names {
        sqlx::query(&format!(
            "INSERT INTO {schema}.regions (region_id, name, updated_at) VALUES ($1, $2, NOW())
             ON CONFLICT (region_id) DO UPDATE SET
                name = COALESCE(EXCLUDED.name, {schema}.regions.name),
                updated_at = NOW()",
            schema = SCHEMA
        ))
        .bind(region_id)
        .bind(name)
        .execute(tx.as_mut())
        .await?;
    }

    let previous: Option<(Option<Decimal>, Option<Decimal>, Option<Decimal>, Option<Decimal>)> = sqlx::query_as(
        &format!(
            "SELECT interior_price, oceanview_price, balcony_price, suite_price FROM {}.cruises WHERE code_to_cruise_id = $1",
            SCHEMA
        ),
    )
    .bind(&record.code_to_cruise_id)
    .fetch_optional(tx.as_mut())
    .await?;

    sqlx::query(&format!(
        "INSERT INTO {schema}.cruises (
            code_to_cruise_id, cruise_id, cruise_line_id, ship_id, name, sailing_date,
            return_date, nights, embark_port_id, disembark_port_id, port_ids, region_ids,
            interior_price, oceanview_price, balcony_price, suite_price,
            raw_data, updated_at
         ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,NOW())
         ON CONFLICT (code_to_cruise_id) DO UPDATE SET
            cruise_id = COALESCE(EXCLUDED.cruise_id, {schema}.cruises.cruise_id),
            name = COALESCE(EXCLUDED.name, {schema}.cruises.name),
            sailing_date = COALESCE(EXCLUDED.sailing_date, {schema}.cruises.sailing_date),
            return_date = COALESCE(EXCLUDED.return_date, {schema}.cruises.return_date),
            nights = COALESCE(EXCLUDED.nights, {schema}.cruises.nights),
            embark_port_id = COALESCE(EXCLUDED.embark_port_id, {schema}.cruises.embark_port_id),
            disembark_port_id = COALESCE(EXCLUDED.disembark_port_id, {schema}.cruises.disembark_port_id),
            port_ids = COALESCE(EXCLUDED.port_ids, {schema}.cruises.port_ids),
            region_ids = COALESCE(EXCLUDED.region_ids, {schema}.cruises.region_ids),
            interior_price = COALESCE(EXCLUDED.interior_price, {schema}.cruises.interior_price),
            oceanview_price = COALESCE(EXCLUDED.oceanview_price, {schema}.cruises.oceanview_price),
            balcony_price = COALESCE(EXCLUDED.balcony_price, {schema}.cruises.balcony_price),
            suite_price = COALESCE(EXCLUDED.suite_price, {schema}.cruises.suite_price),
            raw_data = COALESCE(EXCLUDED.raw_data, {schema}.cruises.raw_data),
            needs_price_update = FALSE,
            updated_at = NOW()",
        schema = SCHEMA
    ))
    .bind(&record.code_to_cruise_id)
    .bind(record.cruise_id)
    .bind(record.line_id)
    .bind(record.ship_id)
    .bind(&record.name)
    .bind(record.sail_date.map(|d| d.date_naive()))
    .bind(record.start_date.map(|d| d.date_naive()))
    .bind(record.nights)
    .bind(record.start_port_id)
    .bind(record.end_port_id)
    .bind(&record.port_ids)
    .bind(&record.region_ids)
    .bind(upsert.prices.interior)
    .bind(upsert.prices.oceanview)
    .bind(upsert.prices.balcony)
    .bind(upsert.prices.suite)
    .bind(&record.raw)
    .execute(tx.as_mut())
    .await?;

    for day in &record.itinerary {
        sqlx::query(&format!(
            "INSERT INTO {schema}.itinerary_days (code_to_cruise_id, day_number, port_id, arrive_time, depart_time, description)
             VALUES ($1,$2,$3,$4,$5,$6)
             ON CONFLICT (code_to_cruise_id, day_number) DO UPDATE SET
                port_id = EXCLUDED.port_id,
                arrive_time = EXCLUDED.arrive_time,
                depart_time = EXCLUDED.depart_time,
                description = EXCLUDED.description",
            schema = SCHEMA
        ))
        .bind(&record.code_to_cruise_id)
        .bind(day.day_number)
        .bind(day.port_id)
        .bind(&day.arrive_time)
        .bind(&day.depart_time)
        .bind(&day.description)
        .execute(tx.as_mut())
        .await?;
    }

    if price_changed(previous, &upsert.prices) {
        // `previous` is guaranteed `Some` here: `price_changed` returns `false` on `None`.
        let (old_interior, old_oceanview, old_balcony, old_suite) = previous.unwrap();
        let raw_hash = hash_raw_data(&record.raw);
        sqlx::query(&format!(
            "INSERT INTO {schema}.price_snapshots (
                code_to_cruise_id, interior_price, oceanview_price, balcony_price, suite_price,
                triggering_webhook_event_id, raw_data_hash
             ) VALUES ($1,$2,$3,$4,$5,$6,$7)",
            schema = SCHEMA
        ))
        .bind(&record.code_to_cruise_id)
        .bind(old_interior)
        .bind(old_oceanview)
        .bind(old_balcony)
        .bind(old_suite)
        .bind(upsert.webhook_event_id)
        .bind(raw_hash)
        .execute(tx.as_mut())
        .await?;
        crate::metrics::increment_price_snapshots();
    }

    Ok(())
}

/// Whether any of the four category prices changed by more than
/// `price_change_epsilon` (default $0.01), per spec §4.7. A first-time
/// insert (`previous == None`) never emits a snapshot.
fn price_changed(
    previous: Option<(Option<Decimal>, Option<Decimal>, Option<Decimal>, Option<Decimal>)>,
    current: &ExtractedPrices,
) -> bool {
    let Some((p_int, p_ocean, p_bal, p_suite)) = previous else {
        return false;
    };
    let epsilon = Decimal::new(1, 2); // 0.01
    changed_by_more_than(p_int, current.interior, epsilon)
        || changed_by_more_than(p_ocean, current.oceanview, epsilon)
        || changed_by_more_than(p_bal, current.balcony, epsilon)
        || changed_by_more_than(p_suite, current.suite, epsilon)
}

fn changed_by_more_than(old: Option<Decimal>, new: Option<Decimal>, epsilon: Decimal) -> bool {
    match (old, new) {
        (Some(o), Some(n)) => (o - n).abs() > epsilon,
        (None, Some(_)) | (Some(_), None) => true,
        (None, None) => false,
    }
}

fn hash_raw_data(value: &serde_json::Value) -> String {
    let bytes = serde_json::to_vec(value).unwrap_or_default();
    let digest = Sha256::digest(&bytes);
    hex::encode(digest)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn no_snapshot_on_first_insert() {
        assert!(!price_changed(
            None,
            &ExtractedPrices {
                interior: Some(Decimal::new(89900, 2)),
                ..Default::default()
            }
        ));
    }

    #[test]
    fn snapshot_when_price_moves_beyond_epsilon() {
        let previous = Some((Some(Decimal::new(89900, 2)), None, None, None));
        let current = ExtractedPrices {
            interior: Some(Decimal::new(79900, 2)),
            ..Default::default()
        };
        assert!(price_changed(previous, &current));
    }

    #[test]
    fn no_snapshot_within_epsilon() {
        let previous = Some((Some(Decimal::new(89900, 2)), None, None, None));
        let current = ExtractedPrices {
            interior: Some(Decimal::new(89900, 2)),
            ..Default::default()
        };
        assert!(!price_changed(previous, &current));
    }

    #[test]
    fn raw_data_hash_is_stable() {
        let value = serde_json::json!({"a": 1});
        assert_eq!(hash_raw_data(&value), hash_raw_data(&value));
    }
}
