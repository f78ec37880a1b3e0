// src/webhook.rs
//! Webhook HTTP intake (C8, spec §4.6).
//!
//! An `axum` handler implementing the six-step admission algorithm verbatim:
//! validate -> pause check -> dedup -> insert pending -> enqueue -> respond
//! 202. Modeled on this crate's JSON-REST conventions (typed request/response
//! structs, `IntoResponse` per outcome) rather than returning raw status
//! codes from ad-hoc branches.

use crate::queue::{JobPayload, JobQueue};
use crate::system_flags::SystemFlags;
use axum::extract::State;
use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use axum::routing::post;
use axum::{Json, Router};
use log::{info, warn};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use sqlx::PgPool;
use std::sync::Arc;
use std::time::Duration;
use tower_http::timeout::TimeoutLayer;
use tower_http::trace::TraceLayer;
use uuid::Uuid;

const RECOGNIZED_EVENTS: &[&str] = &["cruiseline_pricing_updated", "cruises_live_pricing_updated"];
const REQUEST_TIMEOUT: Duration = Duration::from_secs(10);

#[derive(Clone)]
pub struct WebhookState {
    pub db_pool: PgPool,
    pub queue: Arc<JobQueue>,
    pub flags: Arc<SystemFlags>,
    pub dedup_window_sec: i64,
}

pub fn router(state: WebhookState) -> Router {
    Router::new()
        .route("/api/webhooks/traveltek/cruiseline-pricing-updated", post(handle_webhook))
        .layer(TraceLayer::new_for_http())
        .layer(TimeoutLayer::new(REQUEST_TIMEOUT))
        .with_state(state)
}

#[derive(Debug, Deserialize)]
pub struct WebhookBody {
    pub event: String,
    pub lineid: i32,
    pub marketid: Option<i32>,
    pub currency: Option<String>,
    pub description: Option<String>,
    pub timestamp: i64,
}

#[derive(Debug, Serialize)]
struct WebhookAck {
    #[serde(rename = "eventId")]
    event_id: Uuid,
}

async fn handle_webhook(
    State(state): State<WebhookState>,
    Json(body): Json<WebhookBody>,
) -> Response {
    // Step 1: validate schema.
    if let Err(reason) = validate(&body) {
        warn!("webhook rejected: {}", reason);
        crate::metrics::increment_webhook_received("rejected");
        return (StatusCode::BAD_REQUEST, reason).into_response();
    }

    // Step 2: webhooks_paused short-circuits straight to a skipped, 202'd event.
    if state.flags.webhooks_paused() {
        info!("webhook intake paused; recording line {} event as skipped", body.lineid);
        let event_id = match insert_event(&state.db_pool, &body, "skipped", state.dedup_window_sec).await {
            Ok(id) => id,
            Err(e) => return internal_error(e),
        };
        crate::metrics::increment_webhook_received("skipped_paused");
        return (StatusCode::ACCEPTED, Json(WebhookAck { event_id })).into_response();
    }

    // Step 3: dedup key (lineId, eventType, floor(receivedAt / dedupWindowSec)).
    let dedup_key_hash = dedup_key_hash(body.lineid, &body.event, body.timestamp, state.dedup_window_sec);
    match find_active_duplicate(&state.db_pool, &dedup_key_hash).await {
        Ok(Some(existing_id)) => {
            info!("webhook deduplicated against existing event {}", existing_id);
            crate::metrics::increment_webhook_received("skipped_dedup");
            return (StatusCode::ACCEPTED, Json(WebhookAck { event_id: existing_id })).into_response();
        }
        Ok(None) => {}
        Err(e) => return internal_error(e),
    }

    // Step 4: insert pending WebhookEvent.
    let event_id = match insert_pending(&state.db_pool, &body, &dedup_key_hash).await {
        Ok(id) => id,
        Err(e) => return internal_error(e),
    };

    // Step 5: enqueue webhook-intake job.
    state.queue.enqueue(JobPayload::WebhookIntake { event_id });

    crate::metrics::increment_webhook_received("accepted");
    // Step 6: respond 202 with the event id.
    (StatusCode::ACCEPTED, Json(WebhookAck { event_id })).into_response()
}

fn validate(body: &WebhookBody) -> Result<(), String> {
    if !RECOGNIZED_EVENTS.contains(&body.event.as_str()) {
        return Err(format!("unrecognized event type: {}", body.event));
    }
    if body.lineid <= 0 {
        return Err("lineid must be positive".to_string());
    }
    if body.timestamp <= 0 {
        return Err("timestamp must be a positive unix time".to_string());
    }
    Ok(())
}

fn dedup_key_hash(line_id: i32, event_type: &str, received_at: i64, window_sec: i64) -> String {
    let bucket = received_at.div_euclid(window_sec.max(1));
    let raw = format!("{}:{}:{}", line_id, event_type, bucket);
    let digest = Sha256::digest(raw.as_bytes());
    hex::encode(digest)
}

async fn find_active_duplicate(pool: &PgPool, dedup_key_hash: &str) -> Result<Option<Uuid>, sqlx::Error> {
    let row: Option<(Uuid,)> = sqlx::query_as(&format!(
        "SELECT id FROM {}.webhook_events WHERE dedup_key_hash = $1 AND status != 'failed' ORDER BY received_at DESC LIMIT 1",
        crate::persistence::SCHEMA
    ))
    .bind(dedup_key_hash)
    .fetch_optional(pool)
    .await?;
    Ok(row.map(|(id,)| id))
}

async fn insert_pending(pool: &PgPool, body: &WebhookBody, dedup_key_hash: &str) -> Result<Uuid, sqlx::Error> {
    insert_event_with_status(pool, body, dedup_key_hash, "pending").await
}

async fn insert_event(
    pool: &PgPool,
    body: &WebhookBody,
    status: &str,
    dedup_window_sec: i64,
) -> Result<Uuid, sqlx::Error> {
    let dedup_key_hash = dedup_key_hash(body.lineid, &body.event, body.timestamp, dedup_window_sec);
    insert_event_with_status(pool, body, &dedup_key_hash, status).await
}

async fn insert_event_with_status(
    pool: &PgPool,
    body: &WebhookBody,
    dedup_key_hash: &str,
    status: &str,
) -> Result<Uuid, sqlx::Error> {
    let payload = serde_json::json!({
        "event": body.event,
        "lineid": body.lineid,
        "marketid": body.marketid,
        "currency": body.currency,
        "description": body.description,
        "timestamp": body.timestamp,
    });

    let row: (Uuid,) = sqlx::query_as(&format!(
        "INSERT INTO {schema}.webhook_events (line_id, event_type, payload, dedup_key_hash, status)
         VALUES ($1, $2, $3, $4, $5)
         RETURNING id",
        schema = crate::persistence::SCHEMA
    ))
    .bind(body.lineid)
    .bind(&body.event)
    .bind(payload)
    .bind(dedup_key_hash)
    .bind(status)
    .fetch_one(pool)
    .await?;

    Ok(row.0)
}

fn internal_error(e: sqlx::Error) -> Response {
    warn!("webhook intake database error: {}", e);
    (StatusCode::INTERNAL_SERVER_ERROR, "internal error").into_response()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn rejects_unrecognized_event_type() {
        let body = WebhookBody {
            event: "something_else".to_string(),
            lineid: 22,
            marketid: None,
            currency: None,
            description: None,
            timestamp: 1_700_000_000,
        };
        assert!(validate(&body).is_err());
    }

    #[test]
    fn accepts_recognized_event_type() {
        let body = WebhookBody {
            event: "cruiseline_pricing_updated".to_string(),
            lineid: 22,
            marketid: None,
            currency: None,
            description: None,
            timestamp: 1_700_000_000,
        };
        assert!(validate(&body).is_ok());
    }

    #[test]
    fn dedup_key_is_stable_within_window_and_changes_across_it() {
        let a = dedup_key_hash(22, "cruiseline_pricing_updated", 1_700_000_000, 300);
        let b = dedup_key_hash(22, "cruiseline_pricing_updated", 1_700_000_100, 300);
        let c = dedup_key_hash(22, "cruiseline_pricing_updated", 1_700_000_400, 300);
        assert_eq!(a, b);
        assert_ne!(a, c);
    }
}
