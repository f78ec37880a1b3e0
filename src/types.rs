// src/types.rs
//! Canonical domain types shared across the ingestion pipeline.

use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// A file enumerated by Discovery (C2) at
/// `/YYYY/MM/<lineId>/<shipId>/<codeToCruiseId>.json`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileRef {
    pub path: String,
    pub year: u16,
    pub month: u8,
    pub line_id: i32,
    pub ship_id: i32,
    pub code_to_cruise_id: String,
    pub size: u64,
    pub last_modified: DateTime<Utc>,
}

/// Raw provider JSON, tagged by the shape the Normalizer (C3) detected it in.
#[derive(Debug, Clone)]
pub enum RawRecord {
    /// Form (a): a proper JSON object.
    Proper(serde_json::Value),
    /// Form (b): a JSON string that itself decodes to a proper object.
    JsonString(serde_json::Value),
    /// Form (c): an object keyed by decimal-string indices, one character each.
    CharIndexed(serde_json::Value),
}

impl RawRecord {
    /// The canonicalized JSON value regardless of the originating shape.
    pub fn value(&self) -> &serde_json::Value {
        match self {
            RawRecord::Proper(v) | RawRecord::JsonString(v) | RawRecord::CharIndexed(v) => v,
        }
    }
}

/// Canonical in-memory record produced by the Normalizer (C3), per spec §4.3.
#[derive(Debug, Clone, Default)]
pub struct CanonicalRecord {
    pub cruise_id: Option<i64>,
    pub code_to_cruise_id: String,
    pub line_id: i32,
    pub ship_id: i32,
    pub name: Option<String>,
    pub sail_date: Option<DateTime<Utc>>,
    pub start_date: Option<DateTime<Utc>>,
    pub nights: Option<i32>,
    pub start_port_id: Option<i32>,
    pub end_port_id: Option<i32>,
    pub port_ids: Vec<i32>,
    pub region_ids: Vec<i32>,
    pub market_id: Option<i32>,
    pub owner_id: Option<i32>,
    pub ship_content: Option<serde_json::Value>,
    pub line_content: Option<serde_json::Value>,
    pub itinerary: Vec<ItineraryDayRaw>,
    pub raw: serde_json::Value,
}

/// Raw itinerary entry as read off the canonical record, before resolving its
/// port_id against the Port lookup table.
#[derive(Debug, Clone)]
pub struct ItineraryDayRaw {
    pub day_number: i32,
    pub port_id: Option<i32>,
    pub arrive_time: Option<String>,
    pub depart_time: Option<String>,
    pub description: Option<String>,
}

/// The four cabin categories, in the fixed tie-break order used by C4.
pub const CABIN_CATEGORIES: [&str; 4] = ["interior", "oceanview", "balcony", "suite"];

/// Output of the Price Extractor (C4): `{interior,oceanview,balcony,suite,cheapest}`.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ExtractedPrices {
    pub interior: Option<Decimal>,
    pub oceanview: Option<Decimal>,
    pub balcony: Option<Decimal>,
    pub suite: Option<Decimal>,
    pub cheapest: Option<Decimal>,
    pub cheapest_cabin_type: Option<String>,
}

impl ExtractedPrices {
    /// Recomputes `cheapest`/`cheapest_cabin_type` from the four categories,
    /// per spec §3 invariant 2 and §4.4's fixed tie-break order.
    pub fn with_derived_cheapest(mut self) -> Self {
        let candidates = [
            ("interior", self.interior),
            ("oceanview", self.oceanview),
            ("balcony", self.balcony),
            ("suite", self.suite),
        ];
        let mut best: Option<(&str, Decimal)> = None;
        for (name, price) in candidates {
            if let Some(p) = price {
                if p > Decimal::ZERO {
                    match best {
                        Some((_, b)) if p >= b => {}
                        _ => best = Some((name, p)),
                    }
                }
            }
        }
        match best {
            Some((name, price)) => {
                self.cheapest = Some(price);
                self.cheapest_cabin_type = Some(name.to_string());
            }
            None => {
                self.cheapest = None;
                self.cheapest_cabin_type = None;
            }
        }
        self
    }
}

/// Status of a `WebhookEvent` ledger row (spec §3/§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(type_name = "text", rename_all = "lowercase")]
pub enum WebhookStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    Skipped,
}

impl WebhookStatus {
    /// `pending -> processing -> {completed, failed, skipped}`; terminal
    /// states are final except an administrative `failed -> pending` reset.
    pub fn can_transition_to(self, next: WebhookStatus) -> bool {
        use WebhookStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Failed)
                | (Processing, Skipped)
                | (Pending, Skipped)
                | (Failed, Pending)
        )
    }

    pub fn is_terminal(self) -> bool {
        matches!(self, WebhookStatus::Completed | WebhookStatus::Failed | WebhookStatus::Skipped)
    }
}

/// A `WebhookEvent` ledger entry (spec §3).
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    pub id: Uuid,
    pub line_id: i32,
    pub event_type: String,
    pub payload: serde_json::Value,
    pub received_at: DateTime<Utc>,
    pub status: WebhookStatus,
    pub processed_at: Option<DateTime<Utc>>,
    pub error_message: Option<String>,
    pub retry_count: i32,
}

/// State of a queued job (spec §4.5/§4.10).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum JobState {
    Waiting,
    Active,
    Delayed,
    Completed,
    Failed,
}

impl JobState {
    /// `waiting -> active -> {completed, failed, delayed}`; `delayed ->
    /// waiting` once `notBefore` passes.
    pub fn can_transition_to(self, next: JobState) -> bool {
        use JobState::*;
        matches!(
            (self, next),
            (Waiting, Active)
                | (Active, Completed)
                | (Active, Failed)
                | (Active, Delayed)
                | (Delayed, Waiting)
        )
    }
}

/// Named queues (spec §4.5).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum QueueName {
    WebhookIntake,
    CruiseLineProcessing,
}

impl QueueName {
    pub fn as_str(self) -> &'static str {
        match self {
            QueueName::WebhookIntake => "webhook-intake",
            QueueName::CruiseLineProcessing => "cruise-line-processing",
        }
    }

    pub fn default_max_attempts(self) -> u32 {
        match self {
            QueueName::WebhookIntake => 3,
            QueueName::CruiseLineProcessing => 5,
        }
    }
}
