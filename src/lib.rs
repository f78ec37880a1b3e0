//! # Traveltek Ingestion Pipeline
//!
//! A webhook-triggered pipeline that fetches cruise pricing and itinerary files
//! from a third-party FTP provider, normalizes their JSON (which arrives in three
//! pathological shapes), extracts canonical pricing, and upserts the result into
//! a relational store consumed by a downstream search API.
//!
//! ## Overview
//!
//! - **Intake**: an HTTP webhook admits, deduplicates and enqueues change events.
//! - **Discovery & Download**: a pooled, circuit-breaker-protected FTP client
//!   enumerates and fetches the affected provider files.
//! - **Normalization & Extraction**: tolerant JSON normalization followed by a
//!   fallback price ladder, with per-line corrections.
//! - **Persistence**: batched, idempotent upserts with a cheapest-price trigger
//!   and an audit trail of price changes.
//! - **Queue & Worker Pool**: durable job queues, per-line mutual exclusion,
//!   retry/backoff, and a reaper that reclaims stuck work.

// Errors & configuration
/// Crate-wide error kinds and propagation policy
pub mod errors;
/// Layered configuration (file + environment overrides)
pub mod settings;

// FTP ingestion
/// Pooled, circuit-breaker-protected FTP sessions
pub mod ftp_pool;
/// Directory/file enumeration over the provider's FTP layout
pub mod discovery;

// Normalization & extraction
/// Tolerant JSON shape detection and canonicalization
pub mod normalizer;
/// Category price ladder and per-line corrections
pub mod price_extractor;

// Queueing & orchestration
/// Durable job queues and in-memory retry scheduling
pub mod queue;
/// Worker pool driving the discovery -> normalize -> persist pipeline
pub mod worker;
/// Per-line mutual exclusion
pub mod sync_lock;
/// Process-wide pause switches and admission flags
pub mod system_flags;
/// Periodic sweeper for stuck jobs, events and locks
pub mod reaper;
/// Deferred (mark-and-drain) update path for oversized lines
pub mod deferred;

// HTTP intake
/// Webhook HTTP handler
pub mod webhook;
/// Reconciles the webhook-events ledger against the in-process job queue
pub mod recovery;

// Persistence
/// Database connection, schema, and batched writer
pub mod persistence;

// Observability
/// Metrics counters/gauges (feature-gated backend)
pub mod metrics;
/// Best-effort outbound notifications (Slack)
pub mod notifications;

// Shared types
/// Canonical domain types shared across modules
pub mod types;

pub use errors::IngestError;
pub use settings::Settings;
