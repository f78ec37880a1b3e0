// src/settings.rs

use config::{Config, ConfigError, File};
use serde::Deserialize;
use std::env;

#[derive(Debug, Deserialize, Clone)]
pub struct Ftp {
    pub host: String,
    pub user: String,
    pub password: String,
    #[serde(default = "default_ftp_pool_size")]
    pub pool_size: usize,
    #[serde(default = "default_ftp_op_timeout_ms")]
    pub op_timeout_ms: u64,
    #[serde(default = "default_ftp_max_lifetime_secs")]
    pub max_lifetime_secs: u64,
    #[serde(default)]
    pub circuit_breaker: CircuitBreaker,
    /// Caps FTP `list`/`download` calls per host, protecting the provider
    /// from bursty discovery fan-out across many concurrent line batches.
    #[serde(default = "default_ftp_ops_per_sec")]
    pub ops_per_sec: u32,
}

fn default_ftp_pool_size() -> usize {
    4
}
fn default_ftp_op_timeout_ms() -> u64 {
    30_000
}
fn default_ftp_max_lifetime_secs() -> u64 {
    3600
}
fn default_ftp_ops_per_sec() -> u32 {
    20
}

#[derive(Debug, Deserialize, Clone)]
pub struct CircuitBreaker {
    #[serde(default = "default_circuit_failure_threshold")]
    pub failure_threshold: u32,
    #[serde(default = "default_circuit_window_secs")]
    pub window_secs: u64,
    #[serde(default = "default_circuit_cooloff_ms")]
    pub cooloff_ms: u64,
}

fn default_circuit_failure_threshold() -> u32 {
    5
}
fn default_circuit_window_secs() -> u64 {
    60
}
fn default_circuit_cooloff_ms() -> u64 {
    60_000
}

impl Default for CircuitBreaker {
    fn default() -> Self {
        Self {
            failure_threshold: default_circuit_failure_threshold(),
            window_secs: default_circuit_window_secs(),
            cooloff_ms: default_circuit_cooloff_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Database {
    pub url: String,
    #[serde(default = "default_db_pool_max")]
    pub pool_max: u32,
}

fn default_db_pool_max() -> u32 {
    5
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Queue {
    /// Redis-compatible URL; absent means the in-process backend is used.
    pub backend_url: Option<String>,
    #[serde(default = "default_webhook_concurrency")]
    pub webhook_concurrency: usize,
    #[serde(default = "default_line_concurrency")]
    pub line_concurrency: usize,
    #[serde(default = "default_heartbeat_ms")]
    pub heartbeat_ms: u64,
    #[serde(default = "default_stalled_ms")]
    pub stalled_ms: u64,
    #[serde(default = "default_relock_backoff_ms")]
    pub relock_backoff_ms: u64,
    #[serde(default = "default_queue_high_water_mark")]
    pub high_water_mark: usize,
}

fn default_webhook_concurrency() -> usize {
    4
}
fn default_line_concurrency() -> usize {
    4
}
fn default_heartbeat_ms() -> u64 {
    10_000
}
fn default_stalled_ms() -> u64 {
    60_000
}
fn default_relock_backoff_ms() -> u64 {
    30_000
}
fn default_queue_high_water_mark() -> usize {
    1000
}

#[derive(Debug, Deserialize, Clone)]
pub struct Discovery {
    #[serde(default = "default_discovery_window_months")]
    pub window_months: u32,
    #[serde(default = "default_max_inline_batch")]
    pub max_inline_batch: usize,
    /// How often the periodic `batch-sync` job drains marks left by
    /// [`crate::deferred::DeferredQueue`] for oversized lines (spec §4.7/§4.13).
    #[serde(default = "default_batch_sync_interval_ms")]
    pub batch_sync_interval_ms: u64,
}

fn default_discovery_window_months() -> u32 {
    36
}
fn default_max_inline_batch() -> usize {
    750
}
fn default_batch_sync_interval_ms() -> u64 {
    120_000
}

impl Default for Discovery {
    fn default() -> Self {
        Self {
            window_months: default_discovery_window_months(),
            max_inline_batch: default_max_inline_batch(),
            batch_sync_interval_ms: default_batch_sync_interval_ms(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Webhook {
    #[serde(default = "default_dedup_window_sec")]
    pub dedup_window_sec: i64,
}

fn default_dedup_window_sec() -> i64 {
    300
}

impl Default for Webhook {
    fn default() -> Self {
        Self {
            dedup_window_sec: default_dedup_window_sec(),
        }
    }
}

#[derive(Debug, Deserialize, Clone, Default)]
pub struct Notifications {
    pub slack_webhook_url: Option<String>,
}

#[derive(Debug, Deserialize, Clone)]
pub struct Reaper {
    #[serde(default = "default_reaper_interval_ms")]
    pub interval_ms: u64,
    #[serde(default = "default_webhook_event_stuck_secs")]
    pub webhook_event_stuck_secs: i64,
    #[serde(default = "default_lock_ttl_ms")]
    pub lock_ttl_ms: u64,
    #[serde(default = "default_event_retention_days")]
    pub event_retention_days: i64,
}

fn default_reaper_interval_ms() -> u64 {
    60_000
}
fn default_webhook_event_stuck_secs() -> i64 {
    3600
}
fn default_lock_ttl_ms() -> u64 {
    2 * 3600 * 1000
}
fn default_event_retention_days() -> i64 {
    30
}

impl Default for Reaper {
    fn default() -> Self {
        Self {
            interval_ms: default_reaper_interval_ms(),
            webhook_event_stuck_secs: default_webhook_event_stuck_secs(),
            lock_ttl_ms: default_lock_ttl_ms(),
            event_retention_days: default_event_retention_days(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Persistence {
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_flush_interval_ms")]
    pub flush_interval_ms: u64,
    #[serde(default = "default_price_epsilon")]
    pub price_change_epsilon: String,
}

fn default_batch_size() -> usize {
    250
}
fn default_flush_interval_ms() -> u64 {
    200
}
fn default_price_epsilon() -> String {
    "0.01".to_string()
}

impl Default for Persistence {
    fn default() -> Self {
        Self {
            batch_size: default_batch_size(),
            flush_interval_ms: default_flush_interval_ms(),
            price_change_epsilon: default_price_epsilon(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct LogSettings {
    #[serde(default = "default_log_level")]
    pub level: String,
}

fn default_log_level() -> String {
    "info".to_string()
}

impl Default for LogSettings {
    fn default() -> Self {
        Self {
            level: default_log_level(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct Settings {
    pub ftp: Ftp,
    pub database: Database,
    #[serde(default)]
    pub queue: Queue,
    #[serde(default)]
    pub discovery: Discovery,
    #[serde(default)]
    pub webhook: Webhook,
    #[serde(default)]
    pub notifications: Notifications,
    #[serde(default)]
    pub reaper: Reaper,
    #[serde(default)]
    pub persistence: Persistence,
    #[serde(default)]
    pub log: LogSettings,
    #[serde(default = "default_environment")]
    pub environment: String,
}

fn default_environment() -> String {
    "development".to_string()
}

impl Settings {
    pub fn new() -> Result<Self, ConfigError> {
        let s = Config::builder()
            .add_source(File::with_name("Config.toml").required(false))
            .build()?;

        let mut settings: Self = s.try_deserialize()?;

        if let Ok(v) = env::var("FTP_HOST") {
            settings.ftp.host = v;
        }
        if let Ok(v) = env::var("FTP_USER") {
            settings.ftp.user = v;
        }
        if let Ok(v) = env::var("FTP_PASSWORD") {
            settings.ftp.password = v;
        }
        if let Ok(v) = env::var("FTP_POOL_SIZE") {
            if let Ok(n) = v.parse() {
                settings.ftp.pool_size = n;
            }
        }
        if let Ok(v) = env::var("FTP_OP_TIMEOUT_MS") {
            if let Ok(n) = v.parse() {
                settings.ftp.op_timeout_ms = n;
            }
        }
        if let Ok(v) = env::var("FTP_CIRCUIT_THRESHOLD") {
            if let Ok(n) = v.parse() {
                settings.ftp.circuit_breaker.failure_threshold = n;
            }
        }
        if let Ok(v) = env::var("FTP_CIRCUIT_COOLOFF_MS") {
            if let Ok(n) = v.parse() {
                settings.ftp.circuit_breaker.cooloff_ms = n;
            }
        }
        if let Ok(v) = env::var("DB_URL") {
            settings.database.url = v;
        }
        if let Ok(v) = env::var("DB_POOL_MAX") {
            if let Ok(n) = v.parse() {
                settings.database.pool_max = n;
            }
        }
        if let Ok(v) = env::var("QUEUE_BACKEND_URL") {
            settings.queue.backend_url = Some(v);
        }
        if let Ok(v) = env::var("QUEUE_WEBHOOK_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                settings.queue.webhook_concurrency = n;
            }
        }
        if let Ok(v) = env::var("QUEUE_LINE_CONCURRENCY") {
            if let Ok(n) = v.parse() {
                settings.queue.line_concurrency = n;
            }
        }
        if let Ok(v) = env::var("DEDUP_WINDOW_SEC") {
            if let Ok(n) = v.parse() {
                settings.webhook.dedup_window_sec = n;
            }
        }
        if let Ok(v) = env::var("MAX_INLINE_BATCH") {
            if let Ok(n) = v.parse() {
                settings.discovery.max_inline_batch = n;
            }
        }
        if let Ok(v) = env::var("DISCOVERY_WINDOW_MONTHS") {
            if let Ok(n) = v.parse() {
                settings.discovery.window_months = n;
            }
        }
        if let Ok(v) = env::var("BATCH_SYNC_INTERVAL_MS") {
            if let Ok(n) = v.parse() {
                settings.discovery.batch_sync_interval_ms = n;
            }
        }
        if let Ok(v) = env::var("SLACK_WEBHOOK_URL") {
            settings.notifications.slack_webhook_url = Some(v);
        }
        if let Ok(v) = env::var("NODE_ENV") {
            settings.environment = v;
        }

        if settings.environment == "production"
            && (settings.ftp.host.trim().is_empty()
                || settings.ftp.user.trim().is_empty()
                || settings.ftp.password.trim().is_empty())
        {
            return Err(ConfigError::Message(
                "FTP credentials must be present at startup in production".to_string(),
            ));
        }

        Ok(settings)
    }
}
