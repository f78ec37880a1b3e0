// src/notifications.rs
//! Best-effort outbound notifications (C10, spec §4.11/§6).
//!
//! A thin `reqwest` client posting to a Slack incoming webhook. Every send is
//! fire-and-forget with a short timeout; delivery failures are logged and
//! never propagate, matching spec §6's "delivery failures never block the
//! pipeline".

use log::warn;
use serde_json::json;
use std::time::Duration;

const SEND_TIMEOUT: Duration = Duration::from_secs(5);

#[derive(Clone)]
pub struct Notifier {
    client: reqwest::Client,
    webhook_url: Option<String>,
}

impl Notifier {
    pub fn new(webhook_url: Option<String>) -> Self {
        Self {
            client: reqwest::Client::new(),
            webhook_url,
        }
    }

    async fn send(&self, text: String) {
        let Some(url) = &self.webhook_url else {
            return;
        };
        let result = self
            .client
            .post(url)
            .timeout(SEND_TIMEOUT)
            .json(&json!({ "text": text }))
            .send()
            .await;
        if let Err(e) = result {
            warn!("slack notification delivery failed: {}", e);
        }
    }

    pub async fn batch_started(&self, line_id: i32, file_count: usize) {
        self.send(format!(
            ":arrows_counterclockwise: line {} batch started ({} files discovered)",
            line_id, file_count
        ))
        .await;
    }

    pub async fn batch_completed(&self, line_id: i32, processed: usize, failed: usize) {
        self.send(format!(
            ":white_check_mark: line {} batch completed: {} processed, {} failed",
            line_id, processed, failed
        ))
        .await;
    }

    pub async fn job_failed(&self, queue: &str, job_id: uuid::Uuid, reason: &str) {
        self.send(format!(
            ":x: job {} on `{}` moved to dead-letter: {}",
            job_id, queue, reason
        ))
        .await;
    }

    pub async fn circuit_breaker_state_changed(&self, host: &str, state: &str) {
        self.send(format!(
            ":warning: FTP circuit breaker for `{}` is now {}",
            host, state
        ))
        .await;
    }

    pub async fn reaper_action(&self, summary: &str) {
        self.send(format!(":broom: reaper: {}", summary)).await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn send_without_webhook_url_is_a_noop() {
        let notifier = Notifier::new(None);
        notifier.batch_started(22, 10).await;
    }
}
