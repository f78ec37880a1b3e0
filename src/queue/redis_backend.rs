// src/queue/redis_backend.rs
//! Best-effort durability mirror for the job queue, modeled on the dual
//! `#[cfg(feature = "redis")]` / `#[cfg(not(...))]` implementations this
//! crate's infrastructure already carried for cache coordination. When the
//! `redis` feature and `QUEUE_BACKEND_URL` are both configured, every job
//! transition is mirrored to a Redis list/hash so an operator can inspect
//! queue depth externally; the in-process `JobQueue` (`queue::mod`) remains
//! the source of truth for scheduling.

use anyhow::Result;
use log::info;
#[cfg(feature = "redis")]
use anyhow::Context;
#[cfg(feature = "redis")]
use redis::aio::ConnectionManager;
#[cfg(feature = "redis")]
use redis::{AsyncCommands, Client};

use crate::types::QueueName;

#[cfg(feature = "redis")]
pub struct RedisQueueMirror {
    conn: ConnectionManager,
}

#[cfg(not(feature = "redis"))]
pub struct RedisQueueMirror {
    _phantom: std::marker::PhantomData<()>,
}

impl RedisQueueMirror {
    #[cfg(feature = "redis")]
    pub async fn connect(url: &str) -> Result<Self> {
        let client = Client::open(url).context("failed to create redis client for queue mirror")?;
        let conn = ConnectionManager::new(client)
            .await
            .context("failed to connect to redis queue backend")?;
        info!("queue redis mirror connected to {}", url);
        Ok(Self { conn })
    }

    #[cfg(not(feature = "redis"))]
    pub async fn connect(_url: &str) -> Result<Self> {
        anyhow::bail!("redis feature not enabled; build with --features redis")
    }

    /// Records that `job_id` entered `state` on `queue`. Best-effort: a
    /// failure here never blocks job processing, matching spec §6's
    /// "delivery failures never block the pipeline" contract for outbound
    /// observability.
    #[cfg(feature = "redis")]
    pub async fn record_transition(&mut self, queue: QueueName, job_id: uuid::Uuid, state: &str) {
        let key = format!("queue:{}:depth:{}", queue.as_str(), state);
        let _: Result<(), _> = self.conn.incr(&key, 1).await;
        let job_key = format!("queue:{}:job:{}", queue.as_str(), job_id);
        let _: Result<(), _> = self.conn.set_ex::<_, _, ()>(&job_key, state, 3600).await;
    }

    #[cfg(not(feature = "redis"))]
    pub async fn record_transition(&mut self, _queue: QueueName, _job_id: uuid::Uuid, _state: &str) {
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    #[cfg(not(feature = "redis"))]
    async fn connect_without_feature_errors() {
        let result = RedisQueueMirror::connect("redis://localhost:6379").await;
        assert!(result.is_err());
    }
}
