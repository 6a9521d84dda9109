//! ABOUTME: External key-value broker transport (Redis-style sorted sets) —
//! ABOUTME: priority encoded as a negated score in a ZSET, message bodies in a companion HASH

use async_trait::async_trait;
use deadpool_redis::{Config, Pool, Runtime};
use redis::AsyncCommands;

use crate::error::{QueueError, Result};
use crate::message::QueueMessage;
use crate::transport::{QueueTransport, DEFAULT_QUEUE};

/// A queue transport backed by a Redis-compatible sorted-set broker. The
/// priority queue is a ZSET whose score is the negated
/// [`QueueMessage::sort_key`] (priority is encoded as the negated numeric
/// score) so `ZPOPMIN` returns
/// the highest-priority, oldest message first; message bodies live in a
/// companion HASH so the ZSET itself stays small.
pub struct RedisQueue {
    pool: Pool,
}

impl RedisQueue {
    /// Builds a connection pool against `redis_url` (e.g.
    /// `redis://127.0.0.1:6379`).
    pub fn connect(redis_url: &str) -> Result<Self> {
        let cfg = Config::from_url(redis_url);
        let pool = cfg
            .create_pool(Some(Runtime::Tokio1))
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Self { pool })
    }

    fn pending_key(queue: &str) -> String {
        format!("autoflow:queue:{queue}:pending")
    }

    fn bodies_key(queue: &str) -> String {
        format!("autoflow:queue:{queue}:bodies")
    }

    fn processing_key(queue: &str) -> String {
        format!("autoflow:queue:{queue}:processing")
    }

    fn dead_letter_key(queue: &str) -> String {
        format!("autoflow:queue:{queue}:dead_letter")
    }

    fn score_of(message: &QueueMessage) -> f64 {
        let (priority_rank, timestamp) = message.sort_key();
        // Negate so ZPOPMIN (ascending) yields highest priority, earliest
        // timestamp first.
        -((priority_rank as f64) * 1e15 - (timestamp as f64))
    }

    async fn conn(&self) -> Result<deadpool_redis::Connection> {
        self.pool
            .get()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }
}

#[async_trait]
impl QueueTransport for RedisQueue {
    async fn publish(&self, message: QueueMessage, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;
        let score = Self::score_of(&message);
        let body = serde_json::to_string(&message)?;

        let _: () = conn
            .hset(Self::bodies_key(queue), &message.id, &body)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let _: () = conn
            .zadd(Self::pending_key(queue), &message.id, score)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self, queue: Option<&str>, batch_size: usize) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;

        let popped: Vec<(String, f64)> = conn
            .zpopmin(Self::pending_key(queue), batch_size as isize)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let mut delivered = Vec::with_capacity(popped.len() / 2);
        for (id, _score) in popped {
            let body: Option<String> = conn
                .hget(Self::bodies_key(queue), &id)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            let Some(body) = body else { continue };
            let mut message: QueueMessage = serde_json::from_str(&body)?;
            message.status = crate::message::MessageStatus::Processing;
            message.attempts += 1;

            let body = serde_json::to_string(&message)?;
            let _: () = conn
                .hset(Self::bodies_key(queue), &id, &body)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            let _: () = conn
                .hset(Self::processing_key(queue), &id, &body)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            delivered.push(message);
        }
        Ok(delivered)
    }

    async fn ack(&self, queue: Option<&str>, id: &str) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;
        let _: () = conn
            .hdel(Self::processing_key(queue), id)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let _: () = conn
            .hdel(Self::bodies_key(queue), id)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn nack(&self, queue: Option<&str>, id: &str, requeue: bool) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;

        let body: Option<String> = conn
            .hget(Self::processing_key(queue), id)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let Some(body) = body else {
            return Err(QueueError::NotFound(id.to_string()));
        };
        let mut message: QueueMessage = serde_json::from_str(&body)?;
        let _: () = conn
            .hdel(Self::processing_key(queue), id)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        if requeue && message.attempts < message.max_attempts {
            message.status = crate::message::MessageStatus::Pending;
            let score = Self::score_of(&message);
            let body = serde_json::to_string(&message)?;
            let _: () = conn
                .hset(Self::bodies_key(queue), id, &body)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            let _: () = conn
                .zadd(Self::pending_key(queue), id, score)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
        } else {
            message.status = crate::message::MessageStatus::DeadLetter;
            let body = serde_json::to_string(&message)?;
            let _: () = conn
                .rpush(Self::dead_letter_key(queue), &body)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            let _: () = conn
                .hdel(Self::bodies_key(queue), id)
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
        }
        Ok(())
    }

    async fn length(&self, queue: Option<&str>) -> Result<usize> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;
        let pending: usize = conn
            .zcard(Self::pending_key(queue))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let processing: usize = conn
            .hlen(Self::processing_key(queue))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(pending + processing)
    }

    async fn purge(&self, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;
        let _: () = conn
            .del(Self::pending_key(queue))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let _: () = conn
            .del(Self::bodies_key(queue))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        let _: () = conn
            .del(Self::processing_key(queue))
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn peek_dead_letter(&self, queue: Option<&str>) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let mut conn = self.conn().await?;
        let raw: Vec<String> = conn
            .lrange(Self::dead_letter_key(queue), 0, -1)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        raw.iter()
            .map(|body| serde_json::from_str(body).map_err(QueueError::from))
            .collect()
    }

    async fn stop(&self) {
        // Connections are returned to the pool per call; nothing to tear
        // down eagerly. The pool itself is dropped with `Self`.
    }
}
