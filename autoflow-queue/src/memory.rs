//! ABOUTME: In-memory queue transport — one priority-ordered Vec per named queue,
//! ABOUTME: keyed in a `DashMap` so independent queues never contend on a shared lock

use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use dashmap::DashMap;
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::message::{MessageStatus, QueueMessage};
use crate::transport::{QueueTransport, DEFAULT_QUEUE};

/// Per-queue state: the pending list (kept sorted by
/// [`QueueMessage::sort_key`] via linear-scan insertion), the in-flight
/// `processing` set, and the dead-letter list.
#[derive(Default)]
struct QueueState {
    pending: Vec<QueueMessage>,
    processing: HashMap<String, QueueMessage>,
    dead_letter: Vec<QueueMessage>,
}

impl QueueState {
    fn insert_sorted(&mut self, message: QueueMessage) {
        let key = message.sort_key();
        let pos = self
            .pending
            .iter()
            .position(|existing| existing.sort_key() > key)
            .unwrap_or(self.pending.len());
        self.pending.insert(pos, message);
    }
}

/// In-memory, single-process queue transport. State lives in a `DashMap`
/// keyed by queue name so distinct queues don't contend on the same lock.
pub struct InMemoryQueue {
    queues: Arc<DashMap<String, Mutex<QueueState>>>,
    retry_delay: Duration,
    dead_letter_enabled: bool,
    stopped: Arc<std::sync::atomic::AtomicBool>,
}

impl Default for InMemoryQueue {
    fn default() -> Self {
        Self::new()
    }
}

impl InMemoryQueue {
    #[must_use]
    pub fn new() -> Self {
        Self {
            queues: Arc::new(DashMap::new()),
            retry_delay: Duration::from_millis(0),
            dead_letter_enabled: true,
            stopped: Arc::new(std::sync::atomic::AtomicBool::new(false)),
        }
    }

    #[must_use]
    pub const fn with_retry_delay(mut self, delay: Duration) -> Self {
        self.retry_delay = delay;
        self
    }

    #[must_use]
    pub const fn with_dead_letter_enabled(mut self, enabled: bool) -> Self {
        self.dead_letter_enabled = enabled;
        self
    }

    fn queue_name(queue: Option<&str>) -> String {
        queue.unwrap_or(DEFAULT_QUEUE).to_string()
    }
}

#[async_trait]
impl QueueTransport for InMemoryQueue {
    async fn publish(&self, message: QueueMessage, queue: Option<&str>) -> Result<()> {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Err(QueueError::Stopped);
        }
        let name = Self::queue_name(queue);
        let mut state = self.queues.entry(name).or_default();
        state.insert_sorted(message);
        Ok(())
    }

    async fn receive(&self, queue: Option<&str>, batch_size: usize) -> Result<Vec<QueueMessage>> {
        if self.stopped.load(std::sync::atomic::Ordering::Acquire) {
            return Ok(Vec::new());
        }
        let name = Self::queue_name(queue);
        let mut state = self.queues.entry(name).or_default();

        let take = batch_size.min(state.pending.len());
        let mut delivered = Vec::with_capacity(take);
        for mut message in state.pending.drain(..take).collect::<Vec<_>>() {
            message.status = MessageStatus::Processing;
            message.attempts += 1;
            state.processing.insert(message.id.clone(), message.clone());
            delivered.push(message);
        }
        Ok(delivered)
    }

    async fn ack(&self, queue: Option<&str>, id: &str) -> Result<()> {
        let name = Self::queue_name(queue);
        let mut state = self.queues.entry(name).or_default();
        state
            .processing
            .remove(id)
            .map(|_| ())
            .ok_or_else(|| QueueError::NotFound(id.to_string()))
    }

    async fn nack(&self, queue: Option<&str>, id: &str, requeue: bool) -> Result<()> {
        let name = Self::queue_name(queue);
        let mut message = {
            let mut state = self.queues.entry(name.clone()).or_default();
            state
                .processing
                .remove(id)
                .ok_or_else(|| QueueError::NotFound(id.to_string()))?
        };

        if requeue && message.attempts < message.max_attempts {
            message.status = MessageStatus::Pending;
            let delay = self.retry_delay;
            if delay > Duration::ZERO {
                // Cooperative retry delay: no lock is held across the sleep
                // so other callers aren't blocked on this queue.
                tokio::time::sleep(delay).await;
            }
            let mut state = self.queues.entry(name).or_default();
            state.insert_sorted(message);
        } else if self.dead_letter_enabled {
            message.status = MessageStatus::DeadLetter;
            let mut state = self.queues.entry(name).or_default();
            state.dead_letter.push(message);
        } else {
            message.status = MessageStatus::Failed;
        }
        Ok(())
    }

    async fn length(&self, queue: Option<&str>) -> Result<usize> {
        let name = Self::queue_name(queue);
        let state = self.queues.entry(name).or_default();
        Ok(state.pending.len() + state.processing.len())
    }

    async fn purge(&self, queue: Option<&str>) -> Result<()> {
        let name = Self::queue_name(queue);
        let mut state = self.queues.entry(name).or_default();
        state.pending.clear();
        state.processing.clear();
        Ok(())
    }

    async fn peek_dead_letter(&self, queue: Option<&str>) -> Result<Vec<QueueMessage>> {
        let name = Self::queue_name(queue);
        let state = self.queues.entry(name).or_default();
        Ok(state.dead_letter.clone())
    }

    async fn stop(&self) {
        self.stopped
            .store(true, std::sync::atomic::Ordering::Release);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::Priority;
    use serde_json::json;

    #[tokio::test]
    async fn higher_priority_is_delivered_first() {
        let queue = InMemoryQueue::new();
        queue
            .publish(
                QueueMessage::new("wf", json!({})).with_priority(Priority::Low),
                None,
            )
            .await
            .unwrap();
        queue
            .publish(
                QueueMessage::new("wf", json!({})).with_priority(Priority::Critical),
                None,
            )
            .await
            .unwrap();

        let batch = queue.receive(None, 10).await.unwrap();
        assert_eq!(batch[0].priority, Priority::Critical);
        assert_eq!(batch[1].priority, Priority::Low);
    }

    #[tokio::test]
    async fn same_priority_is_fifo() {
        let queue = InMemoryQueue::new();
        for i in 0..3 {
            queue
                .publish(QueueMessage::new("wf", json!({ "i": i })), None)
                .await
                .unwrap();
        }
        let batch = queue.receive(None, 10).await.unwrap();
        let order: Vec<_> = batch.iter().map(|m| m.payload["i"].as_i64()).collect();
        assert_eq!(order, vec![Some(0), Some(1), Some(2)]);
    }

    #[tokio::test]
    async fn nack_without_requeue_moves_to_dead_letter() {
        let queue = InMemoryQueue::new();
        let message = QueueMessage::new("wf", json!({})).with_max_attempts(1);
        let id = message.id.clone();
        queue.publish(message, None).await.unwrap();
        queue.receive(None, 1).await.unwrap();
        queue.nack(None, &id, true).await.unwrap();

        assert_eq!(queue.length(None).await.unwrap(), 0);
        let dead = queue.peek_dead_letter(None).await.unwrap();
        assert_eq!(dead.len(), 1);
        assert_eq!(dead[0].id, id);
    }

    #[tokio::test]
    async fn nack_with_remaining_attempts_requeues() {
        let queue = InMemoryQueue::new();
        let message = QueueMessage::new("wf", json!({})).with_max_attempts(3);
        let id = message.id.clone();
        queue.publish(message, None).await.unwrap();
        queue.receive(None, 1).await.unwrap();
        queue.nack(None, &id, true).await.unwrap();

        assert_eq!(queue.length(None).await.unwrap(), 1);
        let batch = queue.receive(None, 1).await.unwrap();
        assert_eq!(batch[0].attempts, 2);
    }

    #[tokio::test]
    async fn ack_unknown_id_is_not_found() {
        let queue = InMemoryQueue::new();
        let err = queue.ack(None, "missing").await.unwrap_err();
        assert!(matches!(err, QueueError::NotFound(_)));
    }
}
