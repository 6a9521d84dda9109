//! ABOUTME: External AMQP broker transport — one RabbitMQ priority queue
//! ABOUTME: per named queue, using the `x-max-priority` extension instead of multiple queues

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use lapin::acker::Acker;
use lapin::options::{
    BasicAckOptions, BasicGetOptions, BasicNackOptions, BasicPublishOptions, QueueDeclareOptions,
    QueuePurgeOptions,
};
use lapin::types::FieldTable;
use lapin::{BasicProperties, Connection, ConnectionProperties};
use parking_lot::Mutex;

use crate::error::{QueueError, Result};
use crate::message::{MessageStatus, QueueMessage};
use crate::transport::{QueueTransport, DEFAULT_QUEUE};

const MAX_PRIORITY: u8 = 3;

/// A queue transport backed by a RabbitMQ-compatible AMQP broker. Priority
/// is native: each declared queue carries `x-max-priority`, and messages
/// publish with their [`Priority::rank`](crate::message::Priority::rank) as
/// the AMQP basic-properties priority, so the broker itself orders
/// deliveries — no client-side scan is needed.
pub struct AmqpQueue {
    connection: Connection,
    // `basic_get` acks/nacks require the `Acker` captured at delivery time;
    // the broker gives us no other handle back by message id. The decoded
    // message travels alongside it so a non-requeued `nack` can still
    // record the full payload in `dead_letter`.
    outstanding: Arc<Mutex<HashMap<String, (Acker, QueueMessage)>>>,
    dead_letter: Arc<Mutex<HashMap<String, Vec<QueueMessage>>>>,
}

impl AmqpQueue {
    pub async fn connect(amqp_url: &str) -> Result<Self> {
        let connection = Connection::connect(amqp_url, ConnectionProperties::default())
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(Self {
            connection,
            outstanding: Arc::new(Mutex::new(HashMap::new())),
            dead_letter: Arc::new(Mutex::new(HashMap::new())),
        })
    }

    async fn declare(&self, queue: &str) -> Result<lapin::Channel> {
        let channel = self
            .connection
            .create_channel()
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let mut args = FieldTable::default();
        args.insert(
            "x-max-priority".into(),
            lapin::types::AMQPValue::ShortShortUInt(MAX_PRIORITY),
        );

        channel
            .queue_declare(queue, QueueDeclareOptions::default(), args)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(channel)
    }
}

#[async_trait]
impl QueueTransport for AmqpQueue {
    async fn publish(&self, message: QueueMessage, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let channel = self.declare(queue).await?;
        let body = serde_json::to_vec(&message)?;
        let properties = BasicProperties::default()
            .with_priority(message.priority.rank() as u8)
            .with_message_id(message.id.clone().into());

        channel
            .basic_publish(
                "",
                queue,
                BasicPublishOptions::default(),
                &body,
                properties,
            )
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(())
    }

    async fn receive(&self, queue: Option<&str>, batch_size: usize) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let channel = self.declare(queue).await?;
        let mut delivered = Vec::with_capacity(batch_size);

        for _ in 0..batch_size {
            let get = channel
                .basic_get(queue, BasicGetOptions { no_ack: false })
                .await
                .map_err(|e| QueueError::Transport(e.to_string()))?;
            let Some(delivery) = get else { break };

            let mut message: QueueMessage = serde_json::from_slice(&delivery.data)?;
            message.status = MessageStatus::Processing;
            message.attempts += 1;
            self.outstanding
                .lock()
                .insert(message.id.clone(), (delivery.acker.clone(), message.clone()));
            delivered.push(message);
        }
        Ok(delivered)
    }

    async fn ack(&self, _queue: Option<&str>, id: &str) -> Result<()> {
        let (acker, _message) = self
            .outstanding
            .lock()
            .remove(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;
        acker
            .ack(BasicAckOptions::default())
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))
    }

    async fn nack(&self, queue: Option<&str>, id: &str, requeue: bool) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let (acker, mut message) = self
            .outstanding
            .lock()
            .remove(id)
            .ok_or_else(|| QueueError::NotFound(id.to_string()))?;

        // `requeue` here follows the attempt budget already stamped on
        // `message` by `receive`: once exhausted, the broker must not
        // redeliver — the message is dead-lettered on our side instead,
        // mirroring the in-memory transport's dead-letter path.
        let should_requeue = requeue && message.attempts < message.max_attempts;
        acker
            .nack(BasicNackOptions {
                requeue: should_requeue,
                multiple: false,
            })
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        if !should_requeue {
            message.status = MessageStatus::DeadLetter;
            self.dead_letter
                .lock()
                .entry(queue.to_string())
                .or_default()
                .push(message);
        }
        Ok(())
    }

    async fn length(&self, queue: Option<&str>) -> Result<usize> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let channel = self.declare(queue).await?;
        let declared = channel
            .queue_declare(
                queue,
                QueueDeclareOptions {
                    passive: true,
                    ..Default::default()
                },
                FieldTable::default(),
            )
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        Ok(declared.message_count() as usize)
    }

    async fn purge(&self, queue: Option<&str>) -> Result<()> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        let channel = self.declare(queue).await?;
        channel
            .queue_purge(queue, QueuePurgeOptions::default())
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;
        self.dead_letter.lock().remove(queue);
        Ok(())
    }

    async fn peek_dead_letter(&self, queue: Option<&str>) -> Result<Vec<QueueMessage>> {
        let queue = queue.unwrap_or(DEFAULT_QUEUE);
        Ok(self
            .dead_letter
            .lock()
            .get(queue)
            .cloned()
            .unwrap_or_default())
    }

    async fn stop(&self) {
        let _ = self.connection.close(200, "shutdown").await;
    }
}
