//! ABOUTME: The uniform queue interface implemented by every transport,
//! ABOUTME: plus a shared `run_consumer` loop that turns any transport into at-least-once delivery

use crate::error::Result;
use crate::message::QueueMessage;
use async_trait::async_trait;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Default queue name used when a call omits one.
pub const DEFAULT_QUEUE: &str = "default";

/// A transport-agnostic priority queue of [`QueueMessage`]s. Every transport
/// (in-memory, Redis-style broker, AMQP, file-backed) implements this one
/// surface; priority/FIFO semantics are defined here, not by any transport's
/// native ordering quirks.
#[async_trait]
pub trait QueueTransport: Send + Sync {
    /// Enqueues `message` onto `queue` (or [`DEFAULT_QUEUE`]).
    async fn publish(&self, message: QueueMessage, queue: Option<&str>) -> Result<()>;

    /// Pulls up to `batch_size` pending messages, transitioning each to
    /// `processing` before returning. Higher priority first; FIFO within a
    /// priority.
    async fn receive(&self, queue: Option<&str>, batch_size: usize) -> Result<Vec<QueueMessage>>;

    /// Acknowledges successful processing of `id`; the message is marked
    /// `completed` and removed from outstanding tracking.
    async fn ack(&self, queue: Option<&str>, id: &str) -> Result<()>;

    /// Negative-acknowledges `id`. If `requeue` and `attempts < max_attempts`
    /// the message is re-published after the transport's retry delay;
    /// otherwise it is moved to the dead-letter queue if configured, or
    /// marked `failed` and discarded.
    async fn nack(&self, queue: Option<&str>, id: &str, requeue: bool) -> Result<()>;

    /// Number of messages currently pending or processing on `queue`.
    async fn length(&self, queue: Option<&str>) -> Result<usize>;

    /// Discards every message on `queue`.
    async fn purge(&self, queue: Option<&str>) -> Result<()>;

    /// Messages moved to the dead-letter queue for `queue`, newest last.
    /// Read-only; does not remove them — without this accessor a
    /// dead-lettered message is otherwise write-only.
    async fn peek_dead_letter(&self, queue: Option<&str>) -> Result<Vec<QueueMessage>>;

    /// Stops accepting new work; outstanding `receive` calls should return
    /// promptly once their current batch completes.
    async fn stop(&self);
}

/// A handler invoked once per delivered message. Returning `Err` triggers
/// `nack`; returning `Ok` triggers `ack`. Handlers must be idempotent since
/// delivery is at-least-once.
#[async_trait]
pub trait MessageHandler: Send + Sync {
    async fn handle(&self, message: &QueueMessage) -> Result<()>;
}

/// Runs a pull loop against `transport`: `consume(handler, queue, batch_size)`
/// Pulls a batch, dispatches every message to `handler`
/// concurrently, and `ack`/`nack`s based on the outcome, until `cancellation`
/// fires or `transport.stop()` is observed.
///
/// # Testable property
/// For every message processed, exactly one of `ack`/`nack` is called
pub async fn run_consumer(
    transport: Arc<dyn QueueTransport>,
    handler: Arc<dyn MessageHandler>,
    queue: Option<String>,
    batch_size: usize,
    poll_interval: Duration,
    cancellation: CancellationToken,
) {
    loop {
        if cancellation.is_cancelled() {
            return;
        }

        let batch = tokio::select! {
            () = cancellation.cancelled() => return,
            result = transport.receive(queue.as_deref(), batch_size) => match result {
                Ok(batch) => batch,
                Err(err) => {
                    tracing::warn!(error = %err, "queue receive failed");
                    Vec::new()
                }
            },
        };

        if batch.is_empty() {
            tokio::select! {
                () = cancellation.cancelled() => return,
                () = tokio::time::sleep(poll_interval) => {}
            }
            continue;
        }

        let mut joins = Vec::with_capacity(batch.len());
        for message in batch {
            let transport = Arc::clone(&transport);
            let handler = Arc::clone(&handler);
            let queue = queue.clone();
            joins.push(tokio::spawn(async move {
                let outcome = handler.handle(&message).await;
                match outcome {
                    Ok(()) => {
                        if let Err(err) = transport.ack(queue.as_deref(), &message.id).await {
                            tracing::warn!(error = %err, message_id = %message.id, "ack failed");
                        }
                    }
                    Err(err) => {
                        tracing::warn!(error = %err, message_id = %message.id, "handler failed, nacking");
                        if let Err(err) = transport.nack(queue.as_deref(), &message.id, true).await {
                            tracing::warn!(error = %err, message_id = %message.id, "nack failed");
                        }
                    }
                }
            }));
        }
        for join in joins {
            let _ = join.await;
        }
    }
}
