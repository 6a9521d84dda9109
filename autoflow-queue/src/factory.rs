//! ABOUTME: Builds a `QueueTransport` from `autoflow_engine::config::QueueConfig` — the seam
//! ABOUTME: between the layered engine configuration and the four transports in this crate

use std::sync::Arc;
use std::time::Duration;

use autoflow_engine::config::{QueueConfig, QueueTransportKind};

use crate::amqp_broker::AmqpQueue;
use crate::error::{QueueError, Result};
use crate::file_broker::FileQueue;
use crate::memory::InMemoryQueue;
use crate::redis_broker::RedisQueue;
use crate::transport::QueueTransport;

/// Constructs the transport named by `config.transport`, wiring its
/// retry delay from `config.retry_delay_ms` where the transport supports
/// one client-side (the in-memory transport; AMQP/Redis redeliver through
/// the broker's own mechanisms).
pub async fn build_transport(config: &QueueConfig) -> Result<Arc<dyn QueueTransport>> {
    match config.transport {
        QueueTransportKind::Memory => Ok(Arc::new(
            InMemoryQueue::new().with_retry_delay(Duration::from_millis(config.retry_delay_ms)),
        )),
        QueueTransportKind::Redis => {
            let url = config
                .redis_url
                .as_deref()
                .ok_or_else(|| QueueError::Transport("queue.redis_url is required for the redis transport".to_string()))?;
            Ok(Arc::new(RedisQueue::connect(url)?))
        }
        QueueTransportKind::Amqp => {
            let url = config
                .amqp_url
                .as_deref()
                .ok_or_else(|| QueueError::Transport("queue.amqp_url is required for the amqp transport".to_string()))?;
            Ok(Arc::new(AmqpQueue::connect(url).await?))
        }
        QueueTransportKind::File => {
            let dir = config.file_broker_dir.as_deref().ok_or_else(|| {
                QueueError::Transport("queue.file_broker_dir is required for the file transport".to_string())
            })?;
            Ok(Arc::new(FileQueue::new(dir)?))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn defaults_to_in_memory() {
        let config = QueueConfig::default();
        let transport = build_transport(&config).await.unwrap();
        assert_eq!(transport.length(None).await.unwrap(), 0);
    }

    #[tokio::test]
    async fn redis_without_url_is_an_error() {
        let config = QueueConfig {
            transport: QueueTransportKind::Redis,
            ..Default::default()
        };
        assert!(build_transport(&config).await.is_err());
    }
}
