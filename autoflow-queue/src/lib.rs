//! ABOUTME: Queue workers — a uniform `QueueTransport` interface over four
//! ABOUTME: transports (in-memory, Redis-style broker, AMQP, file-backed) plus the manager
//! ABOUTME: that feeds delivered messages into the engine as run requests

pub mod amqp_broker;
pub mod error;
pub mod factory;
pub mod file_broker;
pub mod manager;
pub mod memory;
pub mod message;
pub mod redis_broker;
pub mod transport;

pub use amqp_broker::AmqpQueue;
pub use error::{QueueError, Result};
pub use factory::build_transport;
pub use file_broker::FileQueue;
pub use manager::{WorkflowLookup, WorkflowQueueManager};
pub use memory::InMemoryQueue;
pub use message::{MessageStatus, Priority, QueueMessage};
pub use redis_broker::RedisQueue;
pub use transport::{run_consumer, MessageHandler, QueueTransport, DEFAULT_QUEUE};
