//! ABOUTME: Crate-local error taxonomy for queue transports, converted into
//! ABOUTME: `autoflow_core::Error` only where the engine boundary requires it

use thiserror::Error;

#[derive(Debug, Error)]
pub enum QueueError {
    #[error("no message with id '{0}' is outstanding on this queue")]
    NotFound(String),

    #[error("queue '{0}' does not exist")]
    UnknownQueue(String),

    #[error("queue transport error: {0}")]
    Transport(String),

    #[error("failed to (de)serialise queue message: {0}")]
    Serialization(String),

    #[error("queue has been stopped")]
    Stopped,
}

impl From<serde_json::Error> for QueueError {
    fn from(e: serde_json::Error) -> Self {
        Self::Serialization(e.to_string())
    }
}

impl From<QueueError> for autoflow_core::Error {
    fn from(e: QueueError) -> Self {
        Self::Internal {
            message: e.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, QueueError>;
