//! ABOUTME: `QueueMessage` envelope and priority/status enums, plus the wire shape
//! ABOUTME: used by external brokers

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Delivery priority. Higher variants are delivered before lower ones;
/// within a priority, delivery is FIFO.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Priority {
    Low,
    Normal,
    High,
    Critical,
}

impl Priority {
    /// Numeric rank used by transports that encode priority as a sortable
    /// score (e.g. a Redis sorted set's negated score).
    #[must_use]
    pub const fn rank(self) -> i64 {
        match self {
            Self::Low => 0,
            Self::Normal => 1,
            Self::High => 2,
            Self::Critical => 3,
        }
    }
}

impl Default for Priority {
    fn default() -> Self {
        Self::Normal
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MessageStatus {
    Pending,
    Processing,
    Completed,
    Failed,
    DeadLetter,
}

/// A single queued run request, or any other payload a transport carries.
/// `payload` and `metadata` are opaque to the queue layer; only the
/// [`WorkflowQueueManager`](crate::manager::WorkflowQueueManager) interprets
/// `payload` as `{workflow_id, inputs}`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct QueueMessage {
    pub id: String,
    pub workflow_id: String,
    pub payload: serde_json::Value,
    #[serde(default)]
    pub priority: Priority,
    pub status: MessageStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub attempts: u32,
    pub max_attempts: u32,
    #[serde(default)]
    pub error: Option<String>,
    #[serde(default)]
    pub metadata: HashMap<String, serde_json::Value>,
}

impl QueueMessage {
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, payload: serde_json::Value) -> Self {
        Self {
            id: uuid::Uuid::new_v4().to_string(),
            workflow_id: workflow_id.into(),
            payload,
            priority: Priority::default(),
            status: MessageStatus::Pending,
            created_at: chrono::Utc::now(),
            attempts: 0,
            max_attempts: 3,
            error: None,
            metadata: HashMap::new(),
        }
    }

    #[must_use]
    pub const fn with_priority(mut self, priority: Priority) -> Self {
        self.priority = priority;
        self
    }

    #[must_use]
    pub const fn with_max_attempts(mut self, max_attempts: u32) -> Self {
        self.max_attempts = max_attempts;
        self
    }

    /// Score a sorted-set broker can order on: higher priority and earlier
    /// `created_at` must pop first, so this is negated before use with a
    /// `ZPOPMIN`-style primitive (priority is encoded as the negated numeric
    /// score).
    #[must_use]
    pub fn sort_key(&self) -> (i64, i64) {
        (-self.priority.rank(), self.created_at.timestamp_millis())
    }
}
