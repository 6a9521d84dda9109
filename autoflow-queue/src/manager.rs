//! ABOUTME: `WorkflowQueueManager` — binds a `MessageHandler` that interprets each queue
//! ABOUTME: message as a run request and invokes the engine

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use autoflow_core::Error;
use autoflow_engine::engine::Engine;
use autoflow_engine::model::Workflow;
use indexmap::IndexMap;
use tokio_util::sync::CancellationToken;

use crate::error::{QueueError, Result as QueueResult};
use crate::message::QueueMessage;
use crate::transport::{run_consumer, MessageHandler, QueueTransport};

/// Resolves `message.workflow_id` to a parsed [`Workflow`] before handing
/// it to the engine. A thin seam so the manager doesn't hard-depend on any
/// one workflow source (static map, `autoflow-document` loader, ...).
#[async_trait]
pub trait WorkflowLookup: Send + Sync {
    async fn lookup(&self, workflow_id: &str) -> Result<Workflow, Error>;
}

/// Interprets each delivered [`QueueMessage`] as `{workflow_id, payload}`
/// and runs it against `engine`. A handler error (lookup failure or a
/// `failed`/`cancelled` `WorkflowRun`) is the `nack` trigger the queue
/// transport's retry policy acts on.
pub struct WorkflowQueueManager<L: WorkflowLookup> {
    engine: Engine,
    lookup: L,
}

impl<L: WorkflowLookup> WorkflowQueueManager<L> {
    pub const fn new(engine: Engine, lookup: L) -> Self {
        Self { engine, lookup }
    }

    /// Drives `transport`'s consume loop until `cancellation` fires.
    pub async fn run(
        self: Arc<Self>,
        transport: Arc<dyn QueueTransport>,
        queue: Option<String>,
        batch_size: usize,
        poll_interval: Duration,
        cancellation: CancellationToken,
    ) where
        L: 'static,
    {
        run_consumer(transport, self, queue, batch_size, poll_interval, cancellation).await;
    }
}

#[async_trait]
impl<L: WorkflowLookup> MessageHandler for WorkflowQueueManager<L> {
    async fn handle(&self, message: &QueueMessage) -> QueueResult<()> {
        let workflow = self
            .lookup
            .lookup(&message.workflow_id)
            .await
            .map_err(|e| QueueError::Transport(e.to_string()))?;

        let inputs: IndexMap<String, serde_json::Value> = match &message.payload {
            serde_json::Value::Object(map) => map.iter().map(|(k, v)| (k.clone(), v.clone())).collect(),
            serde_json::Value::Null => IndexMap::new(),
            other => {
                return Err(QueueError::Serialization(format!(
                    "queue message payload must be a JSON object, got {other}"
                )))
            }
        };

        let run = self.engine.execute(&workflow, inputs).await;
        match run.status {
            autoflow_engine::model::WorkflowStatus::Completed => Ok(()),
            autoflow_engine::model::WorkflowStatus::Running => Err(QueueError::Transport(
                "workflow run did not reach a terminal status".to_string(),
            )),
            autoflow_engine::model::WorkflowStatus::Failed
            | autoflow_engine::model::WorkflowStatus::Cancelled => {
                let detail = run
                    .error
                    .map(|e| e.message)
                    .unwrap_or_else(|| "workflow run failed".to_string());
                Err(QueueError::Transport(detail))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::InMemoryQueue;
    use autoflow_engine::engine::StaticWorkflowResolver;
    use autoflow_engine::executor::ExecutorRegistry;
    use serde_json::json;
    use std::collections::HashMap;

    struct StaticLookup(HashMap<String, Workflow>);

    #[async_trait]
    impl WorkflowLookup for StaticLookup {
        async fn lookup(&self, workflow_id: &str) -> Result<Workflow, Error> {
            self.0
                .get(workflow_id)
                .cloned()
                .ok_or_else(|| Error::invalid_schema(format!("unknown workflow '{workflow_id}'")))
        }
    }

    fn minimal_workflow() -> Workflow {
        let text = "---\nworkflow:\n  id: demo\n  name: Demo\nsteps:\n  - id: s1\n    type: action\n    action: core.set\n    inputs:\n      done: \"true\"\n---\n";
        autoflow_document::parse_str(text).unwrap().workflow
    }

    #[tokio::test]
    async fn processes_one_message_end_to_end() {
        let workflow = minimal_workflow();
        let mut workflows = HashMap::new();
        workflows.insert("demo".to_string(), workflow);

        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let manager = Arc::new(WorkflowQueueManager::new(engine, StaticLookup(workflows)));

        let message = QueueMessage::new("demo", json!({}));
        manager.handle(&message).await.unwrap();
    }

    #[tokio::test]
    async fn unknown_workflow_id_nacks() {
        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let manager = WorkflowQueueManager::new(engine, StaticLookup(HashMap::new()));
        let message = QueueMessage::new("missing", json!({}));
        assert!(manager.handle(&message).await.is_err());
    }

    #[tokio::test]
    async fn run_consumer_drains_in_memory_queue() {
        let workflow = minimal_workflow();
        let mut workflows = HashMap::new();
        workflows.insert("demo".to_string(), workflow);

        let engine = Engine::new(ExecutorRegistry::new(), Arc::new(StaticWorkflowResolver::new()));
        let manager = Arc::new(WorkflowQueueManager::new(engine, StaticLookup(workflows)));
        let transport: Arc<dyn QueueTransport> = Arc::new(InMemoryQueue::new());
        transport
            .publish(QueueMessage::new("demo", json!({})), None)
            .await
            .unwrap();

        let cancellation = CancellationToken::new();
        let token = cancellation.clone();
        let handle = tokio::spawn({
            let transport = Arc::clone(&transport);
            async move {
                manager
                    .run(transport, None, 4, Duration::from_millis(10), token)
                    .await;
            }
        });

        tokio::time::sleep(Duration::from_millis(50)).await;
        cancellation.cancel();
        handle.await.unwrap();

        assert_eq!(transport.length(None).await.unwrap(), 0);
    }
}
