//! ABOUTME: The executor contract — the uniform call surface the engine uses to
//! ABOUTME: invoke external actions, plus the cost-tracker handle threaded through it

use autoflow_core::{Error, Value};
use std::collections::HashMap;
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;

/// Token usage reported by an executor that invoked a language model,
/// passed to the injected [`CostRecorder`] before the action call returns.
#[derive(Debug, Clone)]
pub struct TokenUsageReport {
    pub agent_name: String,
    pub model_name: String,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub cached_tokens: u64,
    pub reasoning_tokens: u64,
    pub metadata: Option<serde_json::Value>,
}

impl TokenUsageReport {
    #[must_use]
    pub fn new(agent_name: impl Into<String>, model_name: impl Into<String>) -> Self {
        Self {
            agent_name: agent_name.into(),
            model_name: model_name.into(),
            input_tokens: 0,
            output_tokens: 0,
            cached_tokens: 0,
            reasoning_tokens: 0,
            metadata: None,
        }
    }

    #[must_use]
    pub const fn with_tokens(mut self, input: u64, output: u64) -> Self {
        self.input_tokens = input;
        self.output_tokens = output;
        self
    }
}

/// Injected cost-tracking service, reached through a trait object so
/// the engine never depends on the concrete tracker crate — tests
/// substitute a fake, per `SPEC_FULL.md`'s design notes on the source's
/// singleton module.
#[async_trait::async_trait]
pub trait CostRecorder: Send + Sync {
    async fn record(
        &self,
        workflow_id: &str,
        run_id: &str,
        step_name: Option<&str>,
        usage: TokenUsageReport,
    ) -> Result<(), Error>;

    /// Whether a call estimated to cost `estimated_cost` is currently
    /// affordable under every configured budget limit. A `CostRecorder`
    /// that does no budgeting may always return `true`.
    async fn can_afford(&self, estimated_cost: f64) -> bool {
        let _ = estimated_cost;
        true
    }
}

/// A `CostRecorder` that performs no accounting. Used as the default when
/// a workflow run is constructed without an explicit tracker.
#[derive(Debug, Default, Clone, Copy)]
pub struct NullCostRecorder;

#[async_trait::async_trait]
impl CostRecorder for NullCostRecorder {
    async fn record(
        &self,
        _workflow_id: &str,
        _run_id: &str,
        _step_name: Option<&str>,
        _usage: TokenUsageReport,
    ) -> Result<(), Error> {
        Ok(())
    }
}

/// Read-only per-call context passed to every executor invocation.
#[derive(Clone)]
pub struct ExecutionContext {
    pub workflow_id: String,
    pub run_id: String,
    pub step_id: String,
    pub cancellation: CancellationToken,
    pub timeout: Option<Duration>,
    pub cost_recorder: Arc<dyn CostRecorder>,
}

impl ExecutionContext {
    #[must_use]
    pub fn new(workflow_id: impl Into<String>, run_id: impl Into<String>) -> Self {
        Self {
            workflow_id: workflow_id.into(),
            run_id: run_id.into(),
            step_id: String::new(),
            cancellation: CancellationToken::new(),
            timeout: None,
            cost_recorder: Arc::new(NullCostRecorder),
        }
    }

    #[must_use]
    pub fn for_step(&self, step_id: impl Into<String>, timeout: Option<Duration>) -> Self {
        Self {
            workflow_id: self.workflow_id.clone(),
            run_id: self.run_id.clone(),
            step_id: step_id.into(),
            cancellation: self.cancellation.child_token(),
            timeout,
            cost_recorder: Arc::clone(&self.cost_recorder),
        }
    }
}

/// What an adapter advertises about itself -> {tool_name, operations}`).
#[derive(Debug, Clone)]
pub struct AdapterDescription {
    pub tool_name: String,
    pub operations: Vec<String>,
}

/// The uniform call surface the engine uses to invoke an external action.
/// Implementations must be reentrant: the engine may call `execute`
/// concurrently from multiple `parallel` branches on the same adapter
/// instance.
#[async_trait::async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        action: &str,
        inputs: Value,
        context: &ExecutionContext,
    ) -> Result<Value, Error>;

    fn describe(&self) -> AdapterDescription;

    /// Optional liveness probe. Default assumes healthy; adapters that
    /// wrap a remote dependency should override this.
    async fn health_check(&self) -> bool {
        true
    }
}

/// Registry of adapters keyed by tool name, resolving `"<tool>.<op>"`
/// action strings to the adapter that owns `<tool>`.
#[derive(Default, Clone)]
pub struct ExecutorRegistry {
    adapters: HashMap<String, Arc<dyn Executor>>,
}

impl ExecutorRegistry {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&mut self, tool_name: impl Into<String>, executor: Arc<dyn Executor>) {
        self.adapters.insert(tool_name.into(), executor);
    }

    /// Splits `action` at its first `.` to find the owning tool
    /// (action lookup is by `"<tool>.<op>"` prefix).
    #[must_use]
    pub fn resolve(&self, action: &str) -> Option<Arc<dyn Executor>> {
        let tool_name = action.split('.').next()?;
        self.adapters.get(tool_name).cloned()
    }

    pub async fn execute(
        &self,
        action: &str,
        inputs: Value,
        context: &ExecutionContext,
    ) -> Result<Value, Error> {
        let executor = self.resolve(action).ok_or_else(|| Error::Executor {
            action: action.to_string(),
            kind: autoflow_core::ExecutorErrorKind::Permanent,
            message: format!("no adapter registered for action '{action}'"),
        })?;
        executor.execute(action, inputs, context).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct EchoExecutor;

    #[async_trait::async_trait]
    impl Executor for EchoExecutor {
        async fn execute(
            &self,
            _action: &str,
            inputs: Value,
            _context: &ExecutionContext,
        ) -> Result<Value, Error> {
            Ok(inputs)
        }

        fn describe(&self) -> AdapterDescription {
            AdapterDescription {
                tool_name: "echo".to_string(),
                operations: vec!["say".to_string()],
            }
        }
    }

    #[tokio::test]
    async fn registry_resolves_by_tool_prefix() {
        let mut registry = ExecutorRegistry::new();
        registry.register("echo", Arc::new(EchoExecutor));
        let ctx = ExecutionContext::new("wf", "run");
        let out = registry
            .execute("echo.say", Value::string("hi"), &ctx)
            .await
            .unwrap();
        assert_eq!(out, Value::string("hi"));
    }

    #[tokio::test]
    async fn unregistered_tool_is_permanent_executor_error() {
        let registry = ExecutorRegistry::new();
        let ctx = ExecutionContext::new("wf", "run");
        let err = registry
            .execute("slack.post", Value::Null, &ctx)
            .await
            .unwrap_err();
        assert!(matches!(
            err,
            Error::Executor {
                kind: autoflow_core::ExecutorErrorKind::Permanent,
                ..
            }
        ));
    }
}
