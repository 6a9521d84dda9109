//! ABOUTME: Recording/fake implementations of the engine's injected traits
//! ABOUTME: (`Executor`, `CostRecorder`), shared by tests that need to assert on call history

use async_trait::async_trait;
use autoflow_core::{Error, Value};
use autoflow_engine::executor::{AdapterDescription, TokenUsageReport};
use autoflow_engine::{CostRecorder, ExecutionContext, Executor};
use parking_lot::Mutex;

/// An [`Executor`] that records every call it receives and returns a
/// caller-configured response (echoing its inputs by default), for tests
/// that need to assert which actions ran and in what order without
/// standing up a real adapter.
pub struct RecordingExecutor {
    tool_name: String,
    operations: Vec<String>,
    calls: Mutex<Vec<(String, Value)>>,
    response: Box<dyn Fn(&str, &Value) -> Result<Value, Error> + Send + Sync>,
}

impl RecordingExecutor {
    #[must_use]
    pub fn new(tool_name: impl Into<String>, operations: Vec<String>) -> Self {
        Self {
            tool_name: tool_name.into(),
            operations,
            calls: Mutex::new(Vec::new()),
            response: Box::new(|_, inputs| Ok(inputs.clone())),
        }
    }

    /// Overrides the default echo behaviour with a caller-supplied closure.
    #[must_use]
    pub fn with_response(mut self, response: impl Fn(&str, &Value) -> Result<Value, Error> + Send + Sync + 'static) -> Self {
        self.response = Box::new(response);
        self
    }

    /// Actions passed to `execute`, in call order.
    #[must_use]
    pub fn calls(&self) -> Vec<(String, Value)> {
        self.calls.lock().clone()
    }

    #[must_use]
    pub fn call_count(&self) -> usize {
        self.calls.lock().len()
    }
}

#[async_trait]
impl Executor for RecordingExecutor {
    async fn execute(&self, action: &str, inputs: Value, _context: &ExecutionContext) -> Result<Value, Error> {
        self.calls.lock().push((action.to_string(), inputs.clone()));
        (self.response)(action, &inputs)
    }

    fn describe(&self) -> AdapterDescription {
        AdapterDescription {
            tool_name: self.tool_name.clone(),
            operations: self.operations.clone(),
        }
    }
}

/// A [`CostRecorder`] that records every reported [`TokenUsageReport`]
/// instead of discarding it, and optionally refuses calls once a fixed
/// budget is exhausted — for tests exercising `can_afford` short-circuiting
/// without pulling in the full cost-tracker crate.
pub struct RecordingCostRecorder {
    records: Mutex<Vec<(String, String, Option<String>, TokenUsageReport)>>,
    affordable: Mutex<bool>,
}

impl Default for RecordingCostRecorder {
    fn default() -> Self {
        Self {
            records: Mutex::new(Vec::new()),
            affordable: Mutex::new(true),
        }
    }
}

impl RecordingCostRecorder {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Makes every subsequent `can_afford` call return `false`.
    pub fn exhaust_budget(&self) {
        *self.affordable.lock() = false;
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.lock().len()
    }
}

#[async_trait]
impl CostRecorder for RecordingCostRecorder {
    async fn record(
        &self,
        workflow_id: &str,
        run_id: &str,
        step_name: Option<&str>,
        usage: TokenUsageReport,
    ) -> Result<(), Error> {
        self.records
            .lock()
            .push((workflow_id.to_string(), run_id.to_string(), step_name.map(str::to_string), usage));
        Ok(())
    }

    async fn can_afford(&self, _estimated_cost: f64) -> bool {
        *self.affordable.lock()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn recording_executor_tracks_call_history() {
        let executor = RecordingExecutor::new("math", vec!["increment".to_string()]);
        let ctx = ExecutionContext::new("wf", "run");
        let out = executor.execute("math.increment", Value::Number(1.0), &ctx).await.unwrap();
        assert_eq!(out, Value::Number(1.0));
        assert_eq!(executor.call_count(), 1);
        assert_eq!(executor.calls()[0].0, "math.increment");
    }

    #[tokio::test]
    async fn recording_cost_recorder_honours_exhausted_budget() {
        let recorder = RecordingCostRecorder::new();
        assert!(recorder.can_afford(10.0).await);
        recorder.exhaust_budget();
        assert!(!recorder.can_afford(10.0).await);
    }
}
