//! ABOUTME: Small builders for `Workflow`/`Step` trees, reused across the workspace's
//! ABOUTME: test suites instead of each crate hand-assembling the same fixtures

use autoflow_engine::model::{OnError, RetryPolicy, Step, StepKind, Workflow, WorkflowMeta};
use indexmap::IndexMap;

/// A bare `action` step with string-literal inputs, mirroring the shape a
/// parsed document produces before expression resolution.
#[must_use]
pub fn action_step(id: &str, action: &str, inputs: &[(&str, &str)]) -> Step {
    Step {
        id: id.to_string(),
        name: None,
        output_variable: None,
        condition: None,
        timeout_ms: None,
        retry: RetryPolicy::default(),
        on_error: OnError::Stop,
        kind: StepKind::Action {
            action: action.to_string(),
            inputs: inputs.iter().map(|(k, v)| (k.to_string(), v.to_string())).collect(),
        },
    }
}

/// As [`action_step`], binding the result to `output_variable`.
#[must_use]
pub fn action_step_with_output(id: &str, action: &str, inputs: &[(&str, &str)], output_variable: &str) -> Step {
    let mut step = action_step(id, action, inputs);
    step.output_variable = Some(output_variable.to_string());
    step
}

/// A minimal valid workflow wrapping `steps`, with no inputs, tools, or
/// triggers declared.
#[must_use]
pub fn bare_workflow(steps: Vec<Step>) -> Workflow {
    Workflow {
        workflow: WorkflowMeta {
            id: "test".to_string(),
            name: "Test".to_string(),
            ..Default::default()
        },
        tools: IndexMap::new(),
        inputs: IndexMap::new(),
        triggers: Vec::new(),
        steps,
    }
}

/// The frontmatter+Markdown source text for a minimal one-step workflow
/// document, suitable for feeding to `autoflow_document::parse_str` in
/// tests that need a realistic document rather than a hand-built `Workflow`.
#[must_use]
pub fn minimal_workflow_document(workflow_id: &str, action: &str) -> String {
    format!(
        "---\nworkflow:\n  id: {workflow_id}\n  name: Minimal\nsteps:\n  - id: only\n    type: action\n    action: \"{action}\"\n    inputs: {{}}\n---\nA minimal one-step workflow.\n"
    )
}
