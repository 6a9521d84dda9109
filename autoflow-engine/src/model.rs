//! ABOUTME: Workflow/step data model
//! ABOUTME: Immutable after parse; `Workflow::validate` enforces the sibling-id and loop-cap invariants

use autoflow_core::Error;
use indexmap::IndexMap;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Default cap applied to `while` loops and `for_each` concurrency when a
/// workflow document omits them. `concurrency` is universal and optional,
/// defaulting to 1 (sequential).
pub const DEFAULT_CONCURRENCY: u32 = 1;
pub const DEFAULT_MAX_RETRY_ATTEMPTS: u32 = 1;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct InputField {
    #[serde(rename = "type")]
    pub field_type: String,
    #[serde(default)]
    pub required: bool,
    #[serde(default)]
    pub default: Option<serde_json::Value>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub pattern: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct WorkflowMeta {
    pub id: String,
    pub name: String,
    #[serde(default)]
    pub version: Option<String>,
    #[serde(default)]
    pub description: Option<String>,
    #[serde(default)]
    pub author: Option<String>,
    #[serde(default)]
    pub tags: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Workflow {
    pub workflow: WorkflowMeta,
    #[serde(default)]
    pub tools: IndexMap<String, serde_json::Value>,
    #[serde(default)]
    pub inputs: IndexMap<String, InputField>,
    #[serde(default)]
    pub triggers: Vec<serde_json::Value>,
    #[serde(default)]
    pub steps: Vec<Step>,
}

impl Workflow {
    /// Enforces the structural invariants that a type-checked
    /// deserialize alone cannot: unique sibling ids, finite `while` caps,
    /// and `if`'s reliance on the shared `condition` field actually being
    /// present.
    pub fn validate(&self) -> Result<(), Error> {
        validate_siblings(&self.steps)
    }
}

fn validate_siblings(steps: &[Step]) -> Result<(), Error> {
    let mut seen = HashSet::new();
    for step in steps {
        if !seen.insert(step.id.as_str()) {
            return Err(Error::invalid_schema(format!(
                "duplicate step id '{}' among siblings",
                step.id
            )));
        }
        validate_step(step)?;
    }
    Ok(())
}

fn validate_step(step: &Step) -> Result<(), Error> {
    match &step.kind {
        StepKind::If { then, r#else } => {
            if step.condition.is_none() {
                return Err(Error::invalid_schema(format!(
                    "step '{}': 'if' requires a 'condition'",
                    step.id
                )));
            }
            validate_siblings(then)?;
            validate_siblings(r#else)?;
        }
        StepKind::Switch { cases, default, .. } => {
            for branch in cases.values() {
                validate_siblings(branch)?;
            }
            if let Some(default) = default {
                validate_siblings(default)?;
            }
        }
        StepKind::ForEach { steps, .. } | StepKind::While { steps, .. } => {
            validate_siblings(steps)?;
        }
        StepKind::Parallel { branches } => {
            let mut ids = HashSet::new();
            for branch in branches {
                if !ids.insert(branch.id.as_str()) {
                    return Err(Error::invalid_schema(format!(
                        "step '{}': duplicate parallel branch id '{}'",
                        step.id, branch.id
                    )));
                }
                validate_siblings(&branch.steps)?;
            }
        }
        StepKind::Try {
            r#try,
            catch,
            finally,
        } => {
            validate_siblings(r#try)?;
            validate_siblings(catch)?;
            validate_siblings(finally)?;
        }
        StepKind::Action { .. }
        | StepKind::InvokeWorkflow { .. }
        | StepKind::Map { .. }
        | StepKind::Filter { .. }
        | StepKind::Reduce { .. } => {}
    }
    Ok(())
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OnError {
    #[default]
    Stop,
    Continue,
    Retry,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetryPolicy {
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default)]
    pub backoff_ms: u64,
    #[serde(default = "default_backoff_multiplier")]
    pub backoff_multiplier: f64,
    #[serde(default)]
    pub retry_on: Vec<String>,
}

fn default_max_attempts() -> u32 {
    DEFAULT_MAX_RETRY_ATTEMPTS
}

fn default_backoff_multiplier() -> f64 {
    1.0
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: default_max_attempts(),
            backoff_ms: 0,
            backoff_multiplier: default_backoff_multiplier(),
            retry_on: Vec::new(),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Branch {
    pub id: String,
    pub steps: Vec<Step>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Step {
    pub id: String,
    #[serde(default)]
    pub name: Option<String>,
    #[serde(default)]
    pub output_variable: Option<String>,
    #[serde(default)]
    pub condition: Option<String>,
    #[serde(default)]
    pub timeout_ms: Option<u64>,
    #[serde(default)]
    pub retry: RetryPolicy,
    #[serde(default)]
    pub on_error: OnError,
    #[serde(flatten)]
    pub kind: StepKind,
}

/// The tagged-variant step payload, re-architected from the source's
/// stringly-typed `type` dispatch: an unknown tag is a parse-time error
/// rather than a silent no-op.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum StepKind {
    Action {
        action: String,
        #[serde(default)]
        inputs: IndexMap<String, String>,
    },
    #[serde(rename = "workflow")]
    InvokeWorkflow {
        workflow: String,
        #[serde(default)]
        inputs: IndexMap<String, String>,
    },
    If {
        then: Vec<Step>,
        #[serde(default)]
        r#else: Vec<Step>,
    },
    Switch {
        expression: String,
        cases: IndexMap<String, Vec<Step>>,
        #[serde(default)]
        default: Option<Vec<Step>>,
    },
    ForEach {
        items: String,
        item_variable: String,
        #[serde(default)]
        index_variable: Option<String>,
        #[serde(default = "default_concurrency")]
        concurrency: u32,
        steps: Vec<Step>,
    },
    While {
        condition: String,
        max_iterations: u64,
        steps: Vec<Step>,
    },
    Map {
        input: String,
        expression: String,
        #[serde(default = "default_concurrency")]
        concurrency: u32,
    },
    Filter {
        input: String,
        condition: String,
        #[serde(default = "default_concurrency")]
        concurrency: u32,
    },
    Reduce {
        input: String,
        expression: String,
        initial_value: serde_json::Value,
        #[serde(default = "default_accumulator_variable")]
        accumulator_variable: String,
    },
    Parallel {
        branches: Vec<Branch>,
    },
    Try {
        r#try: Vec<Step>,
        #[serde(default)]
        catch: Vec<Step>,
        #[serde(default)]
        finally: Vec<Step>,
    },
}

fn default_concurrency() -> u32 {
    DEFAULT_CONCURRENCY
}

/// Scope key `reduce` binds its running total under when a workflow
/// document doesn't declare `accumulator_variable` explicitly.
fn default_accumulator_variable() -> String {
    "accumulator".to_string()
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum StepStatus {
    Completed,
    Skipped,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StepResult {
    pub step_id: String,
    pub status: StepStatus,
    pub started_at: chrono::DateTime<chrono::Utc>,
    pub finished_at: chrono::DateTime<chrono::Utc>,
    #[serde(default)]
    pub output: Option<autoflow_core::Value>,
    #[serde(default)]
    pub error: Option<String>,
    pub attempts: u32,
}

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum WorkflowStatus {
    Running,
    Completed,
    Failed,
    Cancelled,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct WorkflowRun {
    pub run_id: autoflow_core::RunId,
    pub workflow_id: String,
    pub status: WorkflowStatus,
    pub step_results: Vec<StepResult>,
    pub output: IndexMap<String, autoflow_core::Value>,
    #[serde(default)]
    pub error: Option<RunError>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunError {
    pub step_id: Option<String>,
    pub message: String,
}
