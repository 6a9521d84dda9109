//! ABOUTME: Workflow/step data model, built-in operations, executor contract, and the
//! ABOUTME: control-flow interpreter that walks a parsed `Workflow`

pub mod builtins;
pub mod config;
pub mod engine;
pub mod executor;
pub mod model;

pub use engine::{Engine, StaticWorkflowResolver, WorkflowResolver};
pub use executor::{CostRecorder, ExecutionContext, Executor, ExecutorRegistry};
pub use model::{Step, StepKind, Workflow, WorkflowRun};
