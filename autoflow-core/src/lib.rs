//! ABOUTME: Error taxonomy, value model, ids, and variable scope for autoflow
//! ABOUTME: Foundation layer shared by the document parser, expression resolver, and engine

pub mod error;
pub mod types;

pub use error::{Error, ExecutorErrorKind, Result};
pub use types::{RunId, Scope, StepId, Value, WorkflowId};
