//! ABOUTME: Shared value, id, and scope types for the autoflow workflow engine

mod ids;
mod scope;
mod value;

pub use ids::{RunId, StepId, WorkflowId};
pub use scope::Scope;
pub use value::Value;
