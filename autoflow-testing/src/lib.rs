//! ABOUTME: Shared test fixtures and builders (dev-dependency only) used by this
//! ABOUTME: workspace's other crates instead of each one hand-rolling its own doubles

pub mod builders;
pub mod fixtures;

pub use builders::{action_step, action_step_with_output, bare_workflow, minimal_workflow_document};
pub use fixtures::{RecordingCostRecorder, RecordingExecutor};
