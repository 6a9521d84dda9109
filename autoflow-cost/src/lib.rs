//! ABOUTME: Append-only cost/budget tracker — per-call token usage,
//! ABOUTME: a pricing table, budget limits with alert thresholds, and alert handlers.
//!
//! Wired into the engine through [`autoflow_engine::executor::CostRecorder`]
//! as an injected service rather than a hard dependency.

mod limit;
mod record;
mod summary;
mod tracker;

pub use limit::{
    ActionOnLimit, AlertHandler, AlertLevel, BudgetAlert, BudgetLimit, BudgetScope,
    CollectingAlertHandler,
};
pub use record::{CostRecord, RecordParams, TokenUsage};
pub use summary::{CostSummary, Totals};
pub use tracker::CostTracker;
