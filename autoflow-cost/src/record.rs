//! ABOUTME: `CostRecord` and `TokenUsage` — the append-only unit the tracker stores,
//! ABOUTME: matching the `cost_records` schema

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value as JsonValue;

/// Token counts for a single model call. `cached`/`reasoning` default to zero
/// for providers that don't report them.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct TokenUsage {
    pub input: u64,
    pub output: u64,
    pub cached: u64,
    pub reasoning: u64,
}

impl TokenUsage {
    #[must_use]
    pub const fn new(input: u64, output: u64) -> Self {
        Self {
            input,
            output,
            cached: 0,
            reasoning: 0,
        }
    }
}

/// One append-only entry recorded by [`crate::CostTracker::record`].
///
/// Invariant: `estimated_cost >= 0`; `0` when the model is
/// unknown to the pricing table.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CostRecord {
    pub id: String,
    pub timestamp: DateTime<Utc>,
    pub workflow_id: String,
    pub run_id: String,
    pub step_name: Option<String>,
    pub agent_name: String,
    pub model_name: String,
    pub token_usage: TokenUsage,
    pub estimated_cost: f64,
    pub currency: String,
    pub metadata: Option<JsonValue>,
}

/// Input parameters for [`crate::CostTracker::record`]; kept separate from
/// `CostRecord` itself since `id`/`timestamp`/`estimated_cost` are computed,
/// not supplied by the caller.
#[derive(Debug, Clone)]
pub struct RecordParams {
    pub workflow_id: String,
    pub run_id: String,
    pub step_name: Option<String>,
    pub agent_name: String,
    pub model_name: String,
    pub token_usage: TokenUsage,
    pub metadata: Option<JsonValue>,
}
