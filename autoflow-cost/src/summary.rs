//! ABOUTME: `summary()` return shape — aggregated totals and per-dimension
//! ABOUTME: breakdowns computed over a snapshot of the records list.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Aggregate totals over a (possibly time-bounded) set of `CostRecord`s.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Totals {
    pub requests: u64,
    pub input_tokens: u64,
    pub output_tokens: u64,
    pub total_cost: f64,
}

impl Totals {
    #[must_use]
    pub fn average_cost_per_request(&self) -> f64 {
        if self.requests == 0 {
            0.0
        } else {
            self.total_cost / self.requests as f64
        }
    }
}

/// `summary(start?, end?) -> {totals, per_workflow, per_agent, per_model}`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct CostSummary {
    pub totals: Totals,
    pub per_workflow: HashMap<String, f64>,
    pub per_agent: HashMap<String, f64>,
    pub per_model: HashMap<String, f64>,
}
