//! ABOUTME: `CostTracker` — the injected cost/budget service, backed by an append-only
//! ABOUTME: record list rather than bare running totals, since `summary`/`workflow_cost`
//! ABOUTME: need to replay it over an arbitrary time window.

use std::collections::HashMap;
use std::sync::Arc;

use autoflow_core::Error;
use autoflow_engine::config::{ModelPricing, PricingTableConfig};
use autoflow_engine::executor::{CostRecorder, TokenUsageReport};
use chrono::{DateTime, Utc};
use parking_lot::{Mutex, RwLock};

use crate::limit::{ActionOnLimit, AlertHandler, AlertLevel, BudgetAlert, BudgetLimit, BudgetScope};
use crate::record::{CostRecord, RecordParams, TokenUsage};
use crate::summary::{CostSummary, Totals};

/// Per-limit bookkeeping: which period we're currently in and how many of
/// the limit's sorted thresholds have already fired within it.
struct LimitState {
    period_index: i64,
    crossed_count: usize,
}

impl Default for LimitState {
    fn default() -> Self {
        Self {
            period_index: 0,
            crossed_count: 0,
        }
    }
}

/// Process-wide (or injected) cost/budget service. Holds an append-only
/// `Vec<CostRecord>`, a read-mostly pricing table, a set of configured
/// [`BudgetLimit`]s, and the handlers alerts are routed to.
///
/// Cloning shares state: every clone reads/writes the same underlying
/// `Arc<RwLock<..>>`/`Arc<Mutex<..>>`, matching "process-wide (or
/// injected) service" — callers pass one `Arc<CostTracker>` (or a clone)
/// through the engine's `cost_recorder` slot.
#[derive(Clone)]
pub struct CostTracker {
    records: Arc<RwLock<Vec<CostRecord>>>,
    pricing: Arc<RwLock<PricingTableConfig>>,
    limits: Arc<Vec<BudgetLimit>>,
    limit_state: Arc<Mutex<HashMap<String, LimitState>>>,
    handlers: Arc<Vec<Arc<dyn AlertHandler>>>,
}

impl CostTracker {
    #[must_use]
    pub fn new(pricing: PricingTableConfig) -> Self {
        Self {
            records: Arc::new(RwLock::new(Vec::new())),
            pricing: Arc::new(RwLock::new(pricing)),
            limits: Arc::new(Vec::new()),
            limit_state: Arc::new(Mutex::new(HashMap::new())),
            handlers: Arc::new(Vec::new()),
        }
    }

    #[must_use]
    pub fn with_limits(mut self, limits: Vec<BudgetLimit>) -> Self {
        self.limits = Arc::new(limits);
        self
    }

    #[must_use]
    pub fn with_handler(mut self, handler: Arc<dyn AlertHandler>) -> Self {
        Arc::make_mut(&mut self.handlers).push(handler);
        self
    }

    /// Updates the pricing table. The table is read-mostly; this is the
    /// only write path (updated only by explicit registration).
    pub fn register_model(&self, model_name: impl Into<String>, pricing: ModelPricing) {
        self.pricing.write().models.insert(model_name.into(), pricing);
    }

    fn price_for(&self, model_name: &str) -> Option<ModelPricing> {
        self.pricing.read().models.get(model_name).cloned()
    }

    fn estimate_cost(&self, model_name: &str, usage: &TokenUsage) -> (f64, String) {
        match self.price_for(model_name) {
            Some(pricing) => {
                let cost = (usage.input as f64) * pricing.input_per_million / 1e6
                    + (usage.output as f64) * pricing.output_per_million / 1e6;
                (cost, pricing.currency)
            }
            None => (0.0, "USD".to_string()),
        }
    }

    /// `record(params) -> CostRecord`: computes
    /// `estimated_cost`, appends, then evaluates every configured limit.
    pub async fn record(&self, params: RecordParams) -> CostRecord {
        let (estimated_cost, currency) = self.estimate_cost(&params.model_name, &params.token_usage);
        let record = CostRecord {
            id: uuid::Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            workflow_id: params.workflow_id,
            run_id: params.run_id,
            step_name: params.step_name,
            agent_name: params.agent_name,
            model_name: params.model_name,
            token_usage: params.token_usage,
            estimated_cost,
            currency,
            metadata: params.metadata,
        };

        self.records.write().push(record.clone());
        self.evaluate_limits(&record).await;
        record
    }

    fn scope_matches(scope: BudgetScope, scope_id: Option<&str>, record: &CostRecord) -> bool {
        match scope {
            BudgetScope::Global => true,
            BudgetScope::Workflow => scope_id == Some(record.workflow_id.as_str()),
            BudgetScope::Agent => scope_id == Some(record.agent_name.as_str()),
            BudgetScope::Model => scope_id == Some(record.model_name.as_str()),
        }
    }

    fn usage_for(&self, limit: &BudgetLimit, since: Option<DateTime<Utc>>) -> f64 {
        self.records
            .read()
            .iter()
            .filter(|r| match since {
                Some(start) => r.timestamp >= start,
                None => true,
            })
            .filter(|r| Self::scope_matches(limit.scope, limit.scope_id.as_deref(), r))
            .map(|r| r.estimated_cost)
            .sum()
    }

    fn period_bounds(period_ms: u64, now: DateTime<Utc>) -> (i64, DateTime<Utc>) {
        let period_ms = period_ms.max(1) as i64;
        let period_index = now.timestamp_millis().div_euclid(period_ms);
        let window_start = DateTime::from_timestamp_millis(period_index * period_ms).unwrap_or(now);
        (period_index, window_start)
    }

    /// For every configured limit, compute current usage in its scope
    /// (reset when the wall clock has crossed into a new period) and fire
    /// alerts for any threshold crossed for the first time this period.
    async fn evaluate_limits(&self, just_recorded: &CostRecord) {
        let now = just_recorded.timestamp;
        for limit in self.limits.iter() {
            if !Self::scope_matches(limit.scope, limit.scope_id.as_deref(), just_recorded) {
                continue;
            }

            let since = limit.period_ms.map(|ms| Self::period_bounds(ms, now).1);
            let usage = self.usage_for(limit, since);
            let fraction = if limit.max_cost > 0.0 {
                usage / limit.max_cost
            } else {
                0.0
            };

            let newly_crossed: Vec<f64> = {
                let mut state_map = self.limit_state.lock();
                let state = state_map.entry(limit.name.clone()).or_default();

                if let Some(ms) = limit.period_ms {
                    let (period_index, _) = Self::period_bounds(ms, now);
                    if period_index != state.period_index {
                        state.period_index = period_index;
                        state.crossed_count = 0;
                    }
                }

                let mut crossed = Vec::new();
                while state.crossed_count < limit.alert_thresholds.len()
                    && fraction >= limit.alert_thresholds[state.crossed_count]
                {
                    crossed.push(limit.alert_thresholds[state.crossed_count]);
                    state.crossed_count += 1;
                }
                crossed
            };

            for threshold in newly_crossed {
                let level = if threshold >= 1.0 {
                    AlertLevel::Critical
                } else {
                    AlertLevel::Warning
                };
                let alert = BudgetAlert {
                    limit_name: limit.name.clone(),
                    level,
                    threshold,
                    usage_fraction: fraction,
                    spent: usage,
                    max_cost: limit.max_cost,
                    currency: just_recorded.currency.clone(),
                    scope: limit.scope,
                    scope_id: limit.scope_id.clone(),
                };
                for handler in self.handlers.iter() {
                    handler.handle(&alert).await;
                }
            }
        }
    }

    /// `can_afford(cost) -> bool`. Checks every
    /// `action_on_limit = block` limit: a hypothetical call costing
    /// `estimated_cost` is refused if it would push that limit's current
    /// (globally-scoped) usage to or past `max_cost`. Scoped blocking
    /// limits (workflow/agent/model) aren't evaluated here since
    /// `can_afford` carries no scope context; callers needing scoped
    /// pre-checks should inspect `summary()` directly.
    pub async fn can_afford(&self, estimated_cost: f64) -> bool {
        let now = Utc::now();
        for limit in self.limits.iter() {
            if limit.action_on_limit != ActionOnLimit::Block || limit.scope != BudgetScope::Global {
                continue;
            }
            let since = limit.period_ms.map(|ms| Self::period_bounds(ms, now).1);
            let usage = self.usage_for(limit, since);
            if usage + estimated_cost >= limit.max_cost {
                return false;
            }
        }
        true
    }

    /// `summary(start?, end?) -> {totals, per_workflow, per_agent, per_model}`.
    #[must_use]
    pub fn summary(&self, start: Option<DateTime<Utc>>, end: Option<DateTime<Utc>>) -> CostSummary {
        let records = self.records.read();
        let mut summary = CostSummary::default();

        for record in records.iter() {
            if let Some(start) = start {
                if record.timestamp < start {
                    continue;
                }
            }
            if let Some(end) = end {
                if record.timestamp > end {
                    continue;
                }
            }

            summary.totals.requests += 1;
            summary.totals.input_tokens += record.token_usage.input;
            summary.totals.output_tokens += record.token_usage.output;
            summary.totals.total_cost += record.estimated_cost;

            *summary.per_workflow.entry(record.workflow_id.clone()).or_insert(0.0) +=
                record.estimated_cost;
            *summary.per_agent.entry(record.agent_name.clone()).or_insert(0.0) +=
                record.estimated_cost;
            *summary.per_model.entry(record.model_name.clone()).or_insert(0.0) +=
                record.estimated_cost;
        }

        summary
    }

    /// `workflow_cost(workflow_id, run_id?) -> number`.
    #[must_use]
    pub fn workflow_cost(&self, workflow_id: &str, run_id: Option<&str>) -> f64 {
        self.records
            .read()
            .iter()
            .filter(|r| r.workflow_id == workflow_id)
            .filter(|r| run_id.is_none() || run_id == Some(r.run_id.as_str()))
            .map(|r| r.estimated_cost)
            .sum()
    }

    /// Retention: deletes every record with `timestamp < cutoff`, returning
    /// the number removed. The only permitted way to shrink the append-only
    /// log.
    pub fn purge_before(&self, cutoff: DateTime<Utc>) -> usize {
        let mut records = self.records.write();
        let before = records.len();
        records.retain(|r| r.timestamp >= cutoff);
        before - records.len()
    }

    #[must_use]
    pub fn record_count(&self) -> usize {
        self.records.read().len()
    }
}

#[async_trait::async_trait]
impl CostRecorder for CostTracker {
    async fn record(
        &self,
        workflow_id: &str,
        run_id: &str,
        step_name: Option<&str>,
        usage: TokenUsageReport,
    ) -> Result<(), Error> {
        self.record(RecordParams {
            workflow_id: workflow_id.to_string(),
            run_id: run_id.to_string(),
            step_name: step_name.map(str::to_string),
            agent_name: usage.agent_name,
            model_name: usage.model_name,
            token_usage: TokenUsage {
                input: usage.input_tokens,
                output: usage.output_tokens,
                cached: usage.cached_tokens,
                reasoning: usage.reasoning_tokens,
            },
            metadata: usage.metadata,
        })
        .await;
        Ok(())
    }

    async fn can_afford(&self, estimated_cost: f64) -> bool {
        self.can_afford(estimated_cost).await
    }
}
