//! ABOUTME: Budget limits, alert levels, and the handler trait alerts are routed to

use async_trait::async_trait;

/// Which population of [`crate::CostRecord`]s a [`BudgetLimit`] sums over.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BudgetScope {
    Global,
    Workflow,
    Agent,
    Model,
}

/// What happens once a limit's usage reaches or exceeds `max_cost`.
///
/// Not named explicitly in the `BudgetLimit` field list, but needed to
/// capture that exceeding a limit does not by itself fail the run unless
/// `action_on_limit = block` — a design decision resolved per limit
/// rather than globally, recorded in `DESIGN.md`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ActionOnLimit {
    #[default]
    Allow,
    Block,
}

/// A configured cap on cumulative estimated cost, optionally over a rolling
/// period, with alert thresholds expressed as fractions of `max_cost`.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BudgetLimit {
    pub name: String,
    pub max_cost: f64,
    pub period_ms: Option<u64>,
    pub scope: BudgetScope,
    pub scope_id: Option<String>,
    /// Sorted ascending; each is compared as `usage / max_cost`.
    pub alert_thresholds: Vec<f64>,
    #[serde(default)]
    pub action_on_limit: ActionOnLimit,
}

impl BudgetLimit {
    #[must_use]
    pub fn new(name: impl Into<String>, max_cost: f64, scope: BudgetScope) -> Self {
        Self {
            name: name.into(),
            max_cost,
            period_ms: None,
            scope,
            scope_id: None,
            alert_thresholds: Vec::new(),
            action_on_limit: ActionOnLimit::Allow,
        }
    }

    #[must_use]
    pub fn with_scope_id(mut self, scope_id: impl Into<String>) -> Self {
        self.scope_id = Some(scope_id.into());
        self
    }

    #[must_use]
    pub const fn with_period_ms(mut self, period_ms: u64) -> Self {
        self.period_ms = Some(period_ms);
        self
    }

    #[must_use]
    pub fn with_alert_thresholds(mut self, mut thresholds: Vec<f64>) -> Self {
        thresholds.sort_by(|a, b| a.partial_cmp(b).unwrap_or(std::cmp::Ordering::Equal));
        self.alert_thresholds = thresholds;
        self
    }

    #[must_use]
    pub const fn blocking(mut self) -> Self {
        self.action_on_limit = ActionOnLimit::Block;
        self
    }
}

/// Severity of a crossed alert threshold: `warning` below 100% of
/// `max_cost`, `critical` at or above it.
#[derive(Debug, Clone, Copy, PartialEq, Eq, serde::Serialize, serde::Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AlertLevel {
    Warning,
    Critical,
}

/// Emitted when a [`BudgetLimit`]'s usage crosses a previously un-crossed
/// alert threshold.
#[derive(Debug, Clone, serde::Serialize, serde::Deserialize)]
pub struct BudgetAlert {
    pub limit_name: String,
    pub level: AlertLevel,
    pub threshold: f64,
    pub usage_fraction: f64,
    pub spent: f64,
    pub max_cost: f64,
    pub currency: String,
    pub scope: BudgetScope,
    pub scope_id: Option<String>,
}

/// A sink for [`BudgetAlert`]s. Handler errors are swallowed — an alert
/// delivery failure must never block cost recording.
#[async_trait]
pub trait AlertHandler: Send + Sync {
    async fn handle(&self, alert: &BudgetAlert);
}

/// Collects alerts in-process; used by tests and as a default sink when no
/// handler is registered.
#[derive(Debug, Default)]
pub struct CollectingAlertHandler {
    alerts: parking_lot::Mutex<Vec<BudgetAlert>>,
}

impl CollectingAlertHandler {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn drain(&self) -> Vec<BudgetAlert> {
        std::mem::take(&mut self.alerts.lock())
    }
}

#[async_trait]
impl AlertHandler for CollectingAlertHandler {
    async fn handle(&self, alert: &BudgetAlert) {
        self.alerts.lock().push(alert.clone());
    }
}
