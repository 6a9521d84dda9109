//! ABOUTME: Layered engine configuration: pricing table, queue transport selection, and
//! ABOUTME: cost retention settings, loaded via `config`/`toml` from a file, environment
//! ABOUTME: variables, and an optional explicit override path, in that precedence order.

use serde::{Deserialize, Serialize};
use std::collections::HashMap;

/// Per-model pricing used by the cost tracker to compute
/// `estimated_cost`. Dollars per one million tokens.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ModelPricing {
    pub input_per_million: f64,
    pub output_per_million: f64,
    #[serde(default = "default_currency")]
    pub currency: String,
}

fn default_currency() -> String {
    "USD".to_string()
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct PricingTableConfig {
    #[serde(default)]
    pub models: HashMap<String, ModelPricing>,
}

/// Which queue transport the `WorkflowQueueManager` should bind to.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum QueueTransportKind {
    #[default]
    Memory,
    Redis,
    Amqp,
    File,
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct QueueConfig {
    #[serde(default)]
    pub transport: QueueTransportKind,
    #[serde(default)]
    pub redis_url: Option<String>,
    #[serde(default)]
    pub amqp_url: Option<String>,
    #[serde(default)]
    pub file_broker_dir: Option<String>,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_max_attempts")]
    pub max_attempts: u32,
    #[serde(default = "default_retry_delay_ms")]
    pub retry_delay_ms: u64,
    #[serde(default)]
    pub dead_letter_queue: Option<String>,
}

fn default_batch_size() -> usize {
    10
}

fn default_max_attempts() -> u32 {
    3
}

fn default_retry_delay_ms() -> u64 {
    5_000
}

/// Retention policy for append-only `CostRecord`s ( lifecycle note:
/// "only an explicit retention call may delete by timestamp").
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RetentionConfig {
    #[serde(default)]
    pub max_age_days: Option<u32>,
}

impl Default for RetentionConfig {
    fn default() -> Self {
        Self { max_age_days: None }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, Default, PartialEq)]
pub struct EngineConfig {
    /// Applied to `while` when the document omits `max_iterations`... in
    /// practice the document schema makes it required, but sub-workflow
    /// recursion needs its own cap.
    #[serde(default = "default_recursion_depth_limit")]
    pub recursion_depth_limit: u32,
    #[serde(default)]
    pub pricing: PricingTableConfig,
    #[serde(default)]
    pub queue: QueueConfig,
    #[serde(default)]
    pub retention: RetentionConfig,
}

fn default_recursion_depth_limit() -> u32 {
    64
}

impl EngineConfig {
    /// Loads a base `config/autoflow.toml` (if present), overridden by
    /// `AUTOFLOW_*` environment variables, overridden by an optional
    /// explicit file path.
    ///
    /// # Errors
    /// Returns an error if a configured source exists but fails to parse.
    pub fn load(explicit_path: Option<&str>) -> Result<Self, config::ConfigError> {
        let mut builder = config::Config::builder()
            .add_source(config::File::with_name("config/autoflow").required(false))
            .add_source(config::Environment::with_prefix("AUTOFLOW").separator("__"));

        if let Some(path) = explicit_path {
            builder = builder.add_source(config::File::with_name(path).required(true));
        }

        builder.build()?.try_deserialize()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_no_pricing_entries() {
        let config = EngineConfig::default();
        assert!(config.pricing.models.is_empty());
        assert_eq!(config.recursion_depth_limit, 64);
    }

    #[test]
    fn queue_defaults_to_in_memory_transport() {
        let config = QueueConfig::default();
        assert_eq!(config.transport, QueueTransportKind::Memory);
        assert_eq!(config.max_attempts, 3);
    }
}
