//! Runtime configuration
//!
//! Two layers: [`AppConfig`] drives logging and process-level concerns,
//! [`ClearingConfig`] carries the clearinghouse defaults applied to new
//! markets. Both load from YAML and have sensible defaults for tests.

use serde::{Deserialize, Serialize};

use crate::oracle::RetryPolicy;

/// Process-level settings (consumed by [`crate::logging`]).
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct AppConfig {
    pub log_dir: String,
    pub log_file: String,
    /// "hourly", "daily", or anything else for a single file
    pub rotation: String,
    /// Base level for everything not overridden below
    pub log_level: String,
    /// Per-subsystem level overrides, e.g. `("engine", "debug")` to
    /// trace one market's matching without raising the whole crate
    pub subsystem_levels: Vec<(String, String)>,
    /// JSON file output for log shippers
    pub use_json: bool,
}

impl Default for AppConfig {
    fn default() -> Self {
        Self {
            log_dir: "logs".into(),
            log_file: "veridex.log".into(),
            rotation: "daily".into(),
            log_level: "info".into(),
            subsystem_levels: Vec::new(),
            use_json: false,
        }
    }
}

/// Clearinghouse defaults applied to newly created markets.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct ClearingConfig {
    /// Fee rate in 10^6 precision (see [`crate::fee`])
    pub fee_rate_ppm: u64,
    pub min_order_size: u64,
    pub max_position: u64,
    /// Event bus ring capacity
    pub event_log_capacity: usize,
    /// Cadence of the order expiry sweep
    pub expiry_sweep_interval_ms: u64,
    /// Oracle retry backoff
    pub oracle_retry: RetryPolicy,
}

impl Default for ClearingConfig {
    fn default() -> Self {
        Self {
            fee_rate_ppm: crate::fee::DEFAULT_FEE_RATE,
            min_order_size: 1,
            max_position: 10_000,
            event_log_capacity: crate::event_bus::DEFAULT_LOG_CAPACITY,
            expiry_sweep_interval_ms: 1_000,
            oracle_retry: RetryPolicy::default(),
        }
    }
}

impl ClearingConfig {
    pub fn from_yaml_str(yaml: &str) -> anyhow::Result<Self> {
        Ok(serde_yaml::from_str(yaml)?)
    }

    pub fn from_yaml_file(path: &str) -> anyhow::Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        Self::from_yaml_str(&raw)
    }
}
