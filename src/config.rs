//! Analysis and ingest configuration
//!
//! Horizons, bucket sizes and lifecycle rules. Loaded from TOML; every field
//! has a default so a partial file is valid.

use serde::{Deserialize, Serialize};
use std::path::Path;

/// Analysis configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AnalysisConfig {
    /// Markout horizons for the slippage study (seconds)
    #[serde(default = "default_markout_horizons")]
    pub markout_horizons_secs: Vec<i64>,

    /// Forward-return horizons for the imbalance study (seconds)
    #[serde(default = "default_imbalance_horizons")]
    pub imbalance_horizons_secs: Vec<i64>,

    /// Hourly buckets with fewer trades are dropped from hourly markout curves
    #[serde(default = "default_min_trades_per_hour")]
    pub min_trades_per_hour: usize,

    /// Bucket width for net signed-volume flow (seconds)
    #[serde(default = "default_net_flow_bucket_secs")]
    pub net_flow_bucket_secs: i64,

    /// Resampling step for the imbalance grid (seconds)
    #[serde(default = "default_grid_step_secs")]
    pub grid_step_secs: i64,

    /// Lifecycle statuses after which a market accepts no further mutations
    #[serde(default = "default_terminal_statuses")]
    pub terminal_statuses: Vec<String>,

    /// Log every Nth applied delta at debug level
    #[serde(default = "default_delta_log_every")]
    pub delta_log_every: u64,
}

fn default_markout_horizons() -> Vec<i64> {
    vec![1, 10, 30, 60, 300]
}

fn default_imbalance_horizons() -> Vec<i64> {
    vec![1, 5, 30, 60, 120, 300]
}

fn default_min_trades_per_hour() -> usize {
    5
}

fn default_net_flow_bucket_secs() -> i64 {
    300
}

fn default_grid_step_secs() -> i64 {
    1
}

fn default_terminal_statuses() -> Vec<String> {
    vec!["closed".to_string(), "settled".to_string()]
}

fn default_delta_log_every() -> u64 {
    10
}

impl Default for AnalysisConfig {
    fn default() -> Self {
        Self {
            markout_horizons_secs: default_markout_horizons(),
            imbalance_horizons_secs: default_imbalance_horizons(),
            min_trades_per_hour: default_min_trades_per_hour(),
            net_flow_bucket_secs: default_net_flow_bucket_secs(),
            grid_step_secs: default_grid_step_secs(),
            terminal_statuses: default_terminal_statuses(),
            delta_log_every: default_delta_log_every(),
        }
    }
}

impl AnalysisConfig {
    /// Load from TOML file
    pub fn load(path: impl AsRef<Path>) -> anyhow::Result<Self> {
        let contents = std::fs::read_to_string(path)?;
        let config: Self = toml::from_str(&contents)?;
        Ok(config)
    }

    /// Load from environment or default path
    pub fn from_env() -> Self {
        let path = std::env::var("KALSHI_MICRO_CONFIG")
            .unwrap_or_else(|_| "kalshi_micro.toml".to_string());

        Self::load(&path).unwrap_or_else(|e| {
            tracing::debug!("Using default analysis config ({}): {}", path, e);
            Self::default()
        })
    }

    /// Save to TOML file
    pub fn save(&self, path: impl AsRef<Path>) -> anyhow::Result<()> {
        let contents = toml::to_string_pretty(self)?;
        std::fs::write(path, contents)?;
        Ok(())
    }

    /// Whether `status` ends a market's life.
    pub fn is_terminal(&self, status: &str) -> bool {
        self.terminal_statuses
            .iter()
            .any(|s| s.eq_ignore_ascii_case(status))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_default_config() {
        let config = AnalysisConfig::default();
        assert_eq!(config.markout_horizons_secs, vec![1, 10, 30, 60, 300]);
        assert_eq!(config.imbalance_horizons_secs, vec![1, 5, 30, 60, 120, 300]);
        assert_eq!(config.min_trades_per_hour, 5);
    }

    #[test]
    fn test_toml_roundtrip() {
        let config = AnalysisConfig::default();
        let toml = toml::to_string_pretty(&config).unwrap();
        let parsed: AnalysisConfig = toml::from_str(&toml).unwrap();
        assert_eq!(parsed.markout_horizons_secs, config.markout_horizons_secs);
        assert_eq!(parsed.terminal_statuses, config.terminal_statuses);
    }

    #[test]
    fn test_save_then_load() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("kalshi_micro.toml");
        let config = AnalysisConfig {
            markout_horizons_secs: vec![5, 15],
            min_trades_per_hour: 3,
            ..AnalysisConfig::default()
        };
        config.save(&path).unwrap();

        let loaded = AnalysisConfig::load(&path).unwrap();
        assert_eq!(loaded.markout_horizons_secs, vec![5, 15]);
        assert_eq!(loaded.min_trades_per_hour, 3);
        assert_eq!(loaded.net_flow_bucket_secs, config.net_flow_bucket_secs);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let parsed: AnalysisConfig = toml::from_str("min_trades_per_hour = 10\n").unwrap();
        assert_eq!(parsed.min_trades_per_hour, 10);
        assert_eq!(parsed.grid_step_secs, 1);
    }

    #[test]
    fn test_terminal_status_match() {
        let config = AnalysisConfig::default();
        assert!(config.is_terminal("settled"));
        assert!(config.is_terminal("Closed"));
        assert!(!config.is_terminal("open"));
    }
}
