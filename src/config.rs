use serde::Deserialize;
use std::collections::HashMap;
use std::time::Duration;

use crate::rules::types::Severity;

#[derive(Debug, Deserialize, Clone)]
pub struct Config {
    pub chains: Vec<ChainConfig>,
    #[serde(default)]
    pub rules: RulesConfig,
    #[serde(default)]
    pub rpc: RpcConfig,
    #[serde(default)]
    pub noise: NoiseConfig,
    #[serde(default)]
    pub anomaly: AnomalyConfig,
    #[serde(default)]
    pub profiler: ProfilerConfig,
}

/// Static per-chain parameters. Shared read-only by every component.
#[derive(Debug, Deserialize, Clone)]
pub struct ChainConfig {
    pub name: String,
    pub chain_id: u64,
    pub endpoints: Vec<String>,
    #[serde(default = "default_block_time_ms")]
    pub block_time_ms: u64,
    #[serde(default = "default_soft_confirm_depth")]
    pub soft_confirm_depth: u64,
    #[serde(default = "default_finality_depth")]
    pub finality_depth: u64,
    /// Overrides the poll interval derived from block time.
    pub poll_interval_ms: Option<u64>,
    #[serde(default = "default_reorg_window")]
    pub reorg_window: u64,
}

impl ChainConfig {
    /// Polling interval: explicit override, else nominal block time, floored at 1s.
    pub fn poll_interval(&self) -> Duration {
        let ms = self.poll_interval_ms.unwrap_or(self.block_time_ms);
        Duration::from_millis(ms.max(1000))
    }
}

fn default_block_time_ms() -> u64 {
    12_000
}

fn default_soft_confirm_depth() -> u64 {
    3
}

fn default_finality_depth() -> u64 {
    12
}

fn default_reorg_window() -> u64 {
    64
}

#[derive(Debug, Deserialize, Clone)]
pub struct RulesConfig {
    #[serde(default = "default_rules_path")]
    pub path: String,
    #[serde(default = "default_reload_poll_secs")]
    pub reload_poll_secs: u64,
}

impl Default for RulesConfig {
    fn default() -> Self {
        Self {
            path: default_rules_path(),
            reload_poll_secs: default_reload_poll_secs(),
        }
    }
}

fn default_rules_path() -> String {
    "rules.toml".to_string()
}

fn default_reload_poll_secs() -> u64 {
    5
}

#[derive(Debug, Deserialize, Clone)]
pub struct RpcConfig {
    #[serde(default = "default_health_check_secs")]
    pub health_check_secs: u64,
    #[serde(default = "default_max_consecutive_errors")]
    pub max_consecutive_errors: u32,
}

impl Default for RpcConfig {
    fn default() -> Self {
        Self {
            health_check_secs: default_health_check_secs(),
            max_consecutive_errors: default_max_consecutive_errors(),
        }
    }
}

fn default_health_check_secs() -> u64 {
    30
}

fn default_max_consecutive_errors() -> u32 {
    3
}

#[derive(Debug, Deserialize, Clone)]
pub struct NoiseConfig {
    #[serde(default = "default_min_severity")]
    pub min_severity: Severity,
    #[serde(default = "default_dedup_cap")]
    pub dedup_cap: usize,
}

impl Default for NoiseConfig {
    fn default() -> Self {
        Self {
            min_severity: default_min_severity(),
            dedup_cap: default_dedup_cap(),
        }
    }
}

fn default_min_severity() -> Severity {
    Severity::Low
}

fn default_dedup_cap() -> usize {
    4096
}

// ============================================================
// Anomaly Detection Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct AnomalyConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_max_samples")]
    pub max_samples: usize,
    #[serde(default = "default_stats_window")]
    pub stats_window: usize,
    #[serde(default = "default_min_samples")]
    pub min_samples: usize,
    /// Decimals assumed when normalizing raw amounts for assets
    /// without an explicit override.
    #[serde(default = "default_decimals")]
    pub default_decimals: u8,
    #[serde(default)]
    pub decimals_overrides: HashMap<String, u8>,
}

impl Default for AnomalyConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            max_samples: default_max_samples(),
            stats_window: default_stats_window(),
            min_samples: default_min_samples(),
            default_decimals: default_decimals(),
            decimals_overrides: HashMap::new(),
        }
    }
}

fn default_true() -> bool {
    true
}

fn default_max_samples() -> usize {
    1000
}

fn default_stats_window() -> usize {
    100
}

fn default_min_samples() -> usize {
    10
}

fn default_decimals() -> u8 {
    18
}

// ============================================================
// Wallet Profiler Config
// ============================================================

#[derive(Debug, Deserialize, Clone)]
pub struct ProfilerConfig {
    #[serde(default = "default_true")]
    pub enabled: bool,
    #[serde(default = "default_velocity_window_secs")]
    pub velocity_window_secs: u64,
    #[serde(default = "default_velocity_min_actions")]
    pub velocity_min_actions: usize,
    #[serde(default = "default_flash_window_secs")]
    pub flash_window_secs: u64,
    #[serde(default = "default_wash_trade_window_secs")]
    pub wash_trade_window_secs: u64,
    #[serde(default = "default_large_movement_multiplier")]
    pub large_movement_multiplier: f64,
    #[serde(default = "default_max_history")]
    pub max_history: usize,
    #[serde(default = "default_pattern_log_cap")]
    pub pattern_log_cap: usize,
}

impl Default for ProfilerConfig {
    fn default() -> Self {
        Self {
            enabled: true,
            velocity_window_secs: default_velocity_window_secs(),
            velocity_min_actions: default_velocity_min_actions(),
            flash_window_secs: default_flash_window_secs(),
            wash_trade_window_secs: default_wash_trade_window_secs(),
            large_movement_multiplier: default_large_movement_multiplier(),
            max_history: default_max_history(),
            pattern_log_cap: default_pattern_log_cap(),
        }
    }
}

fn default_velocity_window_secs() -> u64 {
    60
}

fn default_velocity_min_actions() -> usize {
    5
}

fn default_flash_window_secs() -> u64 {
    30
}

fn default_wash_trade_window_secs() -> u64 {
    120
}

fn default_large_movement_multiplier() -> f64 {
    3.0
}

fn default_max_history() -> usize {
    256
}

fn default_pattern_log_cap() -> usize {
    1000
}

impl Config {
    pub fn load(path: &str) -> eyre::Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|e| eyre::eyre!("Failed to read config file '{}': {}", path, e))?;
        let config: Config = toml::from_str(&content)
            .map_err(|e| eyre::eyre!("Failed to parse config file '{}': {}", path, e))?;
        config.validate()?;
        Ok(config)
    }

    fn validate(&self) -> eyre::Result<()> {
        if self.chains.is_empty() {
            return Err(eyre::eyre!("At least one chain must be configured"));
        }
        for chain in &self.chains {
            if chain.endpoints.is_empty() {
                return Err(eyre::eyre!(
                    "Chain '{}' must have at least one RPC endpoint",
                    chain.name
                ));
            }
            for url in &chain.endpoints {
                if !url.starts_with("http://") && !url.starts_with("https://") {
                    return Err(eyre::eyre!(
                        "Invalid RPC endpoint '{}' on chain '{}'",
                        url,
                        chain.name
                    ));
                }
            }
            if chain.soft_confirm_depth >= chain.finality_depth {
                return Err(eyre::eyre!(
                    "Chain '{}': soft_confirm_depth must be below finality_depth",
                    chain.name
                ));
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_config() {
        let toml_str = r#"
[[chains]]
name = "ethereum"
chain_id = 1
endpoints = ["http://localhost:8545", "https://rpc.example.org"]

[noise]
min_severity = "medium"
"#;

        let config: Config = toml::from_str(toml_str).unwrap();
        assert_eq!(config.chains.len(), 1);
        assert_eq!(config.chains[0].chain_id, 1);
        assert_eq!(config.chains[0].endpoints.len(), 2);
        assert_eq!(config.chains[0].soft_confirm_depth, 3); // default
        assert_eq!(config.chains[0].finality_depth, 12); // default
        assert_eq!(config.noise.min_severity, Severity::Medium);
        assert_eq!(config.profiler.large_movement_multiplier, 3.0);
        assert_eq!(config.profiler.wash_trade_window_secs, 120);
        config.validate().unwrap();
    }

    #[test]
    fn test_poll_interval_floor() {
        let chain = ChainConfig {
            name: "fast".to_string(),
            chain_id: 8453,
            endpoints: vec!["http://localhost:8545".to_string()],
            block_time_ms: 250,
            soft_confirm_depth: 3,
            finality_depth: 12,
            poll_interval_ms: None,
            reorg_window: 64,
        };
        assert_eq!(chain.poll_interval(), Duration::from_secs(1));
    }

    #[test]
    fn test_validate_empty_chains() {
        let config: Config = toml::from_str("chains = []").unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_validate_bad_endpoint() {
        let toml_str = r#"
[[chains]]
name = "bad"
chain_id = 1
endpoints = ["ws://localhost:8546"]
"#;
        let config: Config = toml::from_str(toml_str).unwrap();
        assert!(config.validate().is_err());
    }
}
