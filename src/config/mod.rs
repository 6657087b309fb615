//! Gateway configuration
//!
//! Settings consumed by the accounting and orchestration core. Values load
//! from a YAML file and can be overridden per-key through `TOLLGATE_*`
//! environment variables, matching how the rest of the deployment is tuned.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::utils::error::{GatewayError, Result};

/// Default quota units per one USD.
pub const DEFAULT_QUOTA_PER_USD: f64 = 500_000.0;

/// Runtime configuration for the accounting core
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Maximum counted rounds for the tool-execution loop
    pub max_tool_rounds: u32,
    /// Timeout for the detached billing reconciliation task, in seconds
    pub billing_timeout_secs: u64,
    /// Minimum completion-token floor pre-consumed for background requests
    pub background_preconsume_tokens: u32,
    /// Fixed quota-per-USD conversion constant
    pub quota_per_usd: f64,
    /// Per-invocation timeout for external tool calls, in seconds
    pub tool_call_timeout_secs: u64,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_tool_rounds: 5,
            billing_timeout_secs: 30,
            background_preconsume_tokens: 1000,
            quota_per_usd: DEFAULT_QUOTA_PER_USD,
            tool_call_timeout_secs: 30,
        }
    }
}

impl Config {
    /// Load configuration from a YAML file, then apply environment overrides.
    pub fn from_file(path: impl AsRef<Path>) -> Result<Self> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Config = serde_yaml::from_str(&raw)?;
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Build a configuration from defaults plus environment overrides.
    pub fn from_env() -> Result<Self> {
        let mut config = Config::default();
        config.apply_env_overrides();
        config.validate()?;
        Ok(config)
    }

    /// Apply `TOLLGATE_*` environment variable overrides in place.
    pub fn apply_env_overrides(&mut self) {
        if let Some(value) = env_parse("TOLLGATE_MAX_TOOL_ROUNDS") {
            self.max_tool_rounds = value;
        }
        if let Some(value) = env_parse("TOLLGATE_BILLING_TIMEOUT_SECS") {
            self.billing_timeout_secs = value;
        }
        if let Some(value) = env_parse("TOLLGATE_BACKGROUND_PRECONSUME_TOKENS") {
            self.background_preconsume_tokens = value;
        }
        if let Some(value) = env_parse("TOLLGATE_QUOTA_PER_USD") {
            self.quota_per_usd = value;
        }
        if let Some(value) = env_parse("TOLLGATE_TOOL_CALL_TIMEOUT_SECS") {
            self.tool_call_timeout_secs = value;
        }
    }

    /// Reject configurations that would disable billing entirely.
    pub fn validate(&self) -> Result<()> {
        if self.quota_per_usd <= 0.0 {
            return Err(GatewayError::config("quota_per_usd must be positive"));
        }
        if self.billing_timeout_secs == 0 {
            return Err(GatewayError::config(
                "billing_timeout_secs must be positive",
            ));
        }
        Ok(())
    }

    /// Effective tool-loop round budget; a zero setting falls back to the default.
    pub fn effective_max_tool_rounds(&self) -> u32 {
        if self.max_tool_rounds == 0 {
            Config::default().max_tool_rounds
        } else {
            self.max_tool_rounds
        }
    }
}

fn env_parse<T: std::str::FromStr>(key: &str) -> Option<T> {
    std::env::var(key).ok()?.trim().parse().ok()
}

#[cfg(test)]
mod tests {
    use std::io::Write;

    use super::*;

    #[test]
    fn defaults_are_sane() {
        let config = Config::default();
        assert_eq!(config.max_tool_rounds, 5);
        assert_eq!(config.billing_timeout_secs, 30);
        assert_eq!(config.quota_per_usd, DEFAULT_QUOTA_PER_USD);
        config.validate().expect("default config validates");
    }

    #[test]
    fn zero_round_budget_falls_back_to_default() {
        let config = Config {
            max_tool_rounds: 0,
            ..Config::default()
        };
        assert_eq!(config.effective_max_tool_rounds(), 5);
    }

    #[test]
    fn loads_from_yaml_file() {
        let mut file = tempfile::NamedTempFile::new().expect("temp file");
        writeln!(file, "max_tool_rounds: 7\nbilling_timeout_secs: 10").expect("write yaml");

        let config = Config::from_file(file.path()).expect("load config");
        assert_eq!(config.max_tool_rounds, 7);
        assert_eq!(config.billing_timeout_secs, 10);
        // Unspecified keys keep their defaults.
        assert_eq!(config.quota_per_usd, DEFAULT_QUOTA_PER_USD);
    }

    #[test]
    fn rejects_non_positive_quota_per_usd() {
        let config = Config {
            quota_per_usd: 0.0,
            ..Config::default()
        };
        assert!(config.validate().is_err());
    }
}
