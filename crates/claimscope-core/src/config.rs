//! Engine configuration.
//!
//! Durations are stored as integer milliseconds or seconds so the struct
//! round-trips through JSON unchanged. Values come from [`Default`], a JSON
//! file, or `CLAIMSCOPE_*` environment variables layered over either.

use std::path::Path;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::ConfigError;
use crate::executor::RetryPolicy;
use crate::verdict::VerdictPolicy;

/// Domains whose harnesses bill LLM tokens and so need a minimum budget.
pub const LLM_PRICED_DOMAINS: &[&str] = &["coding", "reasoning-math"];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent workers in the pool
    pub workers: usize,
    /// Idle sleep between lease attempts (milliseconds)
    pub poll_interval_ms: u64,
    /// Period of the expired-lease sweep (milliseconds)
    pub reap_interval_ms: u64,
    /// Added to the claim timeout when computing lease expiry (seconds)
    pub lease_grace_s: u64,
    /// Lease expiries tolerated before a run is failed as `worker_lost`;
    /// leases released on shutdown do not count
    pub max_lease_attempts: u32,
    pub retry: RetryPolicy,
    /// Spend allowed above `budget_usd` (USD)
    pub budget_tolerance_usd: f64,
    pub min_llm_budget_usd: f64,
    pub verdict: VerdictPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            poll_interval_ms: 500,
            reap_interval_ms: 5_000,
            lease_grace_s: 60,
            max_lease_attempts: 3,
            retry: RetryPolicy::default(),
            budget_tolerance_usd: 0.001,
            min_llm_budget_usd: 0.02,
            verdict: VerdictPolicy::default(),
        }
    }
}

fn env_parse<T: FromStr>(key: &str) -> Result<Option<T>, ConfigError> {
    match std::env::var(key) {
        Ok(raw) if !raw.trim().is_empty() => raw
            .trim()
            .parse::<T>()
            .map(Some)
            .map_err(|_| ConfigError::invalid(key, format!("cannot parse {raw:?}"))),
        _ => Ok(None),
    }
}

impl EngineConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn reap_interval(&self) -> Duration {
        Duration::from_millis(self.reap_interval_ms)
    }

    pub fn lease_grace(&self) -> Duration {
        Duration::from_secs(self.lease_grace_s)
    }

    /// Minimum budget for `domain`, if it is LLM-priced.
    pub fn min_budget_for(&self, domain: &str) -> Option<f64> {
        LLM_PRICED_DOMAINS
            .iter()
            .any(|d| d.eq_ignore_ascii_case(domain))
            .then_some(self.min_llm_budget_usd)
    }

    /// Defaults overlaid with environment variables, validated.
    pub fn from_env() -> Result<Self, ConfigError> {
        let mut config = Self::default();
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    /// Load a JSON file, overlay environment variables, validate.
    pub fn from_file(path: &Path) -> Result<Self, ConfigError> {
        let raw = std::fs::read_to_string(path)?;
        let mut config: Self = serde_json::from_str(&raw)?;
        config.apply_env()?;
        config.validate()?;
        Ok(config)
    }

    fn apply_env(&mut self) -> Result<(), ConfigError> {
        if let Some(v) = env_parse("CLAIMSCOPE_WORKERS")? {
            self.workers = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_POLL_INTERVAL_MS")? {
            self.poll_interval_ms = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_REAP_INTERVAL_MS")? {
            self.reap_interval_ms = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_LEASE_GRACE_S")? {
            self.lease_grace_s = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_MAX_LEASE_ATTEMPTS")? {
            self.max_lease_attempts = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_RETRY_ATTEMPTS")? {
            self.retry.max_attempts = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_RETRY_BASE_MS")? {
            self.retry.backoff_base_ms = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_BUDGET_TOLERANCE_USD")? {
            self.budget_tolerance_usd = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_MIN_LLM_BUDGET_USD")? {
            self.min_llm_budget_usd = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_CI_Z")? {
            self.verdict.confidence_z = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_NOT_REPRODUCED_MARGIN")? {
            self.verdict.not_reproduced_margin = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_DRIFT_MARGIN")? {
            self.verdict.drift_margin = v;
        }
        if let Some(v) = env_parse("CLAIMSCOPE_BOOTSTRAP_SEED")? {
            self.verdict.bootstrap_seed = v;
        }
        Ok(())
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::invalid("workers", "must be at least 1"));
        }
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::invalid("poll_interval_ms", "must be positive"));
        }
        if self.reap_interval_ms == 0 {
            return Err(ConfigError::invalid("reap_interval_ms", "must be positive"));
        }
        if self.max_lease_attempts == 0 {
            return Err(ConfigError::invalid("max_lease_attempts", "must be at least 1"));
        }
        for (field, value) in [
            ("budget_tolerance_usd", self.budget_tolerance_usd),
            ("min_llm_budget_usd", self.min_llm_budget_usd),
        ] {
            if !(value.is_finite() && value >= 0.0) {
                return Err(ConfigError::invalid(field, "must be a non-negative number"));
            }
        }
        self.retry.validate()?;
        self.verdict.validate()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;

    #[test]
    fn defaults_are_valid() {
        let config = EngineConfig::default();
        config.validate().unwrap();
        assert_eq!(config.workers, 2);
        assert_eq!(config.poll_interval(), Duration::from_millis(500));
        assert_eq!(config.lease_grace(), Duration::from_secs(60));
        assert_eq!(config.retry.max_attempts, 3);
    }

    #[test]
    fn llm_domains_have_minimum_budget() {
        let config = EngineConfig::default();
        assert_eq!(config.min_budget_for("coding"), Some(0.02));
        assert_eq!(config.min_budget_for("Reasoning-Math"), Some(0.02));
        assert_eq!(config.min_budget_for("gui-agents"), None);
    }

    #[test]
    fn rejects_zero_workers() {
        let config = EngineConfig {
            workers: 0,
            ..Default::default()
        };
        assert!(matches!(config.validate(), Err(ConfigError::Invalid { ref field, .. }) if field == "workers"));
    }

    #[test]
    fn partial_file_keeps_defaults() {
        let mut file = tempfile::NamedTempFile::new().unwrap();
        write!(file, r#"{{"workers": 8, "verdict": {{"drift_margin": 0.1}}}}"#).unwrap();

        let config = EngineConfig::from_file(file.path()).unwrap();
        assert_eq!(config.workers, 8);
        assert_eq!(config.verdict.drift_margin, 0.1);
        assert_eq!(config.verdict.not_reproduced_margin, 0.05);
        assert_eq!(config.max_lease_attempts, 3);
    }
}
