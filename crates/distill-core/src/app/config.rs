//! Configuration for the orchestrator and the extraction pipeline.
//!
//! Every field has a default, so an empty TOML document is a valid config.
//! Durations are written in milliseconds:
//!
//! ```toml
//! [orchestrator]
//! poll_interval_ms = 500
//! max_concurrent = 4
//!
//! [orchestrator.backoff]
//! base_delay_ms = 2000
//!
//! [pipeline]
//! extraction_tier = "large"
//! ```

use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::domain::BackoffConfig;
use crate::ports::Tier;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("failed to parse config: {0}")]
    Parse(#[from] toml::de::Error),

    #[error("invalid config: {0}")]
    Invalid(String),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct OrchestratorConfig {
    pub poll_interval_ms: u64,
    pub max_concurrent: usize,
    /// A Processing task older than this is presumed orphaned at recovery.
    pub stale_threshold_ms: u64,
    pub max_attempts: u32,
    pub backoff: BackoffConfig,
    /// Start polling as soon as `initialize` finishes.
    pub auto_start: bool,
}

impl Default for OrchestratorConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 1_000,
            max_concurrent: 3,
            stale_threshold_ms: 5 * 60 * 1_000,
            max_attempts: 3,
            backoff: BackoffConfig::default(),
            auto_start: true,
        }
    }
}

impl OrchestratorConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms)
    }

    pub fn stale_threshold(&self) -> Duration {
        Duration::from_millis(self.stale_threshold_ms)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.poll_interval_ms == 0 {
            return Err(ConfigError::Invalid("poll_interval_ms must be > 0".into()));
        }
        if self.max_concurrent == 0 {
            return Err(ConfigError::Invalid("max_concurrent must be > 0".into()));
        }
        if self.max_attempts == 0 {
            return Err(ConfigError::Invalid("max_attempts must be > 0".into()));
        }
        if self.backoff.multiplier < 1.0 {
            return Err(ConfigError::Invalid("backoff.multiplier must be >= 1.0".into()));
        }
        if self.backoff.base_delay_ms > self.backoff.max_delay_ms {
            return Err(ConfigError::Invalid(
                "backoff.base_delay_ms must not exceed backoff.max_delay_ms".into(),
            ));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct PipelineConfig {
    pub context_budget_tokens: usize,
    /// Share of the context budget reserved for the preceding summary.
    pub summary_fraction: f64,
    pub max_recent_claims: usize,
    pub max_entities: usize,
    pub max_recent_propositions: usize,
    pub extraction_tier: Tier,
    /// Active claims not referenced for this long become dormant.
    pub dormancy_days: u32,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            context_budget_tokens: 4_096,
            summary_fraction: 0.25,
            max_recent_claims: 10,
            max_entities: 20,
            max_recent_propositions: 10,
            extraction_tier: Tier::Medium,
            dormancy_days: 30,
        }
    }
}

impl PipelineConfig {
    pub fn dormancy_window(&self) -> chrono::Duration {
        chrono::Duration::days(i64::from(self.dormancy_days))
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if !(0.0..=1.0).contains(&self.summary_fraction) {
            return Err(ConfigError::Invalid(
                "summary_fraction must be within [0, 1]".into(),
            ));
        }
        if self.context_budget_tokens == 0 {
            return Err(ConfigError::Invalid("context_budget_tokens must be > 0".into()));
        }
        Ok(())
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct DistillConfig {
    pub orchestrator: OrchestratorConfig,
    pub pipeline: PipelineConfig,
}

impl DistillConfig {
    pub fn from_toml_str(s: &str) -> Result<Self, ConfigError> {
        let config: DistillConfig = toml::from_str(s)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_toml_str(&raw)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        self.orchestrator.validate()?;
        self.pipeline.validate()
    }
}
