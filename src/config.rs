//! Engine Configuration
//!
//! Runtime knobs for the engine, loadable from YAML:
//!
//! ```yaml
//! workers: 8
//! node_ttl_secs: 86400
//! state_dir: .pipewright
//! retry_policy:
//!   base_wait_ms: 1000
//!   multiplier: 2.0
//!   max_wait_ms: 60000
//! proctor_failure_policy: FAIL_CLOSED
//! ```

use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::barrier::ProctorFailurePolicy;

/// Snapshot directory the CLI uses unless told otherwise.
pub const DEFAULT_STATE_DIR: &str = ".pipewright";

/// Default retention of node executions after a plan ends (7 days).
pub const DEFAULT_NODE_TTL_SECS: u64 = 7 * 24 * 60 * 60;

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("Failed to parse config: {0}")]
    Parse(#[from] serde_yaml::Error),

    #[error("Invalid config: {0}")]
    Invalid(String),
}

/// Exponential backoff used when a RETRY adviser gives no explicit waits.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct RetryPolicy {
    pub base_wait_ms: u64,
    pub multiplier: f64,
    pub max_wait_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_wait_ms: 1_000,
            multiplier: 2.0,
            max_wait_ms: 60_000,
        }
    }
}

impl RetryPolicy {
    /// No wait between attempts.
    pub fn immediate() -> Self {
        Self {
            base_wait_ms: 0,
            multiplier: 1.0,
            max_wait_ms: 0,
        }
    }

    /// Wait before retry number `attempt` (1-based).
    pub fn wait_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(32) as i32;
        let wait = self.base_wait_ms as f64 * self.multiplier.powi(exponent);
        let capped = wait.min(self.max_wait_ms as f64).max(0.0);
        Duration::from_millis(capped as u64)
    }
}

#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(default)]
pub struct EngineConfig {
    /// Concurrent engine jobs on the blocking pool
    pub workers: usize,
    /// How long node executions are kept once their plan has ended
    pub node_ttl_secs: u64,
    /// Where plan execution snapshots are written; `None` (the default)
    /// disables them
    pub state_dir: Option<PathBuf>,
    pub retry_policy: RetryPolicy,
    pub proctor_failure_policy: ProctorFailurePolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            workers: num_cpus::get(),
            node_ttl_secs: DEFAULT_NODE_TTL_SECS,
            state_dir: None,
            retry_policy: RetryPolicy::default(),
            proctor_failure_policy: ProctorFailurePolicy::default(),
        }
    }
}

impl EngineConfig {
    pub fn load(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.display().to_string(),
            source,
        })?;
        let config = Self::parse(&content)?;
        info!("Loaded engine config from {}", path.display());
        Ok(config)
    }

    pub fn parse(content: &str) -> Result<Self, ConfigError> {
        let config: EngineConfig = serde_yaml::from_str(content)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.workers == 0 {
            return Err(ConfigError::Invalid("workers must be at least 1".to_string()));
        }
        if self.retry_policy.multiplier < 1.0 {
            return Err(ConfigError::Invalid(
                "retry_policy.multiplier must be >= 1.0".to_string(),
            ));
        }
        Ok(())
    }

    pub fn node_ttl(&self) -> Duration {
        Duration::from_secs(self.node_ttl_secs)
    }
}
