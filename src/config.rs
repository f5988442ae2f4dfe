//! Engine Configuration
//!
//! Every setting has a default, so an empty file (or no file) is a valid
//! configuration.
//!
//! # Example YAML Format
//!
//! ```yaml
//! model:
//!   model: writer-large
//!   temperature: 0.9
//! retry:
//!   maxRetries: 2
//!   baseDelayMs: 500
//! maxContinuationRounds: 5
//! delays:
//!   beforeNodeMs: 50
//!   afterNodeMs: 100
//! stateDir: .novelflow
//! ```

use std::error::Error;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;

use log::info;
use serde::{Deserialize, Serialize};

use crate::error::EngineError;
use crate::ports::generation::ModelConfig;

/// Retry schedule for failed generation calls.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct RetryPolicy {
    /// Attempts after the first one
    pub max_retries: u32,
    /// Delay before the first retry; doubles per attempt
    pub base_delay_ms: u64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_retries: 2,
            base_delay_ms: 1000,
        }
    }
}

impl RetryPolicy {
    /// No waiting between attempts.
    pub fn immediate() -> Self {
        Self {
            base_delay_ms: 0,
            ..Self::default()
        }
    }

    /// Backoff before retry number `attempt` (0-based).
    pub fn delay(&self, attempt: u32) -> Duration {
        let factor = 2u64.saturating_pow(attempt);
        Duration::from_millis(self.base_delay_ms.saturating_mul(factor))
    }
}

/// Pauses inserted around nodes so observers can follow progress.
#[derive(Serialize, Deserialize, Debug, Clone, Default, PartialEq, Eq)]
#[serde(rename_all = "camelCase", default)]
pub struct DelayPolicy {
    pub before_node_ms: u64,
    pub after_node_ms: u64,
    /// Extra pause after control nodes (grouping, input, loop)
    pub control_node_ms: u64,
}

impl DelayPolicy {
    /// No delays at all.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn before_node(&self) -> Duration {
        Duration::from_millis(self.before_node_ms)
    }

    pub fn after_node(&self, control: bool) -> Duration {
        let extra = if control { self.control_node_ms } else { 0 };
        Duration::from_millis(self.after_node_ms.saturating_add(extra))
    }
}

/// Settings of the execution engine.
#[derive(Serialize, Deserialize, Debug, Clone, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct EngineConfig {
    /// Model settings for nodes without an override
    pub model: ModelConfig,
    pub retry: RetryPolicy,
    /// Extra rounds requested when a list falls short of its target
    pub max_continuation_rounds: u32,
    pub delays: DelayPolicy,
    /// Directory holding workflow snapshots
    pub state_dir: PathBuf,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            model: ModelConfig::default(),
            retry: RetryPolicy::default(),
            max_continuation_rounds: 5,
            delays: DelayPolicy::none(),
            state_dir: PathBuf::from(".novelflow"),
        }
    }
}

impl EngineConfig {
    /// Loads configuration from a YAML file.
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, Box<dyn Error>> {
        let path = path.as_ref();
        let content = fs::read_to_string(path).map_err(|e| {
            format!("Failed to read config file '{}': {}", path.display(), e)
        })?;

        let config: EngineConfig = if content.trim().is_empty() {
            EngineConfig::default()
        } else {
            serde_yaml::from_str(&content)
                .map_err(|e| format!("Failed to parse config file: {}", e))?
        };

        config.validate()?;
        info!("Loaded engine configuration from {}", path.display());
        Ok(config)
    }

    /// Checks settings that would make every run fail.
    pub fn validate(&self) -> Result<(), EngineError> {
        if self.model.model.trim().is_empty() {
            return Err(EngineError::Configuration(
                "no default model configured".to_string(),
            ));
        }
        if !(0.0..=2.0).contains(&self.model.temperature) {
            return Err(EngineError::Configuration(format!(
                "temperature {} is outside 0.0..=2.0",
                self.model.temperature
            )));
        }
        Ok(())
    }

    /// Configuration for tests: no retry waits and no UI delays.
    pub fn immediate() -> Self {
        Self {
            retry: RetryPolicy::immediate(),
            ..Self::default()
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Write;
    use tempfile::NamedTempFile;

    #[test]
    fn test_defaults() {
        let config = EngineConfig::default();
        assert_eq!(config.retry.max_retries, 2);
        assert_eq!(config.max_continuation_rounds, 5);
        assert_eq!(config.delays, DelayPolicy::none());
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_retry_delay_doubles() {
        let policy = RetryPolicy {
            max_retries: 2,
            base_delay_ms: 250,
        };
        assert_eq!(policy.delay(0), Duration::from_millis(250));
        assert_eq!(policy.delay(1), Duration::from_millis(500));
        assert_eq!(policy.delay(2), Duration::from_millis(1000));
        assert_eq!(RetryPolicy::immediate().delay(3), Duration::ZERO);
    }

    #[test]
    fn test_delay_policy_control_extra() {
        let delays = DelayPolicy {
            before_node_ms: 10,
            after_node_ms: 20,
            control_node_ms: 30,
        };
        assert_eq!(delays.after_node(false), Duration::from_millis(20));
        assert_eq!(delays.after_node(true), Duration::from_millis(50));
    }

    #[test]
    fn test_load_partial_file() {
        let mut file = NamedTempFile::new().unwrap();
        writeln!(file, "maxContinuationRounds: 3").unwrap();
        writeln!(file, "retry:").unwrap();
        writeln!(file, "  baseDelayMs: 10").unwrap();

        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config.max_continuation_rounds, 3);
        assert_eq!(config.retry.base_delay_ms, 10);
        assert_eq!(config.retry.max_retries, 2);
    }

    #[test]
    fn test_load_empty_file() {
        let file = NamedTempFile::new().unwrap();
        let config = EngineConfig::load(file.path()).unwrap();
        assert_eq!(config, EngineConfig::default());
    }

    #[test]
    fn test_validate_rejects_blank_model() {
        let mut config = EngineConfig::default();
        config.model.model = " ".to_string();
        assert!(matches!(config.validate(), Err(EngineError::Configuration(_))));
    }
}
