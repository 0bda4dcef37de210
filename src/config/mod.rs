//! Engine configuration
//!
//! Layered merge, lowest precedence first:
//! 1. Built-in defaults
//! 2. Store config (`<store>/engine.toml`, or `--config <path>`)
//! 3. CLI flags
//!
//! Layers are merged as JSON values and the result is deserialized into
//! [`EngineConfig`] and bounds-checked.

mod merge;

pub use merge::{deep_merge, merge_layers};

use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fs;
use std::path::Path;

/// Name of the per-store config file
pub const CONFIG_FILENAME: &str = "engine.toml";

/// Configuration errors
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read {path}: {source}")]
    Io {
        path: String,
        source: std::io::Error,
    },

    #[error("TOML parse error: {0}")]
    Toml(#[from] toml::de::Error),

    #[error("invalid configuration: {0}")]
    Json(#[from] serde_json::Error),

    #[error("{0}")]
    Validation(String),
}

/// Config result type
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Backoff applied to failed steps
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryPolicy {
    /// Delay after the first failure (default: 2)
    pub base_seconds: u64,
    /// Upper bound on any single delay (default: 300)
    pub max_seconds: u64,
    /// Consecutive failures before the strand is marked stuck (default: 8)
    pub max_attempts: u32,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            base_seconds: 2,
            max_seconds: 300,
            max_attempts: 8,
        }
    }
}

impl RetryPolicy {
    /// Delay after the `attempt`-th consecutive failure (1-based):
    /// `min(base * 2^(attempt-1), max)`.
    pub fn backoff(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63);
        let factor = 1u64.checked_shl(exponent).unwrap_or(u64::MAX);
        self.base_seconds
            .saturating_mul(factor)
            .min(self.max_seconds)
    }

    /// Whether `attempts` consecutive failures exhaust the policy
    pub fn exhausted(&self, attempts: u32) -> bool {
        attempts >= self.max_attempts
    }
}

/// Effective engine configuration
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EngineConfig {
    /// Lease length in seconds (default: 60)
    pub lease_seconds: u64,

    /// Inline steps one executor may run per lease (default: 16)
    pub max_steps_per_lease: u32,

    /// Strands claimed per poll (default: 8)
    pub batch_size: usize,

    /// Worker threads for `strand work` (default: 2)
    pub workers: usize,

    /// Idle sleep between polls in milliseconds (default: 500)
    pub poll_interval_ms: u64,

    /// Nap length of wait labels in seconds (default: 1)
    pub nap_poll_seconds: u64,

    pub retry: RetryPolicy,
}

impl Default for EngineConfig {
    fn default() -> Self {
        Self {
            lease_seconds: 60,
            max_steps_per_lease: 16,
            batch_size: 8,
            workers: 2,
            poll_interval_ms: 500,
            nap_poll_seconds: 1,
            retry: RetryPolicy::default(),
        }
    }
}

impl EngineConfig {
    /// Build the effective config from an optional TOML file and CLI
    /// overrides. A missing file is skipped.
    pub fn load(path: Option<&Path>, cli_overrides: Option<Value>) -> ConfigResult<Self> {
        let mut layers = vec![serde_json::to_value(Self::default())?];

        if let Some(path) = path {
            if path.exists() {
                layers.push(load_toml_file(path)?);
                tracing::debug!(path = %path.display(), "loaded engine config");
            }
        }

        if let Some(cli) = cli_overrides {
            layers.push(cli);
        }

        let config: Self = serde_json::from_value(merge_layers(layers))?;
        config.validate()?;
        Ok(config)
    }

    /// Parse a TOML document over the defaults.
    pub fn from_toml(contents: &str) -> ConfigResult<Self> {
        let table: toml::Value = toml::from_str(contents)?;
        let merged = deep_merge(serde_json::to_value(Self::default())?, toml_to_json(table));
        let config: Self = serde_json::from_value(merged)?;
        config.validate()?;
        Ok(config)
    }

    /// Check bounds.
    pub fn validate(&self) -> ConfigResult<()> {
        // lease_seconds must be in [2, 3600]
        if !(2..=3600).contains(&self.lease_seconds) {
            return Err(ConfigError::Validation(
                "lease_seconds must be in [2, 3600]".to_string(),
            ));
        }

        if self.max_steps_per_lease == 0 || self.max_steps_per_lease > 1000 {
            return Err(ConfigError::Validation(
                "max_steps_per_lease must be in (0, 1000]".to_string(),
            ));
        }

        if self.batch_size == 0 || self.batch_size > 1000 {
            return Err(ConfigError::Validation(
                "batch_size must be in (0, 1000]".to_string(),
            ));
        }

        if self.workers == 0 || self.workers > 256 {
            return Err(ConfigError::Validation("workers must be in (0, 256]".to_string()));
        }

        if self.poll_interval_ms == 0 || self.poll_interval_ms > 60_000 {
            return Err(ConfigError::Validation(
                "poll_interval_ms must be in (0, 60000]".to_string(),
            ));
        }

        if self.nap_poll_seconds == 0 || self.nap_poll_seconds > 3600 {
            return Err(ConfigError::Validation(
                "nap_poll_seconds must be in (0, 3600]".to_string(),
            ));
        }

        let retry = &self.retry;
        if retry.base_seconds == 0 || retry.base_seconds > retry.max_seconds {
            return Err(ConfigError::Validation(format!(
                "retry.base_seconds must be in (0, {}]",
                retry.max_seconds
            )));
        }
        if retry.max_seconds > 86_400 {
            return Err(ConfigError::Validation(
                "retry.max_seconds must be at most 86400".to_string(),
            ));
        }
        if retry.max_attempts == 0 {
            return Err(ConfigError::Validation(
                "retry.max_attempts must be positive".to_string(),
            ));
        }

        Ok(())
    }

    pub fn lease(&self) -> chrono::Duration {
        chrono::Duration::seconds(self.lease_seconds as i64)
    }

    pub fn poll_interval(&self) -> std::time::Duration {
        std::time::Duration::from_millis(self.poll_interval_ms)
    }
}

fn load_toml_file(path: &Path) -> ConfigResult<Value> {
    let contents = fs::read_to_string(path).map_err(|source| ConfigError::Io {
        path: path.display().to_string(),
        source,
    })?;
    let table: toml::Value = toml::from_str(&contents)?;
    Ok(toml_to_json(table))
}

/// Convert a TOML value to JSON for merging
fn toml_to_json(toml: toml::Value) -> Value {
    match toml {
        toml::Value::String(s) => Value::String(s),
        toml::Value::Integer(i) => Value::Number(i.into()),
        toml::Value::Float(f) => serde_json::Number::from_f64(f)
            .map(Value::Number)
            .unwrap_or(Value::Null),
        toml::Value::Boolean(b) => Value::Bool(b),
        toml::Value::Datetime(dt) => Value::String(dt.to_string()),
        toml::Value::Array(arr) => Value::Array(arr.into_iter().map(toml_to_json).collect()),
        toml::Value::Table(table) => Value::Object(
            table
                .into_iter()
                .map(|(k, v)| (k, toml_to_json(v)))
                .collect(),
        ),
    }
}
