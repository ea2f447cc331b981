//! Database configuration
//!
//! Loaded from a JSON file, then overridden by `ROLLUP_DB_*` environment
//! variables. Retry budgets, backoff curves and the confirmation timeout
//! are operational parameters and live here.

use crate::merkle::ABSOLUTE_MAX_HEIGHT;
use crate::{Error, Result};
use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};

/// Which storage backend to open
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum BackendConfig {
    /// Process-local, lost on exit
    Memory,
    /// Single-file store at `path`
    File { path: PathBuf },
}

/// Bounded exponential backoff
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
pub struct RetryPolicy {
    /// Attempts before a failure becomes terminal
    pub max_attempts: u32,
    pub base_delay_ms: u64,
    pub max_delay_ms: u64,
    /// Backoff multiplier (e.g., 2.0 for doubling)
    pub multiplier: f64,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        RetryPolicy {
            max_attempts: 5,
            base_delay_ms: 500,
            max_delay_ms: 60_000,
            multiplier: 2.0,
        }
    }
}

impl RetryPolicy {
    /// Retries with no delay between attempts
    pub fn immediate(max_attempts: u32) -> Self {
        RetryPolicy {
            max_attempts,
            base_delay_ms: 0,
            max_delay_ms: 0,
            multiplier: 1.0,
        }
    }

    /// Delay before retrying after the `attempt`-th failure (1-based)
    pub fn delay_ms(&self, attempt: u32) -> u64 {
        let exponent = attempt.saturating_sub(1).min(63) as i32;
        let delay = self.base_delay_ms as f64 * self.multiplier.powi(exponent);
        if delay.is_finite() {
            (delay as u64).min(self.max_delay_ms)
        } else {
            self.max_delay_ms
        }
    }

    /// Whether another attempt is allowed after `attempts` failures
    pub fn allows_retry(&self, attempts: u32) -> bool {
        attempts < self.max_attempts
    }
}

/// Top-level configuration
#[derive(Clone, Debug, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    pub backend: BackendConfig,
    /// Largest tree height a collection may be created with
    pub max_height: u8,
    /// Height used when a collection is created without one
    pub default_height: u8,
    /// Retry budget for per-action proof tasks
    pub task_retry: RetryPolicy,
    /// Backoff after a failed aggregate proof
    pub rollup_retry: RetryPolicy,
    /// How long a submitted rollup may stay unconfirmed before it is
    /// re-verified against chain state
    pub confirmation_timeout_ms: u64,
    /// Most actions folded into one rollup
    pub max_batch_size: usize,
    /// Archived rollup records kept per collection
    pub history_limit: usize,
    /// Proving threads of a [`WorkerPool`](crate::WorkerPool)
    pub workers: usize,
}

impl Default for Config {
    fn default() -> Self {
        Config {
            backend: BackendConfig::Memory,
            max_height: 32,
            default_height: 20,
            task_retry: RetryPolicy::default(),
            rollup_retry: RetryPolicy::default(),
            confirmation_timeout_ms: 600_000,
            max_batch_size: 64,
            history_limit: 256,
            workers: 4,
        }
    }
}

impl Config {
    /// In-memory configuration with zero backoff, for tests and tooling
    pub fn in_memory() -> Self {
        Config {
            task_retry: RetryPolicy::immediate(3),
            rollup_retry: RetryPolicy::immediate(3),
            ..Default::default()
        }
    }

    /// File-backed configuration
    pub fn with_file(path: impl Into<PathBuf>) -> Self {
        Config {
            backend: BackendConfig::File { path: path.into() },
            ..Default::default()
        }
    }

    /// Default config file location (~/.config/rollup_db/config.json)
    pub fn default_path() -> Result<PathBuf> {
        let dir = dirs::config_dir()
            .ok_or_else(|| Error::Config("Could not find config directory".into()))?
            .join("rollup_db");
        Ok(dir.join("config.json"))
    }

    /// Load from a JSON file; a missing file yields defaults
    pub fn load(path: &Path) -> Result<Self> {
        if !path.exists() {
            return Ok(Self::default());
        }
        let content = std::fs::read_to_string(path)
            .map_err(|e| Error::Config(format!("Failed to read {}: {}", path.display(), e)))?;
        let config: Config = serde_json::from_str(&content)
            .map_err(|e| Error::Config(format!("Failed to parse {}: {}", path.display(), e)))?;
        config.validate()?;
        Ok(config)
    }

    /// Save as pretty JSON, creating parent directories
    pub fn save(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.as_os_str().is_empty() {
                std::fs::create_dir_all(parent)?;
            }
        }
        let content = serde_json::to_string_pretty(self)?;
        std::fs::write(path, content)?;
        Ok(())
    }

    /// Apply `ROLLUP_DB_*` environment overrides
    pub fn with_env(self) -> Result<Self> {
        self.with_overrides(|key| std::env::var(key).ok())
    }

    /// Apply overrides from an arbitrary lookup (environment in production)
    pub fn with_overrides(mut self, lookup: impl Fn(&str) -> Option<String>) -> Result<Self> {
        if let Some(path) = lookup("ROLLUP_DB_PATH") {
            self.backend = BackendConfig::File { path: path.into() };
        }
        if let Some(kind) = lookup("ROLLUP_DB_BACKEND") {
            match kind.as_str() {
                "memory" => self.backend = BackendConfig::Memory,
                "file" => {
                    if !matches!(self.backend, BackendConfig::File { .. }) {
                        return Err(Error::Config(
                            "ROLLUP_DB_BACKEND=file requires ROLLUP_DB_PATH".into(),
                        ));
                    }
                }
                other => {
                    return Err(Error::Config(format!("Unknown backend: {}", other)));
                }
            }
        }
        if let Some(v) = lookup("ROLLUP_DB_MAX_HEIGHT") {
            self.max_height = v
                .parse()
                .map_err(|_| Error::Config(format!("Invalid ROLLUP_DB_MAX_HEIGHT: {}", v)))?;
        }
        if let Some(v) = lookup("ROLLUP_DB_WORKERS") {
            self.workers = v
                .parse()
                .map_err(|_| Error::Config(format!("Invalid ROLLUP_DB_WORKERS: {}", v)))?;
        }
        self.validate()?;
        Ok(self)
    }

    /// Reject settings the engine cannot honor
    pub fn validate(&self) -> Result<()> {
        if self.max_height < 1 || self.max_height > ABSOLUTE_MAX_HEIGHT {
            return Err(Error::Config(format!(
                "max_height must be within 1..={}",
                ABSOLUTE_MAX_HEIGHT
            )));
        }
        if self.default_height < 1 || self.default_height > self.max_height {
            return Err(Error::Config(format!(
                "default_height {} exceeds max_height {}",
                self.default_height, self.max_height
            )));
        }
        if self.max_batch_size == 0 {
            return Err(Error::Config("max_batch_size must be positive".into()));
        }
        if self.workers == 0 {
            return Err(Error::Config("workers must be positive".into()));
        }
        if self.task_retry.max_attempts == 0 || self.rollup_retry.max_attempts == 0 {
            return Err(Error::Config("retry budgets must allow one attempt".into()));
        }
        Ok(())
    }
}
