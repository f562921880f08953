//! Runtime configuration parsing and management.
//!
//! The configuration is read from a YAML file (`strand.yml` by default).
//! Every field has a default, so an empty document is a valid config.
//! A process-wide copy can be installed once with [`RuntimeConfig::install`];
//! components read it through [`current`] when they are constructed.

use once_cell::sync::OnceCell;
use serde::{Deserialize, Serialize};
use std::path::Path;
use std::time::Duration;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ConfigError {
    #[error("Failed to read config file: {0}")]
    ReadError(#[from] std::io::Error),

    #[error("Failed to parse YAML: {0}")]
    ParseError(#[from] serde_yaml::Error),

    #[error("Invalid value for {field}: {reason}")]
    InvalidValue { field: String, reason: String },

    #[error("A runtime configuration is already installed")]
    AlreadyInstalled,
}

/// Main configuration struct matching the strand.yml schema
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct RuntimeConfig {
    #[serde(default)]
    pub transactions: TransactionConfig,

    #[serde(default)]
    pub locks: LockConfig,

    #[serde(default)]
    pub limits: LimitsConfig,

    #[serde(default)]
    pub watchers: WatcherConfig,

    #[serde(default)]
    pub history: HistoryConfig,

    #[serde(default)]
    pub lthreads: LThreadConfig,

    #[serde(default)]
    pub jobs: JobsConfig,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TransactionConfig {
    /// Rollback deadline for transactions started without an explicit timeout
    #[serde(default = "default_tx_timeout_ms")]
    pub default_timeout_ms: u64,

    /// How long a transaction waits for conflicting transactions
    #[serde(default = "default_isolation_wait_ms")]
    pub isolation_wait_timeout_ms: u64,
}

fn default_tx_timeout_ms() -> u64 {
    20_000
}

fn default_isolation_wait_ms() -> u64 {
    5_000
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            default_timeout_ms: default_tx_timeout_ms(),
            isolation_wait_timeout_ms: default_isolation_wait_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LockConfig {
    /// Waiting longer than this on a shared value cancels the holder
    #[serde(default = "default_hold_timeout_ms")]
    pub hold_timeout_ms: u64,
}

fn default_hold_timeout_ms() -> u64 {
    100
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            hold_timeout_ms: default_hold_timeout_ms(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LimitsConfig {
    /// Refill period of the token bucket ticker
    #[serde(default = "default_bucket_tick_us")]
    pub bucket_tick_interval_us: u64,
}

fn default_bucket_tick_us() -> u64 {
    1_000
}

impl Default for LimitsConfig {
    fn default() -> Self {
        Self {
            bucket_tick_interval_us: default_bucket_tick_us(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatcherConfig {
    #[serde(default = "default_watcher_capacity")]
    pub channel_capacity: usize,
}

fn default_watcher_capacity() -> usize {
    10
}

impl Default for WatcherConfig {
    fn default() -> Self {
        Self {
            channel_capacity: default_watcher_capacity(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryConfig {
    #[serde(default = "default_history_length")]
    pub default_max_length: usize,
}

fn default_history_length() -> usize {
    5
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            default_max_length: default_history_length(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LThreadConfig {
    /// Capacity of the process-wide simultaneous instances limiter
    #[serde(default = "default_max_lthreads")]
    pub max_simultaneous_instances: i64,
}

fn default_max_lthreads() -> i64 {
    10_000
}

impl Default for LThreadConfig {
    fn default() -> Self {
        Self {
            max_simultaneous_instances: default_max_lthreads(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct JobsConfig {
    #[serde(default = "default_job_tick_us")]
    pub tick_interval_us: u64,

    /// Paused job instances idle for longer than this are resumed
    #[serde(default = "default_max_idle_ms")]
    pub max_idle_ms: u64,
}

fn default_job_tick_us() -> u64 {
    1_000
}

fn default_max_idle_ms() -> u64 {
    10
}

impl Default for JobsConfig {
    fn default() -> Self {
        Self {
            tick_interval_us: default_job_tick_us(),
            max_idle_ms: default_max_idle_ms(),
        }
    }
}

static INSTALLED: OnceCell<RuntimeConfig> = OnceCell::new();
static DEFAULT: once_cell::sync::Lazy<RuntimeConfig> =
    once_cell::sync::Lazy::new(RuntimeConfig::default);

/// The installed configuration, or the defaults
pub fn current() -> &'static RuntimeConfig {
    INSTALLED.get().unwrap_or(&DEFAULT)
}

impl RuntimeConfig {
    /// Load configuration from a YAML file
    pub fn from_file<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let contents = std::fs::read_to_string(path.as_ref())?;
        Self::from_yaml_str(&contents)
    }

    /// Parse configuration from a YAML document
    pub fn from_yaml_str(contents: &str) -> Result<Self, ConfigError> {
        let config: RuntimeConfig = if contents.trim().is_empty() {
            RuntimeConfig::default()
        } else {
            serde_yaml::from_str(contents)?
        };
        config.validate()?;
        Ok(config)
    }

    pub fn to_yaml(&self) -> Result<String, ConfigError> {
        Ok(serde_yaml::to_string(self)?)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let positive = [
            ("transactions.default_timeout_ms", self.transactions.default_timeout_ms),
            (
                "transactions.isolation_wait_timeout_ms",
                self.transactions.isolation_wait_timeout_ms,
            ),
            ("locks.hold_timeout_ms", self.locks.hold_timeout_ms),
            ("limits.bucket_tick_interval_us", self.limits.bucket_tick_interval_us),
            ("jobs.tick_interval_us", self.jobs.tick_interval_us),
            ("jobs.max_idle_ms", self.jobs.max_idle_ms),
        ];
        for (field, value) in positive {
            if value == 0 {
                return Err(ConfigError::InvalidValue {
                    field: field.to_string(),
                    reason: "must be greater than zero".to_string(),
                });
            }
        }
        if self.watchers.channel_capacity == 0 {
            return Err(ConfigError::InvalidValue {
                field: "watchers.channel_capacity".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        if self.history.default_max_length < 2 {
            return Err(ConfigError::InvalidValue {
                field: "history.default_max_length".to_string(),
                reason: "must be at least 2".to_string(),
            });
        }
        if self.lthreads.max_simultaneous_instances <= 0 {
            return Err(ConfigError::InvalidValue {
                field: "lthreads.max_simultaneous_instances".to_string(),
                reason: "must be greater than zero".to_string(),
            });
        }
        Ok(())
    }

    /// Install this configuration for the whole process.
    ///
    /// Can only be done once, before components read [`current`].
    pub fn install(self) -> Result<(), ConfigError> {
        self.validate()?;
        INSTALLED
            .set(self)
            .map_err(|_| ConfigError::AlreadyInstalled)
    }

    pub fn transaction_timeout(&self) -> Duration {
        Duration::from_millis(self.transactions.default_timeout_ms)
    }

    pub fn isolation_wait_timeout(&self) -> Duration {
        Duration::from_millis(self.transactions.isolation_wait_timeout_ms)
    }

    pub fn lock_hold_timeout(&self) -> Duration {
        Duration::from_millis(self.locks.hold_timeout_ms)
    }

    pub fn bucket_tick_interval(&self) -> Duration {
        Duration::from_micros(self.limits.bucket_tick_interval_us)
    }

    pub fn job_tick_interval(&self) -> Duration {
        Duration::from_micros(self.jobs.tick_interval_us)
    }

    pub fn job_max_idle(&self) -> Duration {
        Duration::from_millis(self.jobs.max_idle_ms)
    }
}
