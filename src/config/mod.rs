//! Application configuration.
//!
//! Aggregates configuration for all components into a single Config struct
//! that can be loaded from YAML files or environment variables.

mod limits;

pub use limits::{OperationLimit, RateLimitSettings};

use std::time::Duration;

use serde::Deserialize;

use crate::executor::{BreakerConfig, RetryConfig};

/// Default configuration file name.
pub const DEFAULT_CONFIG_FILE: &str = "config.yaml";
/// Environment variable for configuration file path.
pub const CONFIG_ENV_VAR: &str = "PUNCHCARD_CONFIG";
/// Prefix for configuration environment variables.
pub const CONFIG_ENV_PREFIX: &str = "PUNCHCARD";
/// Environment variable for logging configuration.
pub const LOG_ENV_VAR: &str = "PUNCHCARD_LOG";

/// Errors that can occur while loading configuration.
#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("configuration error: {0}")]
    Load(#[from] ::config::ConfigError),
}

/// Storage configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StorageConfig {
    /// Storage backend discriminator: "sqlite" or "memory".
    pub storage_type: String,
    /// Database path (sqlite only).
    pub path: String,
}

impl Default for StorageConfig {
    fn default() -> Self {
        Self {
            storage_type: "sqlite".to_string(),
            path: "data/punchcard.db".to_string(),
        }
    }
}

/// Resilient-executor configuration: retry policy plus circuit breaker.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ExecutorConfig {
    /// Maximum retry attempts after the initial call.
    pub max_retries: u32,
    /// Base backoff delay in milliseconds.
    pub initial_delay_ms: u64,
    /// Backoff delay cap in milliseconds.
    pub max_delay_ms: u64,
    /// Exponential growth factor between attempts.
    pub backoff_factor: u32,
    /// Jitter factor applied to each delay.
    pub jitter: f64,
    /// Upper bound on a single store call in milliseconds.
    pub per_call_timeout_ms: u64,
    /// Consecutive retryable failures before the circuit opens.
    pub breaker_failure_threshold: u32,
    /// Circuit cool-down in seconds before a half-open probe.
    pub breaker_cooldown_secs: u64,
}

impl Default for ExecutorConfig {
    fn default() -> Self {
        Self {
            max_retries: 3,
            initial_delay_ms: 100,
            max_delay_ms: 3_000,
            backoff_factor: 2,
            jitter: 0.15,
            per_call_timeout_ms: 10_000,
            breaker_failure_threshold: 5,
            breaker_cooldown_secs: 30,
        }
    }
}

impl ExecutorConfig {
    pub fn retry(&self) -> RetryConfig {
        RetryConfig {
            initial_delay: Duration::from_millis(self.initial_delay_ms),
            max_delay: Duration::from_millis(self.max_delay_ms),
            max_retries: self.max_retries,
            backoff_factor: self.backoff_factor,
            jitter: self.jitter,
            per_call_timeout: Duration::from_millis(self.per_call_timeout_ms),
        }
    }

    pub fn breaker(&self) -> BreakerConfig {
        BreakerConfig {
            failure_threshold: self.breaker_failure_threshold,
            cooldown: Duration::from_secs(self.breaker_cooldown_secs),
        }
    }
}

/// Notification fan-out configuration.
#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct FanoutConfig {
    /// Dedup retention window in seconds.
    pub dedup_ttl_secs: u64,
    /// Dedup cache capacity (event ids).
    pub dedup_capacity: usize,
    /// In-process broadcast channel capacity.
    pub channel_capacity: usize,
    /// Peer endpoints for the webhook broadcast channel.
    pub webhook_endpoints: Vec<String>,
    /// Per-request webhook timeout in milliseconds.
    pub webhook_timeout_ms: u64,
}

impl Default for FanoutConfig {
    fn default() -> Self {
        Self {
            dedup_ttl_secs: 300,
            dedup_capacity: 4_096,
            channel_capacity: 1_024,
            webhook_endpoints: Vec::new(),
            webhook_timeout_ms: 5_000,
        }
    }
}

impl FanoutConfig {
    pub fn dedup_ttl(&self) -> Duration {
        Duration::from_secs(self.dedup_ttl_secs)
    }

    pub fn webhook_timeout(&self) -> Duration {
        Duration::from_millis(self.webhook_timeout_ms)
    }
}

/// Main application configuration.
#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Storage configuration.
    pub storage: StorageConfig,
    /// Executor retry and breaker configuration.
    pub executor: ExecutorConfig,
    /// Rate-limit policy table.
    pub limits: RateLimitSettings,
    /// Notification fan-out configuration.
    pub fanout: FanoutConfig,
}

impl Config {
    /// Load configuration from file and environment.
    ///
    /// Configuration sources (in order of priority, later overrides earlier):
    /// 1. `config.yaml` in current directory (if exists)
    /// 2. File specified by `path` argument (if provided)
    /// 3. File specified by `PUNCHCARD_CONFIG` environment variable (if set)
    /// 4. Environment variables with `PUNCHCARD` prefix
    pub fn load(path: Option<&str>) -> Result<Self, ConfigError> {
        use ::config::{Config as ConfigLib, Environment, File, FileFormat};

        let mut builder = ConfigLib::builder()
            .add_source(File::new("config", FileFormat::Yaml).required(false))
            .add_source(File::new(DEFAULT_CONFIG_FILE, FileFormat::Yaml).required(false));

        if let Some(config_path) = path {
            builder = builder.add_source(File::new(config_path, FileFormat::Yaml).required(true));
        }

        if let Ok(config_path) = std::env::var(CONFIG_ENV_VAR) {
            builder = builder.add_source(File::new(&config_path, FileFormat::Yaml).required(true));
        }

        let config = builder
            .add_source(
                Environment::with_prefix(CONFIG_ENV_PREFIX)
                    .prefix_separator("__")
                    .separator("__")
                    .try_parsing(true),
            )
            .build()?;

        Ok(config.try_deserialize()?)
    }
}

#[cfg(test)]
mod tests {
    use serial_test::serial;

    use super::*;

    #[test]
    #[serial]
    fn test_defaults_without_files() {
        let config = Config::load(None).expect("load");

        assert_eq!(config.storage.storage_type, "sqlite");
        assert_eq!(config.executor.max_retries, 3);
        assert_eq!(config.executor.breaker_failure_threshold, 5);
        assert_eq!(config.executor.breaker_cooldown_secs, 30);
        assert_eq!(config.limits.credit.max_attempts, 30);
        assert!(config.fanout.webhook_endpoints.is_empty());
    }

    #[test]
    #[serial]
    fn test_env_override() {
        std::env::set_var("PUNCHCARD__STORAGE__STORAGE_TYPE", "memory");
        std::env::set_var("PUNCHCARD__EXECUTOR__MAX_RETRIES", "7");

        let config = Config::load(None).expect("load");
        assert_eq!(config.storage.storage_type, "memory");
        assert_eq!(config.executor.max_retries, 7);

        std::env::remove_var("PUNCHCARD__STORAGE__STORAGE_TYPE");
        std::env::remove_var("PUNCHCARD__EXECUTOR__MAX_RETRIES");
    }

    #[test]
    fn test_executor_config_conversion() {
        let executor = ExecutorConfig::default();
        let retry = executor.retry();
        let breaker = executor.breaker();

        assert_eq!(retry.initial_delay, Duration::from_millis(100));
        assert_eq!(retry.max_delay, Duration::from_secs(3));
        assert_eq!(retry.per_call_timeout, Duration::from_secs(10));
        assert_eq!(breaker.failure_threshold, 5);
        assert_eq!(breaker.cooldown, Duration::from_secs(30));
    }
}
