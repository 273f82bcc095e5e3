//! Configuration management for the metrics engine.
//!
//! This module provides configuration handling with:
//! - YAML file support
//! - Environment variable and CLI overrides (applied by the CLI layer)
//! - Validation and defaults

use crate::core::{MetricsError, Result};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);
const DAY: Duration = Duration::from_secs(86_400);

/// Complete configuration
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct Config {
    /// Metrics engine configuration
    pub metrics: MetricsConfig,
    /// Logging configuration
    pub logging: LoggingConfig,
    /// Debug mode
    #[serde(skip)]
    pub debug: bool,
}

/// Metrics engine configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct MetricsConfig {
    /// Master switch; when off every ingestion call is a no-op
    pub enabled: bool,
    /// How often buffered samples are flushed into minute buckets
    #[serde(with = "humantime_serde")]
    pub flush_interval: Duration,
    /// SQLite database file
    pub storage_path: PathBuf,
    /// How often the rollup/retention job runs
    #[serde(with = "humantime_serde")]
    pub rollup_interval: Duration,
    /// Per-resolution retention windows
    pub retention: RetentionConfig,
    /// Raw samples a single key may hold between flushes
    pub max_buffered_samples: usize,
    /// Buckets kept for retry after a failed flush
    pub max_pending_buckets: usize,
    /// Time allowed for workers to finish during shutdown
    #[serde(with = "humantime_serde")]
    pub shutdown_timeout: Duration,
}

/// Retention windows per resolution
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct RetentionConfig {
    /// Age after which minute buckets are rolled into hours
    #[serde(with = "humantime_serde")]
    pub minute_data: Duration,
    /// Age after which hour buckets are rolled into days
    #[serde(with = "humantime_serde")]
    pub hour_data: Duration,
    /// Age after which day buckets are deleted
    #[serde(with = "humantime_serde")]
    pub day_data: Duration,
}

/// Logging configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct LoggingConfig {
    /// Log level
    pub level: LogLevel,
}

/// Log levels
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Trace,
    Debug,
    Info,
    Warn,
    Error,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        MetricsConfig {
            enabled: true,
            flush_interval: MINUTE,
            storage_path: PathBuf::from("./tsmetrics_data/metrics.db"),
            rollup_interval: HOUR,
            retention: RetentionConfig::default(),
            max_buffered_samples: 100_000,
            max_pending_buckets: 100_000,
            shutdown_timeout: Duration::from_secs(10),
        }
    }
}

impl Default for RetentionConfig {
    fn default() -> Self {
        RetentionConfig {
            minute_data: DAY,          // 24 hours of minute data
            hour_data: DAY * 7,        // one week of hour data
            day_data: DAY * 365,       // one year of day data
        }
    }
}

impl Default for LoggingConfig {
    fn default() -> Self {
        LoggingConfig {
            level: LogLevel::Info,
        }
    }
}

impl Config {
    /// Create new config with defaults
    pub fn new() -> Result<Self> {
        let config = Config::default();
        config.validate()?;
        Ok(config)
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<()> {
        let metrics = &self.metrics;

        if metrics.flush_interval.is_zero() {
            return Err(MetricsError::config("flush_interval must be greater than 0"));
        }

        if metrics.rollup_interval.is_zero() {
            return Err(MetricsError::config("rollup_interval must be greater than 0"));
        }

        if metrics.storage_path.as_os_str().is_empty() {
            return Err(MetricsError::config("storage_path must not be empty"));
        }

        let retention = &metrics.retention;
        if retention.minute_data < MINUTE {
            return Err(MetricsError::config(format!(
                "minute_data retention must be at least 1m, got {}",
                humantime::format_duration(retention.minute_data)
            )));
        }
        if retention.hour_data < HOUR {
            return Err(MetricsError::config(format!(
                "hour_data retention must be at least 1h, got {}",
                humantime::format_duration(retention.hour_data)
            )));
        }
        if retention.day_data < DAY {
            return Err(MetricsError::config(format!(
                "day_data retention must be at least 1d, got {}",
                humantime::format_duration(retention.day_data)
            )));
        }
        if retention.minute_data > retention.hour_data || retention.hour_data > retention.day_data
        {
            return Err(MetricsError::config(
                "retention windows must satisfy minute_data <= hour_data <= day_data",
            ));
        }

        if metrics.max_buffered_samples == 0 {
            return Err(MetricsError::config("max_buffered_samples must be greater than 0"));
        }

        if metrics.max_pending_buckets == 0 {
            return Err(MetricsError::config("max_pending_buckets must be greater than 0"));
        }

        Ok(())
    }
}

impl LogLevel {
    /// Convert to tracing filter string
    pub fn as_str(&self) -> &'static str {
        match self {
            LogLevel::Trace => "trace",
            LogLevel::Debug => "debug",
            LogLevel::Info => "info",
            LogLevel::Warn => "warn",
            LogLevel::Error => "error",
        }
    }
}

/// Configuration builder for programmatic construction
pub struct ConfigBuilder {
    config: Config,
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}

impl ConfigBuilder {
    /// Create a new builder with defaults
    pub fn new() -> Self {
        ConfigBuilder {
            config: Config::default(),
        }
    }

    /// Load configuration from YAML string
    pub fn from_yaml(mut self, yaml: &str) -> Result<Self> {
        self.config = serde_yaml::from_str(yaml)
            .map_err(|e| MetricsError::config(format!("Failed to parse YAML config: {}", e)))?;
        Ok(self)
    }

    /// Enable or disable collection
    pub fn enabled(mut self, enabled: bool) -> Self {
        self.config.metrics.enabled = enabled;
        self
    }

    /// Set the database file
    pub fn storage_path(mut self, path: PathBuf) -> Self {
        self.config.metrics.storage_path = path;
        self
    }

    /// Set flush interval
    pub fn flush_interval(mut self, interval: Duration) -> Self {
        self.config.metrics.flush_interval = interval;
        self
    }

    /// Set rollup interval
    pub fn rollup_interval(mut self, interval: Duration) -> Self {
        self.config.metrics.rollup_interval = interval;
        self
    }

    /// Set all three retention windows
    pub fn retention(mut self, minute_data: Duration, hour_data: Duration, day_data: Duration) -> Self {
        self.config.metrics.retention = RetentionConfig {
            minute_data,
            hour_data,
            day_data,
        };
        self
    }

    /// Set per-key sample cap
    pub fn max_buffered_samples(mut self, count: usize) -> Self {
        self.config.metrics.max_buffered_samples = count;
        self
    }

    /// Set shutdown timeout
    pub fn shutdown_timeout(mut self, timeout: Duration) -> Self {
        self.config.metrics.shutdown_timeout = timeout;
        self
    }

    /// Set debug mode
    pub fn debug(mut self, debug: bool) -> Self {
        self.config.debug = debug;
        self
    }

    /// Build and validate the configuration
    pub fn build(self) -> Result<Config> {
        self.config.validate()?;
        Ok(self.config)
    }
}
