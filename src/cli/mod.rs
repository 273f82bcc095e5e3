//! Command-line interface for tsmetrics.
//!
//! Inspects a metrics database (keys, history, current values, row counts),
//! runs maintenance on demand, or hosts the engine in the foreground until
//! Ctrl-C.

use crate::core::config::ConfigBuilder;
use crate::core::{Config, LogLevel, MetricsError, Result};
use crate::engine::MetricsEngine;
use crate::metrics::{MetricPoint, Resolution};
use chrono::{DateTime, Utc};
use clap::{Parser, Subcommand};
use serde::Serialize;
use std::path::PathBuf;
use std::time::Duration;

/// Embedded time-series metrics with minute/hour/day rollups
#[derive(Parser, Debug)]
#[command(name = "tsmetrics")]
#[command(version, about, long_about = None)]
pub struct Cli {
    /// Configuration file path (default: ~/.config/tsmetrics/config.yaml)
    #[arg(short, long, env = "TSMETRICS_CONFIG")]
    pub config: Option<PathBuf>,

    /// SQLite database file
    #[arg(long, env = "TSMETRICS_STORAGE_PATH")]
    pub storage_path: Option<PathBuf>,

    /// Enable debug logging
    #[arg(short, long, env = "TSMETRICS_DEBUG")]
    pub debug: bool,

    /// Print results as JSON
    #[arg(long, global = true)]
    pub json: bool,

    #[command(subcommand)]
    pub command: Command,
}

/// Subcommands
#[derive(Subcommand, Debug, Clone, PartialEq, Eq)]
pub enum Command {
    /// List every known metric with its type and unit
    Keys,
    /// Show bucketed history for one metric
    History {
        /// Metric key
        key: String,
        /// Look back this far from now, e.g. "90m" or "2days" (default: 1h)
        #[arg(long, conflicts_with = "from")]
        since: Option<String>,
        /// Range start (RFC 3339)
        #[arg(long)]
        from: Option<String>,
        /// Range end (RFC 3339, default: now)
        #[arg(long)]
        to: Option<String>,
        /// minute, hour or day
        #[arg(short, long, default_value = "minute")]
        resolution: String,
    },
    /// Show the current value of one or more metrics
    Aggregate {
        /// Metric keys
        #[arg(required = true)]
        keys: Vec<String>,
    },
    /// Show row counts per resolution
    Stats,
    /// Run one rollup/retention pass now
    Rollup,
    /// Run the engine in the foreground until Ctrl-C
    Run,
    /// Validate configuration and exit
    CheckConfig,
}

impl Cli {
    /// Parse command-line arguments.
    pub fn parse_args() -> Self {
        Cli::parse()
    }

    /// Load configuration with proper precedence:
    /// 1. CLI arguments (highest priority)
    /// 2. Environment variables
    /// 3. Config file
    /// 4. Defaults (lowest priority)
    pub async fn load_config(&self) -> Result<Config> {
        let mut builder = ConfigBuilder::new();

        let config_path = if let Some(path) = &self.config {
            path.clone()
        } else {
            let default_path = dirs::config_dir()
                .map(|d| d.join("tsmetrics").join("config.yaml"))
                .unwrap_or_else(|| PathBuf::from("~/.config/tsmetrics/config.yaml"));

            if default_path.exists() {
                default_path
            } else {
                return self.build_config_from_args(builder);
            }
        };

        match tokio::fs::read_to_string(&config_path).await {
            Ok(content) => {
                builder = builder.from_yaml(&content)?;
            },
            Err(e) if self.config.is_some() => {
                return Err(MetricsError::config(format!(
                    "Failed to read config file {}: {}",
                    config_path.display(),
                    e
                )));
            },
            Err(_) => {},
        }

        self.build_config_from_args(builder)
    }

    fn build_config_from_args(&self, mut builder: ConfigBuilder) -> Result<Config> {
        if let Some(path) = &self.storage_path {
            builder = builder.storage_path(path.clone());
        }
        builder.debug(self.debug).build()
    }

    /// Initialize logging. `RUST_LOG` wins, then `TSMETRICS_LOG_LEVEL`,
    /// then the configured level; `--debug` forces debug.
    pub fn init_logging(&self, configured: LogLevel) -> Result<()> {
        use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

        let env_log_level =
            std::env::var("TSMETRICS_LOG_LEVEL").unwrap_or_else(|_| configured.as_str().to_string());
        let log_level = if self.debug { "debug" } else { env_log_level.as_str() };

        let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(log_level));

        // Logs go to stderr so command output stays machine-readable
        let fmt_layer = tracing_subscriber::fmt::layer()
            .with_target(false)
            .with_writer(std::io::stderr)
            .compact();

        tracing_subscriber::registry()
            .with(filter)
            .with(fmt_layer)
            .try_init()
            .map_err(|e| MetricsError::config(format!("Failed to initialize logging: {}", e)))?;

        Ok(())
    }
}

/// Execute a parsed command line.
pub async fn execute(cli: Cli) -> Result<()> {
    let config = cli.load_config().await?;
    cli.init_logging(config.logging.level)?;
    tracing::debug!("Using metrics database {}", config.metrics.storage_path.display());

    if cli.command == Command::CheckConfig {
        config.validate()?;
        println!("Configuration is valid!");
        println!("  Storage path: {}", config.metrics.storage_path.display());
        println!("  Collection enabled: {}", config.metrics.enabled);
        println!("  Flush interval: {}", humantime::format_duration(config.metrics.flush_interval));
        println!("  Rollup interval: {}", humantime::format_duration(config.metrics.rollup_interval));
        let retention = &config.metrics.retention;
        println!(
            "  Retention: minute {}, hour {}, day {}",
            humantime::format_duration(retention.minute_data),
            humantime::format_duration(retention.hour_data),
            humantime::format_duration(retention.day_data)
        );
        return Ok(());
    }

    let engine = MetricsEngine::new(config)?;
    match &cli.command {
        Command::Keys => {
            let definitions = engine.definitions()?;
            if cli.json {
                print_json(&definitions)?;
            } else {
                for def in &definitions {
                    println!("{}\t{}\t{}", def.key, def.kind, def.unit.as_deref().unwrap_or("-"));
                }
            }
        },
        Command::History {
            key,
            since,
            from,
            to,
            resolution,
        } => {
            let resolution: Resolution = resolution.parse()?;
            let (start, end) = time_range(since.as_deref(), from.as_deref(), to.as_deref(), Utc::now())?;
            let points = engine.get_history(key, start, end, resolution)?;
            if cli.json {
                print_json(&points)?;
            } else {
                print_history(&points);
            }
        },
        Command::Aggregate { keys } => {
            let values = engine.get_snapshots(keys.as_slice())?;
            if cli.json {
                print_json(&values)?;
            } else {
                for (key, value) in &values {
                    println!("{}\t{}", key, value);
                }
            }
        },
        Command::Stats => {
            let stats = engine.stats()?;
            if cli.json {
                print_json(&stats)?;
            } else {
                println!("minute rows: {}", stats.minute_rows);
                println!("hour rows:   {}", stats.hour_rows);
                println!("day rows:    {}", stats.day_rows);
            }
        },
        Command::Rollup => {
            let report = engine.rollup_now().await?;
            if cli.json {
                print_json(&report)?;
            } else {
                println!(
                    "rolled {} minute rows into {} hour buckets, {} hour rows into {} day buckets, pruned {} day rows",
                    report.minute_to_hour.source_rows,
                    report.minute_to_hour.target_buckets,
                    report.hour_to_day.source_rows,
                    report.hour_to_day.target_buckets,
                    report.days_pruned
                );
            }
        },
        Command::Run => run_foreground(&engine).await?,
        Command::CheckConfig => {},
    }

    Ok(())
}

async fn run_foreground(engine: &MetricsEngine) -> Result<()> {
    engine.start()?;
    tracing::info!("tsmetrics running, press Ctrl-C to stop");

    tokio::signal::ctrl_c().await?;
    tracing::info!("Received shutdown signal, stopping...");

    engine.stop().await
}

/// Resolve `--since` / `--from` / `--to` into an inclusive range.
fn time_range(
    since: Option<&str>,
    from: Option<&str>,
    to: Option<&str>,
    now: DateTime<Utc>,
) -> Result<(DateTime<Utc>, DateTime<Utc>)> {
    let end = match to {
        Some(raw) => parse_timestamp(raw)?,
        None => now,
    };
    let start = match (from, since) {
        (Some(raw), _) => parse_timestamp(raw)?,
        (None, Some(raw)) => end.checked_sub_signed(lookback(raw)?).ok_or_else(|| {
            MetricsError::validation(format!("Lookback '{}' reaches before the earliest timestamp", raw))
        })?,
        (None, None) => end - chrono::Duration::hours(1),
    };

    if start > end {
        return Err(MetricsError::InvalidTimeRange {
            start: start.timestamp(),
            end: end.timestamp(),
        });
    }
    Ok((start, end))
}

fn parse_timestamp(raw: &str) -> Result<DateTime<Utc>> {
    DateTime::parse_from_rfc3339(raw)
        .map(|dt| dt.with_timezone(&Utc))
        .map_err(|e| MetricsError::validation(format!("Invalid timestamp '{}': {}", raw, e)))
}

fn lookback(raw: &str) -> Result<chrono::Duration> {
    let duration: Duration = humantime::parse_duration(raw)
        .map_err(|e| MetricsError::validation(format!("Invalid duration '{}': {}", raw, e)))?;
    chrono::Duration::from_std(duration)
        .map_err(|_| MetricsError::validation(format!("Duration '{}' is too large", raw)))
}

fn print_json<T: Serialize>(value: &T) -> Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

fn print_history(points: &[MetricPoint]) {
    for point in points {
        let extremes = match (point.min, point.max, point.last) {
            (Some(min), Some(max), Some(last)) => format!("\tmin={} max={} last={}", min, max, last),
            _ => String::new(),
        };
        println!(
            "{}\t{}\tcount={}{}",
            point.timestamp.to_rfc3339(),
            point.value,
            point.count,
            extremes
        );
    }
}
