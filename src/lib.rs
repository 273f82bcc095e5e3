//! tsmetrics - embedded time-series metrics engine.
//!
//! Call sites record counter deltas and gauge readings in memory; a flush
//! worker periodically merges them into minute buckets in an embedded SQLite
//! database, and a rollup worker folds aging minute buckets into hours, hours
//! into days, and deletes days past retention.
//!
//! # Features
//!
//! - **Lock-light ingestion**: per-key buffers, no I/O on the hot path
//! - **Idempotent persistence**: partial flushes of one bucket converge
//! - **Tiered retention**: minute, hour and day resolutions
//! - **Queries**: history, current value, batched snapshots, key listing
//!
//! # Architecture
//!
//! - `metrics`: domain types, per-key buffers and the collector
//! - `storage`: the SQLite store plus the flush and rollup workers
//! - `query`: read-only query service
//! - `engine`: facade wiring everything together
//! - `core`: configuration and errors
//! - `cli`: command-line inspector
//!
//! # Example
//!
//! ```no_run
//! use tsmetrics_lib::core::Config;
//! use tsmetrics_lib::MetricsEngine;
//!
//! #[tokio::main]
//! async fn main() -> Result<(), Box<dyn std::error::Error>> {
//!     let engine = MetricsEngine::new(Config::default())?;
//!     engine.start()?;
//!     engine.increment("songs_played", 1.0, None);
//!     engine.gauge("cpu_usage_percent", 42.0, None);
//!     engine.stop().await?;
//!     Ok(())
//! }
//! ```

#![warn(clippy::all)]
#![warn(clippy::pedantic)]
#![allow(clippy::module_name_repetitions)]
#![allow(clippy::must_use_candidate)]

pub mod cli;
pub mod core;
pub mod engine;
pub mod metrics;
pub mod query;
pub mod storage;

// Re-export core types for convenience
pub use crate::core::{Config, MetricsError, Result};
pub use crate::engine::{EngineStats, MetricsEngine};
pub use crate::metrics::{Collector, MetricKind, MetricPoint, Resolution, Tags};
