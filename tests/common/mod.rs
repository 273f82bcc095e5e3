//! Common test utilities and fixtures.

#![allow(dead_code)]

use chrono::{DateTime, TimeZone, Utc};
use std::path::Path;
use std::sync::Arc;
use std::time::Duration;
use tsmetrics_lib::core::{Config, ConfigBuilder};
use tsmetrics_lib::storage::MetricStore;
use tsmetrics_lib::MetricsEngine;

/// Bucket-aligned base time used across tests (2023-11-14T22:00:00Z)
pub const BASE: i64 = 1_700_000_000 - 1_700_000_000 % 3_600;

/// `BASE + offset` seconds as UTC
pub fn at(offset_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(BASE + offset_secs, 0).unwrap()
}

/// Config with long worker periods so only manual runs touch the store.
pub fn quiet_config(db: &Path) -> Config {
    ConfigBuilder::new()
        .storage_path(db.to_path_buf())
        .flush_interval(Duration::from_secs(3_600))
        .rollup_interval(Duration::from_secs(3_600))
        .build()
        .unwrap()
}

/// Started engine over an in-memory store
pub fn memory_engine(config: Config) -> MetricsEngine {
    let store = Arc::new(MetricStore::open_in_memory().unwrap());
    let engine = MetricsEngine::with_store(config, store).unwrap();
    engine.start().unwrap();
    engine
}
