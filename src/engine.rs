//! Engine facade: owns the collector, the store and both background workers.

use crate::core::{Config, Result};
use crate::metrics::{Collector, CollectorStats, MetricPoint, MetricRegistry, RegisteredMetric, Resolution, Tags};
use crate::query::QueryService;
use crate::storage::{
    FlushJob, FlushReport, MetricStore, PeriodicJob, PeriodicWorker, RetentionPolicy, RollupJob, RollupReport,
};
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{BTreeMap, BTreeSet};
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;

/// Snapshot of the engine's in-memory and on-disk state
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct EngineStats {
    pub collector: CollectorStats,
    /// Buckets waiting for a retry after a failed flush
    pub pending_buckets: usize,
    pub minute_rows: u64,
    pub hour_rows: u64,
    pub day_rows: u64,
}

/// Main engine struct that coordinates ingestion, persistence and queries.
pub struct MetricsEngine {
    /// In-memory ingestion surface
    collector: Arc<Collector>,
    /// Durable bucket storage
    store: Arc<MetricStore>,
    /// Read-side API
    query: QueryService,
    flush_job: Arc<FlushJob>,
    rollup_job: Arc<RollupJob>,
    flush_worker: PeriodicWorker,
    rollup_worker: PeriodicWorker,
    /// Engine configuration
    config: Config,
}

impl MetricsEngine {
    /// Create an engine backed by the database at `metrics.storage_path`.
    ///
    /// A store that cannot be opened is fatal here; nothing is retried.
    pub fn new(config: Config) -> Result<Self> {
        config.validate()?;
        let store = Arc::new(MetricStore::open(&config.metrics.storage_path)?);
        Self::with_store(config, store)
    }

    /// Create an engine over an already opened store.
    pub fn with_store(config: Config, store: Arc<MetricStore>) -> Result<Self> {
        config.validate()?;
        let metrics = &config.metrics;

        let collector = Arc::new(Collector::from_config(metrics));
        let registry = Arc::new(MetricRegistry::new());
        let query = QueryService::new(Arc::clone(&store), Arc::clone(&registry));

        let flush_job = Arc::new(FlushJob::new(
            Arc::clone(&collector),
            Arc::clone(&store),
            registry,
            metrics,
        ));
        let rollup_job = Arc::new(RollupJob::new(
            Arc::clone(&store),
            RetentionPolicy::from(&metrics.retention),
        ));

        let flush_worker = PeriodicWorker::new(
            Arc::clone(&flush_job) as Arc<dyn PeriodicJob>,
            metrics.flush_interval,
        );
        let rollup_worker = PeriodicWorker::new(
            Arc::clone(&rollup_job) as Arc<dyn PeriodicJob>,
            metrics.rollup_interval,
        );

        Ok(Self {
            collector,
            store,
            query,
            flush_job,
            rollup_job,
            flush_worker,
            rollup_worker,
            config,
        })
    }

    /// Begin accepting samples and start the flush and rollup workers.
    ///
    /// Must be called from within a tokio runtime. With collection disabled
    /// this does nothing and the engine only answers queries.
    pub fn start(&self) -> Result<()> {
        if !self.config.metrics.enabled {
            tracing::info!("Metrics collection disabled, engine is query-only");
            return Ok(());
        }

        self.collector.start();
        self.flush_worker.start()?;
        self.rollup_worker.start()?;
        tracing::info!(
            flush_interval = ?self.config.metrics.flush_interval,
            rollup_interval = ?self.config.metrics.rollup_interval,
            "Metrics engine started"
        );
        Ok(())
    }

    /// Stop using the configured `shutdown_timeout`.
    pub async fn stop(&self) -> Result<()> {
        self.stop_with_timeout(self.config.metrics.shutdown_timeout).await
    }

    /// Stop ingestion, run a final flush and shut both workers down, waiting
    /// at most `timeout` in total.
    pub async fn stop_with_timeout(&self, timeout: Duration) -> Result<()> {
        let deadline = Instant::now() + timeout;
        self.collector.stop();

        let flushed = self.flush_worker.stop(timeout).await;
        let remaining = deadline.saturating_duration_since(Instant::now());
        let rolled = self.rollup_worker.stop(remaining).await;

        flushed?;
        rolled?;
        tracing::info!("Metrics engine stopped");
        Ok(())
    }

    /// Ingestion handle for call sites
    pub fn collector(&self) -> &Arc<Collector> {
        &self.collector
    }

    /// Record a counter delta
    #[inline]
    pub fn increment(&self, key: &str, delta: f64, tags: Option<Tags>) {
        self.collector.increment(key, delta, tags);
    }

    /// Record a gauge reading
    #[inline]
    pub fn gauge(&self, key: &str, value: f64, tags: Option<Tags>) {
        self.collector.gauge(key, value, tags);
    }

    /// Run one flush now, serialized with the flush worker's ticks.
    pub async fn flush_now(&self) -> Result<FlushReport> {
        let job = Arc::clone(&self.flush_job);
        self.flush_worker.run_exclusive(move || job.flush()).await
    }

    /// Run one rollup/retention pass now, serialized with the rollup
    /// worker's ticks.
    pub async fn rollup_now(&self) -> Result<RollupReport> {
        let job = Arc::clone(&self.rollup_job);
        self.rollup_worker.run_exclusive(move || job.run_now()).await
    }

    /// Points for `key` at `resolution`, oldest first. The key's latest
    /// in-memory tags are attached to every point.
    pub fn get_history(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<MetricPoint>> {
        let mut points = self.query.history(key, start, end, resolution)?;
        if let Some(tags) = self.collector.tags_for(key) {
            for point in &mut points {
                point.tags = Some(tags.clone());
            }
        }
        Ok(points)
    }

    /// Current value of `key` across all resolutions
    pub fn get_aggregate(&self, key: &str) -> Result<Option<f64>> {
        self.query.aggregate(key)
    }

    /// Current values of several keys; keys without data are omitted
    pub fn get_snapshots<K: AsRef<str>>(&self, keys: &[K]) -> Result<BTreeMap<String, f64>> {
        self.query.snapshots(keys)
    }

    /// Every known key, persisted or only buffered so far, sorted
    pub fn list_keys(&self) -> Result<Vec<String>> {
        let mut keys: BTreeSet<String> = self.query.list_keys()?.into_iter().collect();
        keys.extend(self.collector.keys());
        Ok(keys.into_iter().collect())
    }

    /// Every persisted definition
    pub fn definitions(&self) -> Result<Vec<RegisteredMetric>> {
        self.query.definitions()
    }

    pub fn stats(&self) -> Result<EngineStats> {
        Ok(EngineStats {
            collector: self.collector.stats(),
            pending_buckets: self.flush_job.pending_buckets(),
            minute_rows: self.store.row_count(Resolution::Minute)?,
            hour_rows: self.store.row_count(Resolution::Hour)?,
            day_rows: self.store.row_count(Resolution::Day)?,
        })
    }

    /// True while either background worker is running
    pub fn is_running(&self) -> bool {
        self.flush_worker.is_running() || self.rollup_worker.is_running()
    }

    /// Get a reference to the store.
    pub fn store(&self) -> &Arc<MetricStore> {
        &self.store
    }

    /// Get a reference to the query service.
    pub fn query(&self) -> &QueryService {
        &self.query
    }

    pub fn config(&self) -> &Config {
        &self.config
    }
}
