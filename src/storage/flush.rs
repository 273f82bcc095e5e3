//! Flush job: drain every buffer into minute buckets and merge them into
//! the store in a single transaction.
//!
//! Samples leave memory at drain time. If the commit fails the drained
//! buckets are parked and merged into the next tick's batch; a crash between
//! drain and commit still loses them.

use crate::core::{MetricsConfig, Result};
use crate::metrics::{Collector, MetricBucket, MetricDefinition, MetricRegistry, Resolution};
use crate::storage::store::MetricStore;
use crate::storage::worker::PeriodicJob;
use parking_lot::Mutex;
use serde::Serialize;
use std::collections::BTreeMap;
use std::sync::Arc;

/// What one flush tick did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct FlushReport {
    /// Keys that contributed buckets
    pub metrics: usize,
    /// Minute buckets merged into the store
    pub buckets: usize,
    /// Samples represented by those buckets
    pub samples: u64,
    /// Buffered samples thrown away because the store holds the key under
    /// the other type
    pub discarded: u64,
}

#[derive(Debug)]
struct PendingMetric {
    definition: MetricDefinition,
    buckets: BTreeMap<i64, MetricBucket>,
}

/// Periodic swap-extract-persist step
pub struct FlushJob {
    collector: Arc<Collector>,
    store: Arc<MetricStore>,
    registry: Arc<MetricRegistry>,
    pending: Mutex<BTreeMap<String, PendingMetric>>,
    max_pending_buckets: usize,
}

impl FlushJob {
    pub fn new(
        collector: Arc<Collector>,
        store: Arc<MetricStore>,
        registry: Arc<MetricRegistry>,
        config: &MetricsConfig,
    ) -> Self {
        Self {
            collector,
            store,
            registry,
            pending: Mutex::new(BTreeMap::new()),
            max_pending_buckets: config.max_pending_buckets,
        }
    }

    /// Buckets parked after a failed commit
    pub fn pending_buckets(&self) -> usize {
        self.pending.lock().values().map(|p| p.buckets.len()).sum()
    }

    /// Drain all buffers and persist their minute buckets.
    pub fn flush(&self) -> Result<FlushReport> {
        let mut batch = std::mem::take(&mut *self.pending.lock());

        let outcome = match self.gather(&mut batch) {
            Ok(discarded) if batch.is_empty() => Ok(FlushReport {
                discarded,
                ..FlushReport::default()
            }),
            Ok(discarded) => self.persist(&batch).map(|report| FlushReport { discarded, ..report }),
            Err(e) => Err(e),
        };
        if outcome.is_err() && !batch.is_empty() {
            self.park(batch);
        }
        outcome
    }

    /// Drain every buffer into `batch` under the key's stored type. Returns
    /// the number of samples discarded because they were buffered under the
    /// other type.
    fn gather(&self, batch: &mut BTreeMap<String, PendingMetric>) -> Result<u64> {
        let mut discarded = 0u64;

        for buffer in self.collector.buffers() {
            if let Some(stored) = self.registry.lookup(&self.store, buffer.key())? {
                if let Some(lost) = buffer.retype(stored.kind) {
                    tracing::warn!(
                        key = %stored.key,
                        stored = %stored.kind,
                        discarded = lost,
                        "Metric type already fixed in the store, buffered samples discarded"
                    );
                    discarded += lost as u64;
                }
                if batch.get(buffer.key()).is_some_and(|p| p.definition.kind != stored.kind) {
                    if let Some(stale) = batch.remove(buffer.key()) {
                        discarded += stale.buckets.values().map(|b| b.count).sum::<u64>();
                    }
                }
            }

            let drained = buffer.drain_into(Resolution::Minute);
            if drained.is_empty() {
                continue;
            }
            let entry = batch
                .entry(buffer.key().to_string())
                .or_insert_with(|| PendingMetric {
                    definition: buffer.definition(),
                    buckets: BTreeMap::new(),
                });
            merge_into(&mut entry.buckets, drained);
        }
        Ok(discarded)
    }

    /// Write the whole batch, definitions included, in one transaction.
    fn persist(&self, batch: &BTreeMap<String, PendingMetric>) -> Result<FlushReport> {
        let mut rows = Vec::with_capacity(batch.len());
        let mut report = FlushReport::default();

        for pending in batch.values() {
            let buckets: Vec<MetricBucket> = pending.buckets.values().copied().collect();
            report.metrics += 1;
            report.buckets += buckets.len();
            report.samples += buckets.iter().map(|b| b.count).sum::<u64>();
            rows.push((pending.definition.clone(), buckets));
        }

        for registered in self.store.merge_metrics(Resolution::Minute, &rows)? {
            self.registry.remember(registered);
        }
        Ok(report)
    }

    /// Keep a failed batch for the next tick, dropping the oldest buckets
    /// beyond the configured cap.
    fn park(&self, batch: BTreeMap<String, PendingMetric>) {
        let mut pending = self.pending.lock();
        for (key, failed) in batch {
            match pending.get_mut(&key) {
                Some(existing) => merge_into(&mut existing.buckets, failed.buckets.into_values()),
                None => {
                    pending.insert(key, failed);
                },
            }
        }

        let mut total: usize = pending.values().map(|p| p.buckets.len()).sum();
        let mut discarded = 0usize;
        while total > self.max_pending_buckets {
            let oldest = pending
                .iter()
                .filter_map(|(key, p)| p.buckets.keys().next().map(|ts| (*ts, key.clone())))
                .min();
            let Some((ts, key)) = oldest else { break };
            if let Some(p) = pending.get_mut(&key) {
                p.buckets.remove(&ts);
                if p.buckets.is_empty() {
                    pending.remove(&key);
                }
            }
            total -= 1;
            discarded += 1;
        }
        if discarded > 0 {
            tracing::warn!(
                discarded,
                cap = self.max_pending_buckets,
                "Pending flush buckets over cap, oldest discarded"
            );
        }
    }
}

fn merge_into(target: &mut BTreeMap<i64, MetricBucket>, incoming: impl IntoIterator<Item = MetricBucket>) {
    for bucket in incoming {
        target
            .entry(bucket.timestamp)
            .and_modify(|existing| existing.merge(&bucket))
            .or_insert(bucket);
    }
}

impl PeriodicJob for FlushJob {
    fn name(&self) -> &'static str {
        "flush"
    }

    fn run(&self) -> Result<()> {
        let report = self.flush()?;
        if report.buckets > 0 {
            tracing::debug!(
                metrics = report.metrics,
                buckets = report.buckets,
                samples = report.samples,
                discarded = report.discarded,
                "Flushed minute buckets"
            );
        }
        Ok(())
    }

    fn on_shutdown(&self) -> Result<()> {
        self.collector.stop();
        let report = self.flush()?;
        tracing::info!(
            buckets = report.buckets,
            samples = report.samples,
            "Final flush complete"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::MetricsConfig;
    use crate::metrics::MetricKind;
    use chrono::{TimeZone, Utc};

    fn setup() -> (Arc<Collector>, Arc<MetricStore>, FlushJob) {
        let config = MetricsConfig::default();
        let collector = Arc::new(Collector::from_config(&config));
        collector.start();
        let store = Arc::new(MetricStore::open_in_memory().unwrap());
        let job = FlushJob::new(
            Arc::clone(&collector),
            Arc::clone(&store),
            Arc::new(MetricRegistry::new()),
            &config,
        );
        (collector, store, job)
    }

    fn at(secs: i64) -> chrono::DateTime<Utc> {
        Utc.timestamp_opt(secs, 0).unwrap()
    }

    #[test]
    fn test_flush_persists_minute_rows() {
        let (collector, store, job) = setup();
        for secs in [10, 20, 30, 40, 45] {
            collector.increment_at("songs_played", 1.0, None, at(secs));
        }

        let report = job.flush().unwrap();
        assert_eq!(report, FlushReport { metrics: 1, buckets: 1, samples: 5, discarded: 0 });

        let id = store.find_definition("songs_played").unwrap().unwrap().id;
        let rows = store.read_buckets(id, Resolution::Minute, 0, 60).unwrap();
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0].sum, 5.0);
        assert_eq!(rows[0].count, 5);
    }

    #[test]
    fn test_split_flushes_match_single_flush() {
        let (collector, store, job) = setup();
        collector.increment_at("songs_played", 2.0, None, at(5));
        collector.increment_at("songs_played", 3.0, None, at(15));
        job.flush().unwrap();
        collector.increment_at("songs_played", 4.0, None, at(25));
        job.flush().unwrap();

        let id = store.find_definition("songs_played").unwrap().unwrap().id;
        let rows = store.read_buckets(id, Resolution::Minute, 0, 0).unwrap();
        assert_eq!(rows[0].sum, 9.0);
        assert_eq!(rows[0].count, 3);
    }

    #[test]
    fn test_empty_flush_writes_nothing() {
        let (_collector, store, job) = setup();
        assert_eq!(job.flush().unwrap(), FlushReport::default());
        assert!(store.list_definitions().unwrap().is_empty());
    }

    #[test]
    fn test_shutdown_flush_stops_ingestion() {
        let (collector, store, job) = setup();
        collector.gauge_at("cpu_usage_percent", 40.0, None, at(0));
        job.on_shutdown().unwrap();
        assert!(!collector.is_active());

        collector.gauge_at("cpu_usage_percent", 99.0, None, at(1));
        assert_eq!(collector.stats().buffered_samples, 0);
        assert_eq!(store.row_count(Resolution::Minute).unwrap(), 1);
        let def = store.find_definition("cpu_usage_percent").unwrap().unwrap();
        assert_eq!(def.kind, MetricKind::Gauge);
    }

    #[test]
    fn test_failed_flush_is_retried_next_tick() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("metrics.db");
        let config = MetricsConfig::default();
        let collector = Arc::new(Collector::from_config(&config));
        collector.start();
        let store = Arc::new(MetricStore::open(&path).unwrap());
        let job = FlushJob::new(
            Arc::clone(&collector),
            Arc::clone(&store),
            Arc::new(MetricRegistry::new()),
            &config,
        );

        collector.increment_at("songs_played", 1.0, None, at(0));
        let side = rusqlite::Connection::open(&path).unwrap();
        side.execute_batch("DROP TABLE metric_data_minute").unwrap();
        assert!(job.flush().is_err());
        assert_eq!(job.pending_buckets(), 1);
        // the definition rolled back with the buckets
        assert!(store.find_definition("songs_played").unwrap().is_none());

        side.execute_batch(crate::storage::store::SCHEMA).unwrap();
        collector.increment_at("songs_played", 2.0, None, at(10));
        let report = job.flush().unwrap();
        assert_eq!(report.samples, 2);
        assert_eq!(job.pending_buckets(), 0);

        let id = store.find_definition("songs_played").unwrap().unwrap().id;
        assert_eq!(store.counter_total(id).unwrap(), Some(3.0));
    }

    #[test]
    fn test_stored_type_wins_over_buffered_type() {
        let (collector, store, job) = setup();
        store
            .ensure_definition(&MetricDefinition::new("plays", MetricKind::Counter))
            .unwrap();

        collector.gauge_at("plays", 1_000.0, None, at(0));
        collector.gauge_at("plays", 1_000.0, None, at(1));
        let report = job.flush().unwrap();
        assert_eq!(report.discarded, 2);
        assert_eq!(report.buckets, 0);
        assert_eq!(store.row_count(Resolution::Minute).unwrap(), 0);

        // the buffer now follows the stored type
        let buffer = collector.buffer("plays").unwrap();
        assert_eq!(buffer.kind(), MetricKind::Counter);
        collector.increment_at("plays", 4.0, None, at(2));
        collector.gauge_at("plays", 7.0, None, at(3));
        assert_eq!(job.flush().unwrap().samples, 1);

        let id = store.find_definition("plays").unwrap().unwrap().id;
        let rows = store.read_buckets(id, Resolution::Minute, 0, 0).unwrap();
        assert_eq!((rows[0].sum, rows[0].count, rows[0].last), (4.0, 1, None));
    }

    #[test]
    fn test_park_caps_pending_buckets() {
        let config = MetricsConfig {
            max_pending_buckets: 2,
            ..MetricsConfig::default()
        };
        let collector = Arc::new(Collector::from_config(&config));
        let job = FlushJob::new(
            Arc::clone(&collector),
            Arc::new(MetricStore::open_in_memory().unwrap()),
            Arc::new(MetricRegistry::new()),
            &config,
        );

        let mut buckets = BTreeMap::new();
        for ts in [0, 60, 120] {
            buckets.insert(ts, MetricBucket { count: 1, sum: 1.0, ..MetricBucket::empty(ts) });
        }
        let mut batch = BTreeMap::new();
        batch.insert("songs_played".to_string(), PendingMetric {
            definition: MetricDefinition::new("songs_played", MetricKind::Counter),
            buckets,
        });
        job.park(batch);

        assert_eq!(job.pending_buckets(), 2);
        let pending = job.pending.lock();
        let kept: Vec<i64> = pending["songs_played"].buckets.keys().copied().collect();
        assert_eq!(kept, vec![60, 120]);
    }
}
