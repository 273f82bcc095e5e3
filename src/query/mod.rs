//! Read-only access to persisted metrics.
//!
//! Every query goes through the store's read path, so queries never block
//! the flush or rollup writers. Unknown keys are not errors: history comes
//! back empty and aggregates are absent.

use crate::core::Result;
use crate::metrics::{MetricKind, MetricPoint, MetricRegistry, RegisteredMetric, Resolution};
use crate::storage::MetricStore;
use chrono::{DateTime, Utc};
use std::collections::BTreeMap;
use std::sync::Arc;

/// High-level query API over a [`MetricStore`]
pub struct QueryService {
    store: Arc<MetricStore>,
    registry: Arc<MetricRegistry>,
}

impl QueryService {
    pub fn new(store: Arc<MetricStore>, registry: Arc<MetricRegistry>) -> Self {
        Self { store, registry }
    }

    /// Points for `key` at `resolution` whose bucket overlaps
    /// `[start, end]`, oldest first.
    ///
    /// The bucket containing `start` is included even when it begins before
    /// `start`. Counters report the bucket sum, gauges the bucket average.
    pub fn history(
        &self,
        key: &str,
        start: DateTime<Utc>,
        end: DateTime<Utc>,
        resolution: Resolution,
    ) -> Result<Vec<MetricPoint>> {
        if start > end {
            return Ok(Vec::new());
        }
        let Some(metric) = self.registry.lookup(&self.store, key)? else {
            return Ok(Vec::new());
        };

        let buckets = self.store.read_buckets(
            metric.id,
            resolution,
            resolution.align(start.timestamp()),
            end.timestamp(),
        )?;
        Ok(buckets
            .iter()
            .map(|bucket| MetricPoint::from_bucket(&metric.key, metric.kind, bucket))
            .collect())
    }

    /// Current value of `key` across all three resolutions.
    ///
    /// Counters: the sum of every retained bucket. Gauges: `last` of the
    /// most recent bucket.
    pub fn aggregate(&self, key: &str) -> Result<Option<f64>> {
        match self.registry.lookup(&self.store, key)? {
            Some(metric) => self.aggregate_for(&metric),
            None => Ok(None),
        }
    }

    fn aggregate_for(&self, metric: &RegisteredMetric) -> Result<Option<f64>> {
        match metric.kind {
            MetricKind::Counter => self.store.counter_total(metric.id),
            MetricKind::Gauge => self.store.latest_gauge(metric.id),
        }
    }

    /// [`QueryService::aggregate`] for several keys. Keys without data are
    /// left out of the result.
    pub fn snapshots<K: AsRef<str>>(&self, keys: &[K]) -> Result<BTreeMap<String, f64>> {
        let mut values = BTreeMap::new();
        for key in keys {
            let key = key.as_ref();
            if values.contains_key(key) {
                continue;
            }
            if let Some(value) = self.aggregate(key)? {
                values.insert(key.to_string(), value);
            }
        }
        Ok(values)
    }

    /// Every persisted metric key, sorted
    pub fn list_keys(&self) -> Result<Vec<String>> {
        Ok(self
            .store
            .list_definitions()?
            .into_iter()
            .map(|metric| metric.key)
            .collect())
    }

    /// Every persisted definition, sorted by key
    pub fn definitions(&self) -> Result<Vec<RegisteredMetric>> {
        self.store.list_definitions()
    }
}
