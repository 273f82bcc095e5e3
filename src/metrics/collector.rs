//! Public ingestion surface.
//!
//! `increment` and `gauge` only touch memory: a sharded map lookup and the
//! per-key buffer lock. They never fail and never do I/O. While collection is
//! disabled, or before the engine has started, every call is a no-op.

use crate::core::MetricsConfig;
use crate::metrics::buffer::MetricBuffer;
use crate::metrics::types::{MetricDefinition, MetricKind, Sample, Tags};
use chrono::{DateTime, Utc};
use dashmap::DashMap;
use serde::Serialize;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;

/// Point-in-time view of the in-memory side of the engine
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct CollectorStats {
    /// Keys with a live buffer
    pub tracked_keys: usize,
    /// Samples waiting for the next flush
    pub buffered_samples: usize,
    /// Samples discarded because a buffer was full
    pub dropped_samples: u64,
    /// Samples refused because the key is fixed to the other type
    pub rejected_samples: u64,
}

/// Owns the key to buffer mapping
#[derive(Debug)]
pub struct Collector {
    enabled: bool,
    accepting: AtomicBool,
    buffer_capacity: usize,
    buffers: DashMap<String, Arc<MetricBuffer>>,
}

impl Collector {
    /// Create a collector. It ignores samples until [`Collector::start`].
    pub fn new(enabled: bool, buffer_capacity: usize) -> Self {
        Self {
            enabled,
            accepting: AtomicBool::new(false),
            buffer_capacity,
            buffers: DashMap::new(),
        }
    }

    pub fn from_config(config: &MetricsConfig) -> Self {
        Self::new(config.enabled, config.max_buffered_samples)
    }

    /// Begin accepting samples (no effect when disabled)
    pub fn start(&self) {
        self.accepting.store(self.enabled, Ordering::Release);
    }

    /// Stop accepting samples; buffered data stays until drained
    pub fn stop(&self) {
        self.accepting.store(false, Ordering::Release);
    }

    /// True when samples are currently being recorded
    #[inline]
    pub fn is_active(&self) -> bool {
        self.accepting.load(Ordering::Acquire)
    }

    pub fn is_enabled(&self) -> bool {
        self.enabled
    }

    /// Declare a metric's type and unit ahead of its first sample.
    ///
    /// Returns false if the key already exists; the first writer's type
    /// stays in place either way.
    pub fn define(&self, key: &str, kind: MetricKind, unit: Option<&str>) -> bool {
        if !self.enabled || self.buffers.contains_key(key) {
            return false;
        }
        let mut created = false;
        self.buffers.entry(key.to_string()).or_insert_with(|| {
            created = true;
            let mut definition = MetricDefinition::new(key, kind);
            definition.unit = unit.map(str::to_string);
            Arc::new(MetricBuffer::new(definition, self.buffer_capacity))
        });
        created
    }

    /// Add 1.0 to a counter
    #[inline]
    pub fn incr(&self, key: &str) {
        self.increment(key, 1.0, None);
    }

    /// Record a counter delta
    #[inline]
    pub fn increment(&self, key: &str, delta: f64, tags: Option<Tags>) {
        self.record(key, MetricKind::Counter, delta, tags, Utc::now());
    }

    /// Record a counter delta at an explicit time
    pub fn increment_at(&self, key: &str, delta: f64, tags: Option<Tags>, at: DateTime<Utc>) {
        self.record(key, MetricKind::Counter, delta, tags, at);
    }

    /// Record a gauge reading
    #[inline]
    pub fn gauge(&self, key: &str, value: f64, tags: Option<Tags>) {
        self.record(key, MetricKind::Gauge, value, tags, Utc::now());
    }

    /// Record a gauge reading at an explicit time
    pub fn gauge_at(&self, key: &str, value: f64, tags: Option<Tags>, at: DateTime<Utc>) {
        self.record(key, MetricKind::Gauge, value, tags, at);
    }

    fn record(&self, key: &str, kind: MetricKind, value: f64, tags: Option<Tags>, at: DateTime<Utc>) {
        if !self.is_active() || !value.is_finite() {
            return;
        }
        // A key keeps the type of its first writer; samples of the other
        // type are refused, never summed or averaged under the wrong rules.
        let buffer = self.buffer_for(key, kind);
        buffer.record(Sample::new(value, at), kind, tags);
    }

    fn buffer_for(&self, key: &str, kind: MetricKind) -> Arc<MetricBuffer> {
        if let Some(existing) = self.buffers.get(key) {
            return Arc::clone(existing.value());
        }
        let entry = self.buffers.entry(key.to_string()).or_insert_with(|| {
            Arc::new(MetricBuffer::new(MetricDefinition::new(key, kind), self.buffer_capacity))
        });
        Arc::clone(entry.value())
    }

    /// Snapshot of every live buffer
    pub fn buffers(&self) -> Vec<Arc<MetricBuffer>> {
        self.buffers.iter().map(|entry| Arc::clone(entry.value())).collect()
    }

    /// Buffer for one key, if it exists
    pub fn buffer(&self, key: &str) -> Option<Arc<MetricBuffer>> {
        self.buffers.get(key).map(|entry| Arc::clone(entry.value()))
    }

    /// Every key seen since the process started
    pub fn keys(&self) -> Vec<String> {
        self.buffers.iter().map(|entry| entry.key().clone()).collect()
    }

    /// Latest tags supplied for `key`
    pub fn tags_for(&self, key: &str) -> Option<Tags> {
        self.buffers.get(key).and_then(|entry| entry.value().tags())
    }

    pub fn stats(&self) -> CollectorStats {
        self.buffers.iter().fold(CollectorStats::default(), |mut stats, entry| {
            stats.tracked_keys += 1;
            stats.buffered_samples += entry.value().len();
            stats.dropped_samples += entry.value().dropped();
            stats.rejected_samples += entry.value().rejected();
            stats
        })
    }
}
