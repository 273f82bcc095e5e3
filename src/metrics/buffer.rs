//! Per-key sample buffer.
//!
//! Every metric key owns one buffer with its own lock, so recording a sample
//! for one key never contends with any other key. Draining swaps the sample
//! list out under the lock and aggregates outside of it.

use crate::metrics::types::{MetricBucket, MetricDefinition, MetricKind, Resolution, Sample, Tags};
use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use std::collections::{BTreeMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};

/// In-memory accumulator for one metric key.
///
/// At most `capacity` samples are held between drains. When full, a counter
/// buffer discards the incoming delta while a gauge buffer evicts its oldest
/// reading so `last` stays current. Either way the loss is counted in
/// [`MetricBuffer::dropped`].
#[derive(Debug)]
pub struct MetricBuffer {
    key: String,
    unit: Option<String>,
    capacity: usize,
    state: Mutex<BufferState>,
    dropped: AtomicU64,
    rejected: AtomicU64,
}

#[derive(Debug)]
struct BufferState {
    kind: MetricKind,
    samples: VecDeque<Sample>,
    tags: Option<Tags>,
}

impl MetricBuffer {
    /// Create a buffer holding at most `capacity` samples between drains
    pub fn new(definition: MetricDefinition, capacity: usize) -> Self {
        Self {
            key: definition.key,
            unit: definition.unit,
            capacity,
            state: Mutex::new(BufferState {
                kind: definition.kind,
                samples: VecDeque::new(),
                tags: None,
            }),
            dropped: AtomicU64::new(0),
            rejected: AtomicU64::new(0),
        }
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn definition(&self) -> MetricDefinition {
        MetricDefinition {
            key: self.key.clone(),
            kind: self.kind(),
            unit: self.unit.clone(),
        }
    }

    pub fn kind(&self) -> MetricKind {
        self.state.lock().kind
    }

    /// Append a sample recorded as `kind`.
    ///
    /// Returns false if the sample was not kept: its kind differs from the
    /// buffer's, or a full counter buffer discarded it.
    pub fn record(&self, sample: Sample, kind: MetricKind, tags: Option<Tags>) -> bool {
        let mut state = self.state.lock();
        if state.kind != kind {
            drop(state);
            self.rejected.fetch_add(1, Ordering::Relaxed);
            return false;
        }
        if let Some(tags) = tags {
            state.tags = Some(tags);
        }
        if state.samples.len() >= self.capacity {
            if state.kind == MetricKind::Counter || state.samples.pop_front().is_none() {
                drop(state);
                self.dropped.fetch_add(1, Ordering::Relaxed);
                return false;
            }
            self.dropped.fetch_add(1, Ordering::Relaxed);
        }
        state.samples.push_back(sample);
        true
    }

    /// Switch the buffer to `kind`, discarding samples buffered under the old
    /// type. Returns how many were discarded, or `None` if the kind already
    /// matched.
    pub fn retype(&self, kind: MetricKind) -> Option<usize> {
        let mut state = self.state.lock();
        if state.kind == kind {
            return None;
        }
        state.kind = kind;
        let discarded = state.samples.len();
        state.samples.clear();
        Some(discarded)
    }

    /// Number of samples waiting for the next drain
    pub fn len(&self) -> usize {
        self.state.lock().samples.len()
    }

    pub fn is_empty(&self) -> bool {
        self.state.lock().samples.is_empty()
    }

    /// Samples lost to a full buffer
    pub fn dropped(&self) -> u64 {
        self.dropped.load(Ordering::Relaxed)
    }

    /// Samples refused because they were recorded as the other type
    pub fn rejected(&self) -> u64 {
        self.rejected.load(Ordering::Relaxed)
    }

    /// Most recently supplied tags
    pub fn tags(&self) -> Option<Tags> {
        self.state.lock().tags.clone()
    }

    /// Swap out every buffered sample and aggregate them into buckets of
    /// `resolution`, ascending by bucket start.
    ///
    /// The swap is the atomicity boundary: a concurrent `record` lands either
    /// in the returned batch or in the fresh list, never both.
    pub fn drain_into(&self, resolution: Resolution) -> Vec<MetricBucket> {
        let (kind, samples) = {
            let mut state = self.state.lock();
            (state.kind, std::mem::take(&mut state.samples))
        };
        aggregate_samples(kind, resolution, samples.iter())
    }
}

/// Group samples (in arrival order) into aligned buckets.
pub fn aggregate_samples<'a>(
    kind: MetricKind,
    resolution: Resolution,
    samples: impl IntoIterator<Item = &'a Sample>,
) -> Vec<MetricBucket> {
    let mut buckets: BTreeMap<i64, (MetricBucket, Option<DateTime<Utc>>)> = BTreeMap::new();

    for sample in samples {
        let start = resolution.align(sample.timestamp.timestamp());
        let (bucket, last_seen) = buckets
            .entry(start)
            .or_insert_with(|| (MetricBucket::empty(start), None));

        bucket.sum += sample.value;
        bucket.count += 1;

        if kind == MetricKind::Gauge {
            bucket.min = Some(bucket.min.map_or(sample.value, |m| m.min(sample.value)));
            bucket.max = Some(bucket.max.map_or(sample.value, |m| m.max(sample.value)));
            // greatest timestamp wins; equal timestamps go to the later arrival
            if last_seen.map_or(true, |seen| sample.timestamp >= seen) {
                bucket.last = Some(sample.value);
                *last_seen = Some(sample.timestamp);
            }
        }
    }

    buckets.into_values().map(|(bucket, _)| bucket).collect()
}
