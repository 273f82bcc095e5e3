//! Core metric types shared by the collector, the store and the query layer.

use crate::core::MetricsError;
use chrono::{DateTime, TimeZone, Utc};
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;

/// Display-only labels attached to a metric. Never indexed.
pub type Tags = BTreeMap<String, String>;

/// Row identifier of a metric definition
pub type MetricId = i64;

/// How samples of a metric are aggregated
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum MetricKind {
    /// Each sample is a delta; buckets are summed across time
    Counter,
    /// Each sample is an absolute reading; buckets keep min/max/avg/last
    Gauge,
}

impl MetricKind {
    /// Storage representation
    pub fn as_str(&self) -> &'static str {
        match self {
            MetricKind::Counter => "counter",
            MetricKind::Gauge => "gauge",
        }
    }
}

impl fmt::Display for MetricKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for MetricKind {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "counter" => Ok(MetricKind::Counter),
            "gauge" => Ok(MetricKind::Gauge),
            _ => Err(MetricsError::InvalidMetricKind(s.to_string())),
        }
    }
}

/// Bucket width; each resolution has its own table
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Resolution {
    /// 60 second buckets
    Minute,
    /// 3600 second buckets
    Hour,
    /// 86400 second buckets
    Day,
}

impl Resolution {
    /// All resolutions, finest first
    pub const ALL: [Resolution; 3] = [Resolution::Minute, Resolution::Hour, Resolution::Day];

    /// Bucket width in seconds
    pub const fn width_secs(self) -> i64 {
        match self {
            Resolution::Minute => 60,
            Resolution::Hour => 3_600,
            Resolution::Day => 86_400,
        }
    }

    /// Start of the bucket containing `unix_secs`
    pub const fn align(self, unix_secs: i64) -> i64 {
        unix_secs.div_euclid(self.width_secs()) * self.width_secs()
    }

    /// Next coarser resolution, `None` for day
    pub const fn coarser(self) -> Option<Resolution> {
        match self {
            Resolution::Minute => Some(Resolution::Hour),
            Resolution::Hour => Some(Resolution::Day),
            Resolution::Day => None,
        }
    }

    /// Table holding buckets of this resolution
    pub const fn table(self) -> &'static str {
        match self {
            Resolution::Minute => "metric_data_minute",
            Resolution::Hour => "metric_data_hour",
            Resolution::Day => "metric_data_day",
        }
    }

    /// Lowercase name
    pub fn as_str(&self) -> &'static str {
        match self {
            Resolution::Minute => "minute",
            Resolution::Hour => "hour",
            Resolution::Day => "day",
        }
    }
}

impl fmt::Display for Resolution {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Resolution {
    type Err = MetricsError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_lowercase().as_str() {
            "minute" | "min" | "1m" => Ok(Resolution::Minute),
            "hour" | "1h" => Ok(Resolution::Hour),
            "day" | "1d" => Ok(Resolution::Day),
            _ => Err(MetricsError::InvalidResolution(s.to_string())),
        }
    }
}

/// Identity of a metric as declared by its first writer
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MetricDefinition {
    /// Unique key, immutable once created
    pub key: String,
    /// Aggregation type
    pub kind: MetricKind,
    /// Optional unit label
    pub unit: Option<String>,
}

impl MetricDefinition {
    pub fn new(key: impl Into<String>, kind: MetricKind) -> Self {
        Self {
            key: key.into(),
            kind,
            unit: None,
        }
    }

    pub fn with_unit(mut self, unit: impl Into<String>) -> Self {
        self.unit = Some(unit.into());
        self
    }
}

/// One raw observation, held in memory until the next flush
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Sample {
    pub value: f64,
    pub timestamp: DateTime<Utc>,
}

impl Sample {
    pub fn new(value: f64, timestamp: DateTime<Utc>) -> Self {
        Self { value, timestamp }
    }
}

/// Aggregate of one metric over one bucket window.
///
/// Counters only populate `sum` and `count`. Gauges also carry `min`, `max`
/// and `last`; `sum / count` is their average.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct MetricBucket {
    /// Bucket start, unix seconds, aligned to the resolution width
    pub timestamp: i64,
    pub sum: f64,
    pub count: u64,
    pub min: Option<f64>,
    pub max: Option<f64>,
    pub last: Option<f64>,
}

impl MetricBucket {
    /// Empty bucket starting at `timestamp`
    pub fn empty(timestamp: i64) -> Self {
        Self {
            timestamp,
            sum: 0.0,
            count: 0,
            min: None,
            max: None,
            last: None,
        }
    }

    /// Fold another bucket for the same window into this one.
    ///
    /// Sums and counts add, min/max tighten, `last` takes the incoming value
    /// when it has one. Callers merge in time order.
    pub fn merge(&mut self, other: &MetricBucket) {
        self.sum += other.sum;
        self.count += other.count;
        self.min = tighten(self.min, other.min, f64::min);
        self.max = tighten(self.max, other.max, f64::max);
        if other.last.is_some() {
            self.last = other.last;
        }
    }

    /// Same aggregate re-keyed to the enclosing bucket of `resolution`
    pub fn realigned(&self, resolution: Resolution) -> Self {
        Self {
            timestamp: resolution.align(self.timestamp),
            ..*self
        }
    }

    /// Arithmetic mean of the samples in the bucket
    pub fn average(&self) -> Option<f64> {
        if self.count == 0 {
            None
        } else {
            Some(self.sum / self.count as f64)
        }
    }

    /// Value reported to readers: the delta for counters, the mean for gauges
    pub fn value_for(&self, kind: MetricKind) -> f64 {
        match kind {
            MetricKind::Counter => self.sum,
            MetricKind::Gauge => self.average().unwrap_or(0.0),
        }
    }
}

fn tighten(current: Option<f64>, incoming: Option<f64>, pick: fn(f64, f64) -> f64) -> Option<f64> {
    match (current, incoming) {
        (Some(a), Some(b)) => Some(pick(a, b)),
        (a, None) => a,
        (None, b) => b,
    }
}

/// Read model returned to callers
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MetricPoint {
    pub key: String,
    pub timestamp: DateTime<Utc>,
    pub value: f64,
    pub count: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub min: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub tags: Option<Tags>,
}

impl MetricPoint {
    /// Build a point from a stored bucket
    pub fn from_bucket(key: &str, kind: MetricKind, bucket: &MetricBucket) -> Self {
        Self {
            key: key.to_string(),
            timestamp: to_datetime(bucket.timestamp),
            value: bucket.value_for(kind),
            count: bucket.count,
            min: bucket.min,
            max: bucket.max,
            last: bucket.last,
            tags: None,
        }
    }
}

/// Unix seconds to UTC, clamping out-of-range values to the epoch
pub fn to_datetime(unix_secs: i64) -> DateTime<Utc> {
    Utc.timestamp_opt(unix_secs, 0).single().unwrap_or_default()
}
