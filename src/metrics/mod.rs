//! In-process metric ingestion.
//!
//! Call sites record counter deltas and gauge readings through the
//! [`Collector`]; each key accumulates raw samples in its own
//! [`MetricBuffer`] until the flush job drains them into minute buckets.

pub mod buffer;
pub mod collector;
pub mod registry;
pub mod types;

pub use buffer::MetricBuffer;
pub use collector::{Collector, CollectorStats};
pub use registry::{MetricRegistry, RegisteredMetric};
pub use types::{
    MetricBucket, MetricDefinition, MetricId, MetricKind, MetricPoint, Resolution, Sample, Tags,
};
