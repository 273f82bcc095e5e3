//! Durable storage and the background workers that write to it.
//!
//! The store holds one bucket table per resolution. Only two writers touch
//! it: the flush job, which merges minute buckets drained from the
//! collector, and the rollup job, which moves expired buckets into coarser
//! tables and prunes the oldest day data.

pub mod flush;
pub mod rollup;
pub mod store;
pub mod worker;

// Re-export commonly used types
pub use flush::{FlushJob, FlushReport};
pub use rollup::{RetentionPolicy, RollupJob, RollupReport};
pub use store::{MetricStore, RollupOutcome};
pub use worker::{PeriodicJob, PeriodicWorker};
