//! Rollup and retention.
//!
//! Each run moves minute buckets older than the minute retention into hour
//! buckets, hour buckets older than the hour retention into day buckets, and
//! deletes day buckets older than the day retention. A bucket whose age is
//! exactly the retention window is kept.

use crate::core::{RetentionConfig, Result};
use crate::metrics::Resolution;
use crate::storage::store::{MetricStore, RollupOutcome};
use crate::storage::worker::PeriodicJob;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::sync::Arc;
use std::time::Duration;

/// Maximum age per resolution
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetentionPolicy {
    pub minute: Duration,
    pub hour: Duration,
    pub day: Duration,
}

impl RetentionPolicy {
    /// Retention window of `resolution`
    pub fn window(&self, resolution: Resolution) -> Duration {
        match resolution {
            Resolution::Minute => self.minute,
            Resolution::Hour => self.hour,
            Resolution::Day => self.day,
        }
    }

    /// Oldest bucket start still retained at `resolution`
    pub fn cutoff(&self, resolution: Resolution, now: DateTime<Utc>) -> i64 {
        let window = i64::try_from(self.window(resolution).as_secs()).unwrap_or(i64::MAX);
        now.timestamp().saturating_sub(window)
    }
}

impl From<&RetentionConfig> for RetentionPolicy {
    fn from(config: &RetentionConfig) -> Self {
        Self {
            minute: config.minute_data,
            hour: config.hour_data,
            day: config.day_data,
        }
    }
}

/// What one rollup run did
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupReport {
    pub minute_to_hour: RollupOutcome,
    pub hour_to_day: RollupOutcome,
    /// Day buckets deleted
    pub days_pruned: usize,
}

impl RollupReport {
    /// True when the run changed no rows
    pub fn is_noop(&self) -> bool {
        self.minute_to_hour.source_rows == 0 && self.hour_to_day.source_rows == 0 && self.days_pruned == 0
    }
}

/// Periodic rollup/retention step
pub struct RollupJob {
    store: Arc<MetricStore>,
    policy: RetentionPolicy,
}

impl RollupJob {
    pub fn new(store: Arc<MetricStore>, policy: RetentionPolicy) -> Self {
        Self { store, policy }
    }

    pub fn policy(&self) -> RetentionPolicy {
        self.policy
    }

    /// Run all three steps against the wall clock
    pub fn run_now(&self) -> Result<RollupReport> {
        self.run_at(Utc::now())
    }

    /// Run all three steps as if the current time were `now`
    pub fn run_at(&self, now: DateTime<Utc>) -> Result<RollupReport> {
        let minute_to_hour = self
            .store
            .roll_up(Resolution::Minute, self.policy.cutoff(Resolution::Minute, now))?;
        let hour_to_day = self
            .store
            .roll_up(Resolution::Hour, self.policy.cutoff(Resolution::Hour, now))?;
        let days_pruned = self
            .store
            .prune(Resolution::Day, self.policy.cutoff(Resolution::Day, now))?;

        Ok(RollupReport {
            minute_to_hour,
            hour_to_day,
            days_pruned,
        })
    }
}

impl PeriodicJob for RollupJob {
    fn name(&self) -> &'static str {
        "rollup"
    }

    fn run(&self) -> Result<()> {
        let report = self.run_now()?;
        if report.is_noop() {
            tracing::debug!("Rollup found nothing past retention");
        } else {
            tracing::info!(
                minutes_rolled = report.minute_to_hour.source_rows,
                hours_rolled = report.hour_to_day.source_rows,
                days_pruned = report.days_pruned,
                "Rollup complete"
            );
        }
        Ok(())
    }
}
