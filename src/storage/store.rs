//! SQLite-backed bucket storage.
//!
//! One table per resolution, each keyed by `(metric_id, timestamp)`. All
//! writes go through a single writer connection; when the store lives on
//! disk a second read-only connection serves queries so readers and the
//! background workers do not queue behind each other (WAL mode).

use crate::core::{MetricsError, Result};
use crate::metrics::registry::RegisteredMetric;
use crate::metrics::types::{MetricBucket, MetricDefinition, MetricId, MetricKind, Resolution};
use parking_lot::Mutex;
use rusqlite::{params, Connection, OpenFlags, OptionalExtension};
use serde::Serialize;
use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::info_span;

const BUSY_TIMEOUT: Duration = Duration::from_secs(5);

/// DDL for definitions and the three bucket tables.
pub(crate) const SCHEMA: &str = r"
CREATE TABLE IF NOT EXISTS metric_definitions (
    id    INTEGER PRIMARY KEY AUTOINCREMENT,
    key   TEXT NOT NULL UNIQUE,
    type  TEXT NOT NULL CHECK (type IN ('counter', 'gauge')),
    unit  TEXT
);

CREATE TABLE IF NOT EXISTS metric_data_minute (
    metric_id    INTEGER NOT NULL REFERENCES metric_definitions(id),
    timestamp    INTEGER NOT NULL,
    value_sum    REAL NOT NULL,
    value_count  INTEGER NOT NULL,
    value_min    REAL,
    value_max    REAL,
    value_last   REAL,
    PRIMARY KEY (metric_id, timestamp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metric_data_hour (
    metric_id    INTEGER NOT NULL REFERENCES metric_definitions(id),
    timestamp    INTEGER NOT NULL,
    value_sum    REAL NOT NULL,
    value_count  INTEGER NOT NULL,
    value_min    REAL,
    value_max    REAL,
    value_last   REAL,
    PRIMARY KEY (metric_id, timestamp)
) WITHOUT ROWID;

CREATE TABLE IF NOT EXISTS metric_data_day (
    metric_id    INTEGER NOT NULL REFERENCES metric_definitions(id),
    timestamp    INTEGER NOT NULL,
    value_sum    REAL NOT NULL,
    value_count  INTEGER NOT NULL,
    value_min    REAL,
    value_max    REAL,
    value_last   REAL,
    PRIMARY KEY (metric_id, timestamp)
) WITHOUT ROWID;
";

/// Outcome of moving one resolution's expired rows into the next
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct RollupOutcome {
    /// Metrics that had rows past the cutoff
    pub metrics: usize,
    /// Source rows consumed and deleted
    pub source_rows: usize,
    /// Destination buckets created or merged into
    pub target_buckets: usize,
}

/// Embedded transactional store for metric buckets
pub struct MetricStore {
    writer: Mutex<Connection>,
    reader: Option<Mutex<Connection>>,
    path: Option<PathBuf>,
}

impl MetricStore {
    /// Open or create a store at `db_path`, creating parent directories.
    pub fn open(db_path: &Path) -> Result<Self> {
        let _span = info_span!("metric_store_open", path = %db_path.display()).entered();

        if let Some(parent) = db_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            std::fs::create_dir_all(parent)?;
        }

        let writer = Connection::open(db_path)?;
        writer.execute_batch(
            "PRAGMA journal_mode=WAL; PRAGMA synchronous=NORMAL; PRAGMA foreign_keys=ON;",
        )?;
        writer.busy_timeout(BUSY_TIMEOUT)?;
        writer.execute_batch(SCHEMA)?;

        let reader = Connection::open_with_flags(
            db_path,
            OpenFlags::SQLITE_OPEN_READ_ONLY | OpenFlags::SQLITE_OPEN_NO_MUTEX,
        )?;
        reader.busy_timeout(BUSY_TIMEOUT)?;

        tracing::info!("Opened metric store at {}", db_path.display());

        Ok(Self {
            writer: Mutex::new(writer),
            reader: Some(Mutex::new(reader)),
            path: Some(db_path.to_path_buf()),
        })
    }

    /// Open an in-memory store (for testing). Reads share the writer.
    pub fn open_in_memory() -> Result<Self> {
        let conn = Connection::open_in_memory()?;
        conn.execute_batch("PRAGMA foreign_keys=ON;")?;
        conn.execute_batch(SCHEMA)?;

        Ok(Self {
            writer: Mutex::new(conn),
            reader: None,
            path: None,
        })
    }

    /// Database file, `None` for in-memory stores
    pub fn path(&self) -> Option<&Path> {
        self.path.as_deref()
    }

    fn read<T>(&self, f: impl FnOnce(&Connection) -> Result<T>) -> Result<T> {
        match &self.reader {
            Some(reader) => f(&reader.lock()),
            None => f(&self.writer.lock()),
        }
    }

    /// Insert a definition unless its key exists, then return the stored row.
    pub fn ensure_definition(&self, definition: &MetricDefinition) -> Result<RegisteredMetric> {
        insert_definition(&self.writer.lock(), definition)
    }

    /// Stored definition for `key`, if any
    pub fn find_definition(&self, key: &str) -> Result<Option<RegisteredMetric>> {
        self.read(|conn| select_definition(conn, key))
    }

    /// Every stored definition, ordered by key
    pub fn list_definitions(&self) -> Result<Vec<RegisteredMetric>> {
        self.read(|conn| {
            let mut stmt =
                conn.prepare("SELECT id, key, type, unit FROM metric_definitions ORDER BY key")?;
            let rows = stmt.query_map([], definition_columns)?;
            let mut result = Vec::new();
            for row in rows {
                result.push(into_registered(row?)?);
            }
            Ok(result)
        })
    }

    /// Merge buckets into `resolution` in one transaction.
    ///
    /// Existing rows are combined, not replaced: sums and counts add, min/max
    /// tighten and `last` takes the incoming value. Either every bucket is
    /// written or none is. Returns the number of buckets merged.
    pub fn merge_buckets(
        &self,
        resolution: Resolution,
        batches: &[(MetricId, Vec<MetricBucket>)],
    ) -> Result<usize> {
        let _span = info_span!("metric_store_merge", resolution = %resolution).entered();

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut merged = 0;
        for (metric_id, buckets) in batches {
            for bucket in buckets {
                upsert_bucket(&tx, resolution, *metric_id, bucket)?;
                merged += 1;
            }
        }
        tx.commit()?;
        Ok(merged)
    }

    /// Register definitions and merge their buckets into `resolution` in one
    /// transaction, so a failed tick leaves neither rows nor definitions.
    ///
    /// A key already stored under another type keeps that type and its
    /// buckets from this batch are skipped. Returns the stored definitions in
    /// batch order.
    pub fn merge_metrics(
        &self,
        resolution: Resolution,
        batches: &[(MetricDefinition, Vec<MetricBucket>)],
    ) -> Result<Vec<RegisteredMetric>> {
        let _span = info_span!("metric_store_merge", resolution = %resolution).entered();

        let mut conn = self.writer.lock();
        let tx = conn.transaction()?;
        let mut registered = Vec::with_capacity(batches.len());
        for (definition, buckets) in batches {
            let stored = insert_definition(&tx, definition)?;
            if stored.kind == definition.kind {
                for bucket in buckets {
                    upsert_bucket(&tx, resolution, stored.id, bucket)?;
                }
            } else {
                tracing::warn!(
                    key = %definition.key,
                    stored = %stored.kind,
                    incoming = %definition.kind,
                    buckets = buckets.len(),
                    "Skipped buckets for a metric stored under another type"
                );
            }
            registered.push(stored);
        }
        tx.commit()?;
        Ok(registered)
    }

    /// Buckets of one metric with `start <= timestamp <= end`, ascending
    pub fn read_buckets(
        &self,
        metric_id: MetricId,
        resolution: Resolution,
        start: i64,
        end: i64,
    ) -> Result<Vec<MetricBucket>> {
        self.read(|conn| {
            let mut stmt = conn.prepare_cached(&format!(
                "SELECT timestamp, value_sum, value_count, value_min, value_max, value_last \
                 FROM {} WHERE metric_id = ?1 AND timestamp >= ?2 AND timestamp <= ?3 \
                 ORDER BY timestamp",
                resolution.table()
            ))?;
            let rows = stmt.query_map(params![metric_id, start, end], bucket_from_row)?;
            Ok(rows.collect::<rusqlite::Result<Vec<_>>>()?)
        })
    }

    /// Sum of `value_sum` over every resolution. `None` when the metric has
    /// no rows at all.
    pub fn counter_total(&self, metric_id: MetricId) -> Result<Option<f64>> {
        self.read(|conn| {
            let (total, rows): (Option<f64>, i64) = conn.query_row(
                "SELECT SUM(value_sum), COUNT(*) FROM ( \
                     SELECT value_sum FROM metric_data_minute WHERE metric_id = ?1 \
                     UNION ALL SELECT value_sum FROM metric_data_hour WHERE metric_id = ?1 \
                     UNION ALL SELECT value_sum FROM metric_data_day WHERE metric_id = ?1)",
                params![metric_id],
                |row| Ok((row.get(0)?, row.get(1)?)),
            )?;
            Ok(if rows == 0 { None } else { total })
        })
    }

    /// `last` of the most recent bucket across every resolution. On equal
    /// bucket starts the finer resolution wins.
    pub fn latest_gauge(&self, metric_id: MetricId) -> Result<Option<f64>> {
        self.read(|conn| {
            let last = conn
                .query_row(
                    "SELECT value_last FROM ( \
                         SELECT timestamp, value_last, 0 AS rank FROM metric_data_minute \
                             WHERE metric_id = ?1 AND value_last IS NOT NULL \
                         UNION ALL SELECT timestamp, value_last, 1 FROM metric_data_hour \
                             WHERE metric_id = ?1 AND value_last IS NOT NULL \
                         UNION ALL SELECT timestamp, value_last, 2 FROM metric_data_day \
                             WHERE metric_id = ?1 AND value_last IS NOT NULL) \
                     ORDER BY timestamp DESC, rank ASC LIMIT 1",
                    params![metric_id],
                    |row| row.get(0),
                )
                .optional()?;
            Ok(last)
        })
    }

    /// Move every `from` bucket with `timestamp < cutoff` into the next
    /// coarser resolution and delete it.
    ///
    /// Each metric is handled in its own transaction that both merges into
    /// the destination and deletes the source rows, so a bucket is never
    /// visible in both places or in neither.
    pub fn roll_up(&self, from: Resolution, cutoff: i64) -> Result<RollupOutcome> {
        let to = from.coarser().ok_or_else(|| {
            MetricsError::validation(format!("{} is the coarsest resolution", from))
        })?;
        let _span = info_span!("metric_store_rollup", from = %from, to = %to, cutoff).entered();

        let mut conn = self.writer.lock();
        let metric_ids: Vec<MetricId> = {
            let mut stmt = conn.prepare(&format!(
                "SELECT DISTINCT metric_id FROM {} WHERE timestamp < ?1",
                from.table()
            ))?;
            let rows = stmt.query_map(params![cutoff], |row| row.get(0))?;
            rows.collect::<rusqlite::Result<_>>()?
        };

        let mut outcome = RollupOutcome::default();
        for metric_id in metric_ids {
            let tx = conn.transaction()?;

            let expired = {
                let mut stmt = tx.prepare_cached(&format!(
                    "SELECT timestamp, value_sum, value_count, value_min, value_max, value_last \
                     FROM {} WHERE metric_id = ?1 AND timestamp < ?2 ORDER BY timestamp",
                    from.table()
                ))?;
                let rows = stmt.query_map(params![metric_id, cutoff], bucket_from_row)?;
                rows.collect::<rusqlite::Result<Vec<_>>>()?
            };

            let rolled = rebucket(&expired, to);
            for bucket in &rolled {
                upsert_bucket(&tx, to, metric_id, bucket)?;
            }

            let deleted = tx.execute(
                &format!("DELETE FROM {} WHERE metric_id = ?1 AND timestamp < ?2", from.table()),
                params![metric_id, cutoff],
            )?;
            if deleted != expired.len() {
                return Err(MetricsError::storage(format!(
                    "rollup of metric {} read {} rows but deleted {}",
                    metric_id,
                    expired.len(),
                    deleted
                )));
            }
            tx.commit()?;

            outcome.metrics += 1;
            outcome.source_rows += deleted;
            outcome.target_buckets += rolled.len();
        }

        Ok(outcome)
    }

    /// Delete every bucket of `resolution` with `timestamp < cutoff`
    pub fn prune(&self, resolution: Resolution, cutoff: i64) -> Result<usize> {
        let _span = info_span!("metric_store_prune", resolution = %resolution, cutoff).entered();

        let conn = self.writer.lock();
        let deleted = conn.execute(
            &format!("DELETE FROM {} WHERE timestamp < ?1", resolution.table()),
            params![cutoff],
        )?;
        Ok(deleted)
    }

    /// Number of rows stored at `resolution`
    pub fn row_count(&self, resolution: Resolution) -> Result<u64> {
        self.read(|conn| {
            let count: i64 = conn.query_row(
                &format!("SELECT COUNT(*) FROM {}", resolution.table()),
                [],
                |row| row.get(0),
            )?;
            Ok(u64::try_from(count).unwrap_or(0))
        })
    }
}

impl std::fmt::Debug for MetricStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MetricStore")
            .field("path", &self.path)
            .field("split_reader", &self.reader.is_some())
            .finish_non_exhaustive()
    }
}

fn upsert_bucket(
    conn: &Connection,
    resolution: Resolution,
    metric_id: MetricId,
    bucket: &MetricBucket,
) -> Result<()> {
    let mut stmt = conn.prepare_cached(&format!(
        "INSERT INTO {} \
         (metric_id, timestamp, value_sum, value_count, value_min, value_max, value_last) \
         VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7) \
         ON CONFLICT (metric_id, timestamp) DO UPDATE SET \
             value_sum = value_sum + excluded.value_sum, \
             value_count = value_count + excluded.value_count, \
             value_min = CASE \
                 WHEN value_min IS NULL THEN excluded.value_min \
                 WHEN excluded.value_min IS NULL THEN value_min \
                 ELSE min(value_min, excluded.value_min) END, \
             value_max = CASE \
                 WHEN value_max IS NULL THEN excluded.value_max \
                 WHEN excluded.value_max IS NULL THEN value_max \
                 ELSE max(value_max, excluded.value_max) END, \
             value_last = COALESCE(excluded.value_last, value_last)",
        resolution.table()
    ))?;
    stmt.execute(params![
        metric_id,
        bucket.timestamp,
        bucket.sum,
        i64::try_from(bucket.count).unwrap_or(i64::MAX),
        bucket.min,
        bucket.max,
        bucket.last,
    ])?;
    Ok(())
}

fn bucket_from_row(row: &rusqlite::Row<'_>) -> rusqlite::Result<MetricBucket> {
    Ok(MetricBucket {
        timestamp: row.get(0)?,
        sum: row.get(1)?,
        count: u64::try_from(row.get::<_, i64>(2)?).unwrap_or(0),
        min: row.get(3)?,
        max: row.get(4)?,
        last: row.get(5)?,
    })
}

type DefinitionColumns = (MetricId, String, String, Option<String>);

fn definition_columns(row: &rusqlite::Row<'_>) -> rusqlite::Result<DefinitionColumns> {
    Ok((row.get(0)?, row.get(1)?, row.get(2)?, row.get(3)?))
}

fn into_registered((id, key, kind, unit): DefinitionColumns) -> Result<RegisteredMetric> {
    Ok(RegisteredMetric {
        id,
        key,
        kind: kind.parse::<MetricKind>()?,
        unit,
    })
}

fn insert_definition(conn: &Connection, definition: &MetricDefinition) -> Result<RegisteredMetric> {
    conn.execute(
        "INSERT INTO metric_definitions (key, type, unit) VALUES (?1, ?2, ?3) \
         ON CONFLICT (key) DO NOTHING",
        params![definition.key, definition.kind.as_str(), definition.unit],
    )?;
    select_definition(conn, &definition.key)?.ok_or_else(|| {
        MetricsError::storage(format!("definition for '{}' vanished after insert", definition.key))
    })
}

fn select_definition(conn: &Connection, key: &str) -> Result<Option<RegisteredMetric>> {
    let columns = conn
        .query_row(
            "SELECT id, key, type, unit FROM metric_definitions WHERE key = ?1",
            params![key],
            definition_columns,
        )
        .optional()?;
    columns.map(into_registered).transpose()
}

/// Merge time-ordered buckets into buckets of the coarser `to` resolution.
fn rebucket(buckets: &[MetricBucket], to: Resolution) -> Vec<MetricBucket> {
    let mut rolled: BTreeMap<i64, MetricBucket> = BTreeMap::new();
    for bucket in buckets {
        let start = to.align(bucket.timestamp);
        rolled
            .entry(start)
            .and_modify(|existing| existing.merge(bucket))
            .or_insert_with(|| bucket.realigned(to));
    }
    rolled.into_values().collect()
}
