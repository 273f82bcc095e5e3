//! End-to-end engine tests: ingestion, flush, rollup and queries.

mod common;

use common::{at, memory_engine, quiet_config, BASE};
use pretty_assertions::assert_eq;
use std::sync::Arc;
use std::time::Duration;
use tsmetrics_lib::core::ConfigBuilder;
use tsmetrics_lib::metrics::types::to_datetime;
use tsmetrics_lib::{MetricsEngine, Resolution};

const DAY: u64 = 86_400;

#[tokio::test]
async fn test_counter_flushes_to_one_minute_row() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(quiet_config(&dir.path().join("metrics.db")));

    for secs in [10, 17, 25, 38, 45] {
        engine.collector().increment_at("songs_played", 1.0, None, at(secs));
    }
    engine.flush_now().await.unwrap();

    let points = engine
        .get_history("songs_played", at(0), at(59), Resolution::Minute)
        .unwrap();
    assert_eq!(points.len(), 1);
    assert_eq!(points[0].timestamp, at(0));
    assert_eq!(points[0].value, 5.0);
    assert_eq!(points[0].count, 5);
    assert_eq!(engine.get_aggregate("songs_played").unwrap(), Some(5.0));
    assert_eq!(engine.stats().unwrap().minute_rows, 1);

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_gauge_history_is_average_not_last() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(quiet_config(&dir.path().join("metrics.db")));

    for (secs, value) in [(5, 10.0), (20, 50.0), (40, 90.0)] {
        engine.collector().gauge_at("cpu_usage_percent", value, None, at(secs));
    }
    engine.flush_now().await.unwrap();

    let points = engine
        .get_history("cpu_usage_percent", at(0), at(0), Resolution::Minute)
        .unwrap();
    assert_eq!(points.len(), 1);
    let point = &points[0];
    assert_eq!(point.value, 50.0);
    assert_eq!(point.count, 3);
    assert_eq!(point.min, Some(10.0));
    assert_eq!(point.max, Some(90.0));
    assert_eq!(point.last, Some(90.0));
    assert_eq!(engine.get_aggregate("cpu_usage_percent").unwrap(), Some(90.0));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_partial_flushes_converge() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(quiet_config(&dir.path().join("metrics.db")));
    let collector = Arc::clone(engine.collector());

    collector.gauge_at("temperature", 20.0, None, at(1));
    collector.increment_at("errors", 2.0, None, at(1));
    engine.flush_now().await.unwrap();
    collector.gauge_at("temperature", 30.0, None, at(30));
    collector.gauge_at("temperature", 10.0, None, at(31));
    collector.increment_at("errors", 3.0, None, at(30));
    engine.flush_now().await.unwrap();

    let temperature = engine
        .get_history("temperature", at(0), at(59), Resolution::Minute)
        .unwrap();
    assert_eq!(temperature.len(), 1);
    assert_eq!(temperature[0].value, 20.0);
    assert_eq!(temperature[0].min, Some(10.0));
    assert_eq!(temperature[0].max, Some(30.0));
    assert_eq!(temperature[0].last, Some(10.0));

    let errors = engine.get_history("errors", at(0), at(59), Resolution::Minute).unwrap();
    assert_eq!((errors[0].value, errors[0].count), (5.0, 2));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_rollup_preserves_counter_totals() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .storage_path(dir.path().join("metrics.db"))
        .flush_interval(Duration::from_secs(3_600))
        .rollup_interval(Duration::from_secs(3_600))
        .retention(Duration::from_secs(3_600), Duration::from_secs(7 * DAY), Duration::from_secs(365 * DAY))
        .build()
        .unwrap();
    let engine = memory_engine(config);

    // Two full hours of minute data, all older than the one-hour minute retention
    let base = Resolution::Hour.align(chrono::Utc::now().timestamp()) - 3 * 3_600;
    let mut expected = 0.0;
    for minute in 0..120u32 {
        let delta = f64::from(minute % 5 + 1);
        expected += delta;
        engine
            .collector()
            .increment_at("api_requests", delta, None, to_datetime(base + i64::from(minute) * 60));
    }
    engine.flush_now().await.unwrap();

    let start = to_datetime(base);
    let end = to_datetime(base + 2 * 3_600 - 1);
    let minutes = engine.get_history("api_requests", start, end, Resolution::Minute).unwrap();
    assert_eq!(minutes.len(), 120);
    assert_eq!(minutes.iter().map(|p| p.value).sum::<f64>(), expected);

    let report = engine.rollup_now().await.unwrap();
    assert_eq!(report.minute_to_hour.source_rows, 120);
    assert_eq!(report.minute_to_hour.target_buckets, 2);

    let hours = engine.get_history("api_requests", start, end, Resolution::Hour).unwrap();
    assert_eq!(hours.len(), 2);
    assert_eq!(hours.iter().map(|p| p.value).sum::<f64>(), expected);
    assert_eq!(hours.iter().map(|p| p.count).sum::<u64>(), 120);
    assert!(engine
        .get_history("api_requests", start, end, Resolution::Minute)
        .unwrap()
        .is_empty());
    assert_eq!(engine.get_aggregate("api_requests").unwrap(), Some(expected));

    let again = engine.rollup_now().await.unwrap();
    assert!(again.is_noop());
    assert_eq!(engine.get_aggregate("api_requests").unwrap(), Some(expected));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_late_minute_bucket_merges_into_rolled_hour() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .storage_path(dir.path().join("metrics.db"))
        .flush_interval(Duration::from_secs(3_600))
        .rollup_interval(Duration::from_secs(3_600))
        .retention(Duration::from_secs(3_600), Duration::from_secs(7 * DAY), Duration::from_secs(365 * DAY))
        .build()
        .unwrap();
    let engine = memory_engine(config);
    let hour = Resolution::Hour.align(chrono::Utc::now().timestamp()) - 3 * 3_600;

    engine.collector().increment_at("api_requests", 2.0, None, to_datetime(hour + 60));
    engine.flush_now().await.unwrap();
    engine.rollup_now().await.unwrap();
    assert_eq!(engine.get_aggregate("api_requests").unwrap(), Some(2.0));

    // A sample older than the minute cutoff arrives after its hour was rolled up
    engine.collector().increment_at("api_requests", 3.0, None, to_datetime(hour + 120));
    engine.flush_now().await.unwrap();
    let stats = engine.stats().unwrap();
    assert_eq!((stats.minute_rows, stats.hour_rows), (1, 1));
    assert_eq!(engine.get_aggregate("api_requests").unwrap(), Some(5.0));

    let report = engine.rollup_now().await.unwrap();
    assert_eq!(report.minute_to_hour.source_rows, 1);
    assert_eq!(report.minute_to_hour.target_buckets, 1);

    let stats = engine.stats().unwrap();
    assert_eq!((stats.minute_rows, stats.hour_rows), (0, 1));
    let hours = engine
        .get_history("api_requests", to_datetime(hour), to_datetime(hour), Resolution::Hour)
        .unwrap();
    assert_eq!(hours.len(), 1);
    assert_eq!((hours[0].value, hours[0].count), (5.0, 2));
    assert_eq!(engine.get_aggregate("api_requests").unwrap(), Some(5.0));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_gauge_aggregate_survives_rollup() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .storage_path(dir.path().join("metrics.db"))
        .retention(Duration::from_secs(60), Duration::from_secs(7 * DAY), Duration::from_secs(365 * DAY))
        .build()
        .unwrap();
    let engine = memory_engine(config);

    let base = Resolution::Hour.align(chrono::Utc::now().timestamp()) - 2 * 3_600;
    engine.collector().gauge_at("volume", 0.2, None, to_datetime(base + 60));
    engine.collector().gauge_at("volume", 0.7, None, to_datetime(base + 120));
    engine.flush_now().await.unwrap();
    engine.rollup_now().await.unwrap();

    let hours = engine
        .get_history("volume", to_datetime(base), to_datetime(base), Resolution::Hour)
        .unwrap();
    assert_eq!(hours.len(), 1);
    assert_eq!(hours[0].last, Some(0.7));
    assert_eq!(hours[0].min, Some(0.2));
    assert_eq!(engine.get_aggregate("volume").unwrap(), Some(0.7));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_concurrent_increments_flush_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let engine = memory_engine(quiet_config(&dir.path().join("metrics.db")));
    let threads: u32 = 8;
    let per_thread: u32 = 500;

    let handles: Vec<_> = (0..threads)
        .map(|t| {
            let collector = Arc::clone(engine.collector());
            std::thread::spawn(move || {
                for _ in 0..per_thread {
                    collector.increment_at("api_requests", f64::from(t), None, at(30));
                    collector.increment_at(&format!("worker_{}", t), 1.0, None, at(30));
                }
            })
        })
        .collect();
    for handle in handles {
        handle.join().unwrap();
    }
    engine.flush_now().await.unwrap();

    let points = engine.get_history("api_requests", at(0), at(0), Resolution::Minute).unwrap();
    assert_eq!(points[0].count, u64::from(threads * per_thread));
    let expected: f64 = (0..threads).map(|t| f64::from(t * per_thread)).sum();
    assert_eq!(points[0].value, expected);

    let workers: Vec<String> = (0..threads).map(|t| format!("worker_{}", t)).collect();
    let snapshot = engine.get_snapshots(workers.as_slice()).unwrap();
    assert_eq!(snapshot.len(), workers.len());
    assert!(snapshot.values().all(|v| *v == f64::from(per_thread)));

    engine.stop().await.unwrap();
}

#[tokio::test]
async fn test_disabled_engine_writes_nothing() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .storage_path(dir.path().join("metrics.db"))
        .enabled(false)
        .build()
        .unwrap();
    let engine = MetricsEngine::new(config).unwrap();
    engine.start().unwrap();

    engine.increment("songs_played", 1.0, None);
    engine.gauge("cpu_usage_percent", 50.0, None);
    assert!(!engine.collector().define("stream_bitrate", tsmetrics_lib::MetricKind::Gauge, None));
    engine.flush_now().await.unwrap();
    engine.stop().await.unwrap();

    assert!(engine.list_keys().unwrap().is_empty());
    let stats = engine.stats().unwrap();
    assert_eq!(stats.collector.tracked_keys, 0);
    assert_eq!((stats.minute_rows, stats.hour_rows, stats.day_rows), (0, 0, 0));
}

#[tokio::test]
async fn test_stop_runs_final_flush_and_data_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("nested").join("metrics.db");

    {
        let engine = MetricsEngine::new(quiet_config(&db)).unwrap();
        engine.start().unwrap();
        assert!(engine.is_running());
        engine.collector().define("stream_bitrate", tsmetrics_lib::MetricKind::Gauge, Some("kbps"));
        engine.gauge("stream_bitrate", 320.0, None);
        for _ in 0..3 {
            engine.increment("songs_played", 1.0, None);
        }
        engine.stop().await.unwrap();
        assert!(!engine.is_running());

        // Ingestion is closed after stop
        engine.increment("songs_played", 1.0, None);
        assert_eq!(engine.stats().unwrap().collector.buffered_samples, 0);
    }

    let engine = MetricsEngine::new(quiet_config(&db)).unwrap();
    assert_eq!(engine.list_keys().unwrap(), vec!["songs_played".to_string(), "stream_bitrate".to_string()]);
    assert_eq!(engine.get_aggregate("songs_played").unwrap(), Some(3.0));
    assert_eq!(engine.get_aggregate("stream_bitrate").unwrap(), Some(320.0));

    let definitions = engine.definitions().unwrap();
    assert_eq!(definitions[1].unit.as_deref(), Some("kbps"));
}

#[tokio::test]
async fn test_stored_type_survives_restart_with_other_type() {
    let dir = tempfile::tempdir().unwrap();
    let db = dir.path().join("metrics.db");

    {
        let engine = MetricsEngine::new(quiet_config(&db)).unwrap();
        engine.start().unwrap();
        engine.collector().increment_at("plays", 5.0, None, at(0));
        engine.stop().await.unwrap();
    }

    {
        let engine = MetricsEngine::new(quiet_config(&db)).unwrap();
        engine.start().unwrap();
        engine.collector().gauge_at("plays", 1_000.0, None, at(60));
        engine.collector().gauge_at("plays", 1_000.0, None, at(61));
        engine.stop().await.unwrap();
    }

    let engine = MetricsEngine::new(quiet_config(&db)).unwrap();
    assert_eq!(engine.get_aggregate("plays").unwrap(), Some(5.0));
    let definitions = engine.definitions().unwrap();
    assert_eq!(definitions.len(), 1);
    assert_eq!(definitions[0].kind, tsmetrics_lib::MetricKind::Counter);
    assert_eq!(engine.stats().unwrap().minute_rows, 1);
}

#[tokio::test]
async fn test_background_worker_flushes_on_schedule() {
    let dir = tempfile::tempdir().unwrap();
    let config = ConfigBuilder::new()
        .storage_path(dir.path().join("metrics.db"))
        .flush_interval(Duration::from_millis(20))
        .build()
        .unwrap();
    let engine = MetricsEngine::new(config).unwrap();
    engine.start().unwrap();

    engine.increment("api_requests", 4.0, None);
    let mut flushed = false;
    for _ in 0..100 {
        tokio::time::sleep(Duration::from_millis(20)).await;
        if engine.get_aggregate("api_requests").unwrap() == Some(4.0) {
            flushed = true;
            break;
        }
    }
    assert!(flushed);
    assert_eq!(engine.stats().unwrap().collector.buffered_samples, 0);

    engine.stop().await.unwrap();
}

#[test]
fn test_base_is_hour_aligned() {
    assert_eq!(BASE % 3_600, 0);
}
