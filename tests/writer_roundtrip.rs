//! Round-trip laws for the streaming writer and the SQL read path.

use chrono::{TimeZone, Utc};
use candleflow::domain::market::{Candle, Interval};
use candleflow::domain::ports::CandleSink;
use candleflow::infrastructure::persistence::{StreamWriter, query};

fn candle(symbol: &str, minute: i64, close: f64) -> Candle {
    Candle {
        symbol: symbol.to_string(),
        start_time: Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap()
            + chrono::Duration::minutes(minute),
        open: close - 0.5,
        high: close + 1.0,
        low: close - 1.0,
        close,
        volume: 2.0,
        is_final: true,
    }
}

#[tokio::test]
async fn test_write_close_reopen_contains_latest_values() {
    let dir = tempfile::tempdir().unwrap();

    {
        let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
        writer.initialize().unwrap();
        writer.write(&candle("BTCUSDT", 0, 100.0)).unwrap();
        // Same key, updated payload: upsert keeps the latest values.
        writer.write(&candle("BTCUSDT", 0, 105.0)).unwrap();
        let path = writer.finalize().unwrap();
        assert!(path.exists());
        writer.close().unwrap();
    }

    let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
    writer.initialize().unwrap();
    let path = writer.output_path();

    assert_eq!(query::count_rows(&path).await.unwrap(), 1);
    let last = query::last_stored_time(&path, "BTCUSDT").await.unwrap();
    assert_eq!(last, Some(candle("BTCUSDT", 0, 0.0).start_time));
}

#[tokio::test]
async fn test_two_runs_union_under_upsert() {
    let dir = tempfile::tempdir().unwrap();

    // Run A writes minutes 0..10, run B overlaps 5..15.
    {
        let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
        writer.initialize().unwrap();
        for minute in 0..10 {
            writer.write(&candle("BTCUSDT", minute, 100.0)).unwrap();
        }
        writer.close().unwrap();
    }
    {
        let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
        writer.initialize().unwrap();
        for minute in 5..15 {
            writer.write(&candle("BTCUSDT", minute, 200.0)).unwrap();
        }
        writer.close().unwrap();
    }

    let path = dir.path().join("stream_data_mock_1m.parquet");
    // Union by key: 15 distinct minutes, not 20 rows.
    assert_eq!(query::count_rows(&path).await.unwrap(), 15);

    let (min, max) = query::time_bounds(&path).await.unwrap().unwrap();
    assert_eq!(min, candle("BTCUSDT", 0, 0.0).start_time);
    assert_eq!(max, candle("BTCUSDT", 14, 0.0).start_time);
}

#[tokio::test]
async fn test_disjoint_ranges_are_contiguous_and_ascending() {
    let dir = tempfile::tempdir().unwrap();
    let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
    writer.initialize().unwrap();

    // "Bulk download" range, then a "live" range right after it.
    for minute in 0..30 {
        writer.write(&candle("BTCUSDT", minute, 100.0)).unwrap();
    }
    for minute in 30..40 {
        writer.write(&candle("BTCUSDT", minute, 110.0)).unwrap();
    }

    let path = writer.output_path();
    assert_eq!(query::count_rows(&path).await.unwrap(), 40);

    let (min, max) = query::time_bounds(&path).await.unwrap().unwrap();
    let span_minutes = (max - min).num_minutes();
    // Strictly ascending with no holes: span == rows - 1 intervals.
    assert_eq!(span_minutes, 39);
}

#[tokio::test]
async fn test_flush_and_finalize_are_observable() {
    let dir = tempfile::tempdir().unwrap();
    let writer = StreamWriter::new(dir.path(), "mock", Interval::FiveMinutes);
    writer.initialize().unwrap();

    writer.write(&candle("ETHUSDT", 0, 2000.0)).unwrap();
    writer.flush().unwrap();

    let path = writer.finalize().unwrap();
    assert!(path.ends_with("stream_data_mock_5m.parquet"));
    assert_eq!(query::count_rows(&path).await.unwrap(), 1);
}
