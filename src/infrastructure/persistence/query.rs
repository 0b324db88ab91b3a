//! Read-only SQL queries against a stream file.
//!
//! Readers open a short-lived DataFusion session per query; they never hold
//! the writer's lock and tolerate the file not existing yet (no candle has
//! been persisted).

use anyhow::{Context, Result};
use arrow::array::{Array, Int64Array, TimestampMillisecondArray};
use chrono::{DateTime, Utc};
use datafusion::prelude::{ParquetReadOptions, SessionContext};
use std::path::Path;

const TABLE: &str = "candles";

async fn session_for(path: &Path) -> Result<SessionContext> {
    let ctx = SessionContext::new();
    let path_str = path
        .to_str()
        .context("stream file path is not valid UTF-8")?;
    ctx.register_parquet(TABLE, path_str, ParquetReadOptions::default())
        .await
        .with_context(|| format!("failed to register {}", path.display()))?;
    Ok(ctx)
}

fn escape(symbol: &str) -> String {
    symbol.replace('\'', "''")
}

/// Latest stored `start_time` for `symbol`, or `None` when the file or the
/// symbol's rows are missing.
pub async fn last_stored_time(path: &Path, symbol: &str) -> Result<Option<DateTime<Utc>>> {
    if !path.exists() {
        return Ok(None);
    }

    let ctx = session_for(path).await?;
    let sql = format!(
        "SELECT MAX(start_time) AS last_start FROM {TABLE} WHERE symbol = '{}'",
        escape(symbol)
    );
    let batches = ctx.sql(&sql).await?.collect().await?;

    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .context("MAX(start_time) returned an unexpected type")?;
        if col.is_null(0) {
            return Ok(None);
        }
        return Ok(DateTime::from_timestamp_millis(col.value(0)));
    }
    Ok(None)
}

/// Total row count; zero when the file does not exist.
pub async fn count_rows(path: &Path) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let ctx = session_for(path).await?;
    let batches = ctx
        .sql(&format!("SELECT COUNT(*) FROM {TABLE}"))
        .await?
        .collect()
        .await?;

    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("COUNT(*) returned an unexpected type")?;
        return Ok(col.value(0) as u64);
    }
    Ok(0)
}

/// `(min, max)` of `start_time` across the whole file.
pub async fn time_bounds(path: &Path) -> Result<Option<(DateTime<Utc>, DateTime<Utc>)>> {
    if !path.exists() {
        return Ok(None);
    }

    let ctx = session_for(path).await?;
    let batches = ctx
        .sql(&format!(
            "SELECT MIN(start_time), MAX(start_time) FROM {TABLE}"
        ))
        .await?
        .collect()
        .await?;

    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let min_col = batch
            .column(0)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .context("MIN(start_time) returned an unexpected type")?;
        let max_col = batch
            .column(1)
            .as_any()
            .downcast_ref::<TimestampMillisecondArray>()
            .context("MAX(start_time) returned an unexpected type")?;
        if min_col.is_null(0) || max_col.is_null(0) {
            return Ok(None);
        }
        let min = DateTime::from_timestamp_millis(min_col.value(0));
        let max = DateTime::from_timestamp_millis(max_col.value(0));
        return Ok(min.zip(max));
    }
    Ok(None)
}

/// Row count for one symbol.
pub async fn count_rows_for_symbol(path: &Path, symbol: &str) -> Result<u64> {
    if !path.exists() {
        return Ok(0);
    }

    let ctx = session_for(path).await?;
    let sql = format!(
        "SELECT COUNT(*) FROM {TABLE} WHERE symbol = '{}'",
        escape(symbol)
    );
    let batches = ctx.sql(&sql).await?.collect().await?;

    for batch in batches {
        if batch.num_rows() == 0 {
            continue;
        }
        let col = batch
            .column(0)
            .as_any()
            .downcast_ref::<Int64Array>()
            .context("COUNT(*) returned an unexpected type")?;
        return Ok(col.value(0) as u64);
    }
    Ok(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::market::{Candle, Interval};
    use crate::domain::ports::CandleSink;
    use crate::infrastructure::persistence::StreamWriter;

    fn candle(symbol: &str, minute: i64) -> Candle {
        Candle {
            symbol: symbol.to_string(),
            start_time: DateTime::from_timestamp_millis(minute * 60_000).unwrap(),
            open: 10.0,
            high: 11.0,
            low: 9.0,
            close: 10.5,
            volume: 1.0,
            is_final: true,
        }
    }

    #[tokio::test]
    async fn test_missing_file_reads_as_empty() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("stream_data_mock_1m.parquet");
        assert_eq!(last_stored_time(&path, "BTCUSDT").await.unwrap(), None);
        assert_eq!(count_rows(&path).await.unwrap(), 0);
        assert_eq!(time_bounds(&path).await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_last_stored_time_per_symbol() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
        writer.initialize().unwrap();
        writer.write(&candle("BTCUSDT", 10)).unwrap();
        writer.write(&candle("BTCUSDT", 12)).unwrap();
        writer.write(&candle("ETHUSDT", 11)).unwrap();

        let path = writer.output_path();
        let last = last_stored_time(&path, "BTCUSDT").await.unwrap().unwrap();
        assert_eq!(last.timestamp_millis(), 12 * 60_000);

        // Unknown symbol: no rows, gap treated as zero upstream.
        assert_eq!(last_stored_time(&path, "SOLUSDT").await.unwrap(), None);
    }

    #[tokio::test]
    async fn test_counts_and_bounds() {
        let dir = tempfile::tempdir().unwrap();
        let writer = StreamWriter::new(dir.path(), "mock", Interval::OneMinute);
        writer.initialize().unwrap();
        for minute in [3, 1, 2] {
            writer.write(&candle("BTCUSDT", minute)).unwrap();
        }
        writer.write(&candle("ETHUSDT", 4)).unwrap();

        let path = writer.output_path();
        assert_eq!(count_rows(&path).await.unwrap(), 4);
        assert_eq!(count_rows_for_symbol(&path, "BTCUSDT").await.unwrap(), 3);

        let (min, max) = time_bounds(&path).await.unwrap().unwrap();
        assert_eq!(min.timestamp_millis(), 60_000);
        assert_eq!(max.timestamp_millis(), 4 * 60_000);
    }
}
