//! Streaming candle writer.
//!
//! Finalized candles are upserted into an in-memory staging table keyed by
//! `(symbol, start_time)` and the whole table is re-exported to a parquet
//! file, globally ordered by `start_time`, on every write. The full rewrite
//! is deliberate: it keeps the on-disk file a single sorted, deduplicated
//! snapshot at all times, which is what restart recovery and the gap-fill
//! queries rely on. Throughput at live-candle rates makes this affordable.

use arrow::array::{ArrayRef, Float64Array, StringArray, TimestampMillisecondArray};
use arrow::datatypes::{DataType, Field, Schema, TimeUnit};
use arrow::record_batch::RecordBatch;
use parquet::arrow::ArrowWriter;
use parquet::arrow::arrow_reader::ParquetRecordBatchReaderBuilder;
use parquet::basic::Compression;
use parquet::file::properties::WriterProperties;
use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::domain::errors::WriterError;
use crate::domain::market::{Candle, Interval};
use crate::domain::ports::CandleSink;

/// Staging key: `(start_time_ms, symbol)`. Iterating a `BTreeMap` by this
/// key yields rows in the exact export order the file format requires.
type StagingKey = (i64, String);

#[derive(Debug, Clone)]
struct StoredRow {
    id: String,
    symbol: String,
    start_time_ms: i64,
    open: f64,
    high: f64,
    low: f64,
    close: f64,
    volume: f64,
}

enum WriterState {
    Created,
    Open(BTreeMap<StagingKey, StoredRow>),
    Closed,
}

/// Restart-safe parquet writer for one `(provider_tag, interval)` stream.
///
/// Thread-safe: every public method serializes on one mutex, per the
/// single-writer contract for the stored file.
pub struct StreamWriter {
    data_dir: PathBuf,
    path: PathBuf,
    state: Mutex<WriterState>,
}

impl StreamWriter {
    pub fn new(data_dir: impl Into<PathBuf>, provider_tag: &str, interval: Interval) -> Self {
        let data_dir = data_dir.into();
        let path = data_dir.join(format!("stream_data_{}_{}.parquet", provider_tag, interval));
        Self {
            data_dir,
            path,
            state: Mutex::new(WriterState::Created),
        }
    }

    fn schema() -> Arc<Schema> {
        Arc::new(Schema::new(vec![
            Field::new("id", DataType::Utf8, false),
            Field::new(
                "start_time",
                DataType::Timestamp(TimeUnit::Millisecond, Some("UTC".into())),
                false,
            ),
            Field::new("symbol", DataType::Utf8, false),
            Field::new("open", DataType::Float64, false),
            Field::new("high", DataType::Float64, false),
            Field::new("low", DataType::Float64, false),
            Field::new("close", DataType::Float64, false),
            Field::new("volume", DataType::Float64, false),
        ]))
    }

    /// Rewrite the output file from the staging table. Writes into a
    /// temporary sibling first and renames, so readers never observe a
    /// half-written file.
    fn export(path: &Path, rows: &BTreeMap<StagingKey, StoredRow>) -> Result<(), WriterError> {
        let schema = Self::schema();

        let ids: Vec<&str> = rows.values().map(|r| r.id.as_str()).collect();
        let times: Vec<i64> = rows.values().map(|r| r.start_time_ms).collect();
        let symbols: Vec<&str> = rows.values().map(|r| r.symbol.as_str()).collect();
        let opens: Vec<f64> = rows.values().map(|r| r.open).collect();
        let highs: Vec<f64> = rows.values().map(|r| r.high).collect();
        let lows: Vec<f64> = rows.values().map(|r| r.low).collect();
        let closes: Vec<f64> = rows.values().map(|r| r.close).collect();
        let volumes: Vec<f64> = rows.values().map(|r| r.volume).collect();

        let columns: Vec<ArrayRef> = vec![
            Arc::new(StringArray::from(ids)),
            Arc::new(TimestampMillisecondArray::from(times).with_timezone("UTC")),
            Arc::new(StringArray::from(symbols)),
            Arc::new(Float64Array::from(opens)),
            Arc::new(Float64Array::from(highs)),
            Arc::new(Float64Array::from(lows)),
            Arc::new(Float64Array::from(closes)),
            Arc::new(Float64Array::from(volumes)),
        ];

        let batch = RecordBatch::try_new(schema.clone(), columns)
            .map_err(|e| WriterError::Persistence(format!("record batch assembly failed: {e}")))?;

        let tmp_path = path.with_extension("parquet.tmp");
        let file = fs::File::create(&tmp_path)
            .map_err(|e| WriterError::Persistence(format!("create {}: {e}", tmp_path.display())))?;

        let props = WriterProperties::builder()
            .set_compression(Compression::SNAPPY)
            .build();

        let mut writer = ArrowWriter::try_new(file, schema, Some(props))
            .map_err(|e| WriterError::Persistence(format!("open parquet writer: {e}")))?;
        writer
            .write(&batch)
            .map_err(|e| WriterError::Persistence(format!("write parquet batch: {e}")))?;
        writer
            .close()
            .map_err(|e| WriterError::Persistence(format!("close parquet writer: {e}")))?;

        fs::rename(&tmp_path, path)
            .map_err(|e| WriterError::Persistence(format!("rename to {}: {e}", path.display())))?;

        Ok(())
    }

    /// Bulk-load an existing output file into a fresh staging table.
    fn load_existing(path: &Path) -> anyhow::Result<Vec<StoredRow>> {
        let file = fs::File::open(path)?;
        let reader = ParquetRecordBatchReaderBuilder::try_new(file)?.build()?;

        let mut rows = Vec::new();
        for batch in reader {
            let batch = batch?;
            let schema = batch.schema();

            let ids = column::<StringArray>(&batch, &schema, "id")?;
            let times = column::<TimestampMillisecondArray>(&batch, &schema, "start_time")?;
            let symbols = column::<StringArray>(&batch, &schema, "symbol")?;
            let opens = column::<Float64Array>(&batch, &schema, "open")?;
            let highs = column::<Float64Array>(&batch, &schema, "high")?;
            let lows = column::<Float64Array>(&batch, &schema, "low")?;
            let closes = column::<Float64Array>(&batch, &schema, "close")?;
            let volumes = column::<Float64Array>(&batch, &schema, "volume")?;

            for i in 0..batch.num_rows() {
                rows.push(StoredRow {
                    id: ids.value(i).to_string(),
                    symbol: symbols.value(i).to_string(),
                    start_time_ms: times.value(i),
                    open: opens.value(i),
                    high: highs.value(i),
                    low: lows.value(i),
                    close: closes.value(i),
                    volume: volumes.value(i),
                });
            }
        }
        Ok(rows)
    }
}

fn column<'a, A: 'static>(
    batch: &'a RecordBatch,
    schema: &Schema,
    name: &str,
) -> anyhow::Result<&'a A> {
    let index = schema.index_of(name)?;
    batch
        .column(index)
        .as_any()
        .downcast_ref::<A>()
        .ok_or_else(|| anyhow::anyhow!("column '{}' has an unexpected type", name))
}

impl CandleSink for StreamWriter {
    fn initialize(&self) -> Result<(), WriterError> {
        let mut state = self.state.lock().expect("writer mutex poisoned");

        if matches!(*state, WriterState::Open(_)) {
            return Ok(());
        }

        fs::create_dir_all(&self.data_dir).map_err(|e| {
            WriterError::Persistence(format!("create {}: {e}", self.data_dir.display()))
        })?;

        let mut staging = BTreeMap::new();
        if self.path.exists() {
            match Self::load_existing(&self.path) {
                Ok(rows) => {
                    for row in rows {
                        let key = (row.start_time_ms, row.symbol.clone());
                        // Existing rows never displace each other on load.
                        staging.entry(key).or_insert(row);
                    }
                    info!(
                        "StreamWriter: loaded {} existing rows from {}",
                        staging.len(),
                        self.path.display()
                    );
                }
                Err(e) => {
                    // A corrupt file is tolerated: start from an empty
                    // staging table and let the next export replace it.
                    warn!(
                        "StreamWriter: could not load {}, starting empty: {e}",
                        self.path.display()
                    );
                }
            }
        }

        *state = WriterState::Open(staging);
        Ok(())
    }

    fn write(&self, candle: &Candle) -> Result<(), WriterError> {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        let staging = match &mut *state {
            WriterState::Created => return Err(WriterError::NotInitialized),
            WriterState::Closed => return Err(WriterError::Closed),
            WriterState::Open(staging) => staging,
        };

        let key = (candle.start_time_ms(), candle.symbol.clone());
        let row = StoredRow {
            id: Uuid::new_v4().to_string(),
            symbol: candle.symbol.clone(),
            start_time_ms: candle.start_time_ms(),
            open: candle.open,
            high: candle.high,
            low: candle.low,
            close: candle.close,
            volume: candle.volume,
        };
        // Upsert: a re-delivered candle replaces all non-key fields.
        staging.insert(key, row);

        // An export failure leaves the staging table intact; the next
        // write retries the full rewrite.
        Self::export(&self.path, staging)?;
        debug!(
            "StreamWriter: wrote {} @ {} ({} rows total)",
            candle.symbol,
            candle.start_time,
            staging.len()
        );
        Ok(())
    }

    fn flush(&self) -> Result<(), WriterError> {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        match &mut *state {
            WriterState::Created => Err(WriterError::NotInitialized),
            WriterState::Closed => Err(WriterError::Closed),
            WriterState::Open(staging) => Self::export(&self.path, staging),
        }
    }

    fn finalize(&self) -> Result<PathBuf, WriterError> {
        self.flush()?;
        Ok(self.path.clone())
    }

    fn close(&self) -> Result<(), WriterError> {
        let mut state = self.state.lock().expect("writer mutex poisoned");
        *state = WriterState::Closed;
        Ok(())
    }

    fn output_path(&self) -> PathBuf {
        self.path.clone()
    }
}
