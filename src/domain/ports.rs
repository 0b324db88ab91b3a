use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use crate::domain::errors::{MarketDataError, OrderError, StrategyError, WriterError};
use crate::domain::market::{Candle, CandleStream, ConnectionStatus, Interval, Timespan};
use crate::domain::trading::{Account, ExecutedOrder, OrderRequest, Position};

/// Connection-status observer: `(symbol, status)` per transition.
pub type StatusHandler = Arc<dyn Fn(&str, ConnectionStatus) + Send + Sync>;

/// Bulk-download progress observer, called once per page with
/// `elapsed / total` in wall-clock units, clamped to `[0, 1]`.
pub type ProgressHandler = Arc<dyn Fn(f64) + Send + Sync>;

#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    /// Short tag used in the stored-file name (`stream_data_{tag}_{interval}`).
    fn provider_tag(&self) -> &'static str;

    fn supports_interval(&self, interval: Interval) -> bool;

    /// Attach the candle sink that bulk downloads write through.
    fn configure_writer(&self, sink: Arc<dyn CandleSink>);

    fn set_on_status_change(&self, handler: StatusHandler);

    /// Round-trip check of `symbols` against the venue before opening live
    /// connections. Errors with the full list of unknown symbols.
    async fn validate_symbols(
        &self,
        ctx: &CancellationToken,
        symbols: &[String],
    ) -> Result<(), MarketDataError>;

    /// Pull historical candles for `ticker` into the configured sink,
    /// page by page. Restart-safe: the sink upserts, so overlapping runs
    /// never duplicate rows. Returns the sink's output path.
    #[allow(clippy::too_many_arguments)]
    async fn download(
        &self,
        ctx: &CancellationToken,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        multiplier: u32,
        timespan: Timespan,
        on_progress: Option<ProgressHandler>,
    ) -> Result<PathBuf, MarketDataError>;

    /// Open one merged live stream over all configured symbols. Only
    /// finalized candles are emitted. Subscription-time failures (empty
    /// symbol list, unsupported interval) surface as a single error through
    /// the returned stream, never as a hang.
    fn stream(&self, ctx: &CancellationToken) -> CandleStream;
}

/// Append-only candle persistence keyed by `(symbol, start_time)`. All
/// methods are serialized internally; callers may be concurrent.
pub trait CandleSink: Send + Sync {
    fn initialize(&self) -> Result<(), WriterError>;
    fn write(&self, candle: &Candle) -> Result<(), WriterError>;
    fn flush(&self) -> Result<(), WriterError>;
    fn finalize(&self) -> Result<PathBuf, WriterError>;
    /// Idempotent.
    fn close(&self) -> Result<(), WriterError>;
    fn output_path(&self) -> PathBuf;
}

#[async_trait]
pub trait TradingProvider: Send + Sync {
    async fn place_order(&self, order: &OrderRequest) -> Result<ExecutedOrder, OrderError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), OrderError>;
    async fn get_open_orders(&self, symbol: Option<&str>)
    -> Result<Vec<ExecutedOrder>, OrderError>;
    async fn get_positions(&self) -> Result<Vec<Position>, OrderError>;
    async fn get_account(&self) -> Result<Account, OrderError>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum LogLevel {
    Debug,
    Info,
    Warn,
    Error,
}

/// Host capabilities exposed to the strategy sandbox. This object is the
/// strategy's only view of the engine: it is handed over at load time and
/// borrows the engine's lifetime, so no back-pointer from strategy to engine
/// ever exists.
#[async_trait]
pub trait StrategyApi: Send + Sync {
    fn get_cache(&self, key: &str) -> Option<serde_json::Value>;
    fn set_cache(&self, key: &str, value: serde_json::Value);

    async fn place_order(&self, order: OrderRequest) -> Result<ExecutedOrder, OrderError>;
    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), OrderError>;
    async fn get_open_orders(&self, symbol: Option<&str>)
    -> Result<Vec<ExecutedOrder>, OrderError>;

    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value);

    async fn get_positions(&self) -> Result<Vec<Position>, OrderError>;
    async fn get_account(&self) -> Result<Account, OrderError>;
}

/// The engine <-> sandbox contract. Candle processing is synchronous from
/// the engine's point of view: `process_data` is awaited to completion
/// before the next candle is delivered, so implementations must not assume
/// parallel delivery.
#[async_trait]
pub trait Strategy: Send {
    /// Called once before any data, with the embedder-supplied opaque
    /// configuration string. Errors here are fatal to the run.
    async fn initialize(
        &mut self,
        config: &str,
        api: Arc<dyn StrategyApi>,
    ) -> Result<(), StrategyError>;

    fn name(&self) -> String;
    fn description(&self) -> String;
    fn identifier(&self) -> String;

    fn config_schema(&self) -> String {
        "{}".to_string()
    }

    /// Errors are per-candle and non-fatal: they surface through
    /// `on_strategy_error` and the run continues.
    async fn process_data(&mut self, candle: &Candle) -> Result<(), StrategyError>;
}

/// Seam for an external sandbox runtime: turns a strategy artifact (raw
/// bytes, e.g. a compiled plugin) into a live [`Strategy`].
pub trait StrategyLoader: Send + Sync {
    fn load(&self, artifact: &[u8]) -> Result<Box<dyn Strategy>, StrategyError>;
}
