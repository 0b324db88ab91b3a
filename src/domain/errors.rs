use thiserror::Error;

use crate::domain::market::interval::Interval;

/// Errors produced by market-data providers, both at subscription time and
/// mid-stream. Only `Cancelled` ends a run; everything else is surfaced and
/// the stream keeps going.
#[derive(Debug, Error)]
pub enum MarketDataError {
    #[error("validation failed: {0}")]
    Validation(String),

    #[error("unknown symbols: {}", .0.join(", "))]
    UnknownSymbols(Vec<String>),

    #[error("interval {interval} is not supported by the {provider} provider")]
    UnsupportedInterval {
        provider: &'static str,
        interval: Interval,
    },

    #[error("connection failed for {symbol}: {reason}")]
    ConnectionFailed { symbol: String, reason: String },

    #[error("stream error: {0}")]
    Stream(String),

    #[error("download failed for {ticker}: {reason}")]
    DownloadFailed { ticker: String, reason: String },

    #[error("operation cancelled")]
    Cancelled,
}

/// Errors from the streaming candle writer.
#[derive(Debug, Error)]
pub enum WriterError {
    #[error("writer is not initialized")]
    NotInitialized,

    #[error("writer is closed")]
    Closed,

    #[error("persistence failed: {0}")]
    Persistence(String),
}

/// Structured order-placement failures, visible to the strategy through the
/// host API so it can react (skip, resize, log).
#[derive(Debug, Error)]
pub enum OrderError {
    #[error("order rejected: {reason}")]
    Rejected { reason: String },

    #[error("insufficient balance: {reason}")]
    InsufficientBalance { reason: String },

    #[error("unknown symbol: {symbol}")]
    UnknownSymbol { symbol: String },

    #[error("invalid order: {reason}")]
    Invalid { reason: String },

    #[error("trading provider failure: {0}")]
    Provider(String),
}

#[derive(Debug, Error)]
pub enum StrategyError {
    #[error("strategy load failed: {0}")]
    Load(String),

    #[error("strategy initialization failed: {0}")]
    Initialize(String),

    #[error("strategy processing failed: {0}")]
    Process(String),
}

/// Engine-level errors. The setup kinds (`NotInitialized`,
/// `StrategyNotLoaded`, `ProviderNotSet`, `Validation`) abort `run` before
/// `on_engine_start`; `Cancelled` is the nominal shutdown path.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error("engine is not initialized")]
    NotInitialized,

    #[error("engine is already initialized")]
    AlreadyInitialized,

    #[error("no strategy loaded")]
    StrategyNotLoaded,

    #[error("a strategy is already loaded")]
    StrategyAlreadyLoaded,

    #[error("{0} provider not set")]
    ProviderNotSet(&'static str),

    #[error("invalid configuration: {0}")]
    Validation(String),

    #[error(transparent)]
    MarketData(#[from] MarketDataError),

    #[error(transparent)]
    Persistence(#[from] WriterError),

    #[error(transparent)]
    Strategy(#[from] StrategyError),

    #[error("run cancelled")]
    Cancelled,
}
