//! Mock market-data and trading adapters.
//!
//! Used by the integration tests and for embedder dry-runs: the market-data
//! mock replays a scripted per-symbol event sequence through the real stream
//! multiplexer, and the trading mock fills market orders against an
//! in-memory balance sheet.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use rand::Rng;
use rust_decimal::Decimal;
use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, RwLock};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::debug;

use crate::application::engine::EngineCallbacks;
use crate::application::market_data::StreamMux;
use crate::domain::errors::{EngineError, MarketDataError, OrderError, StrategyError};
use crate::domain::market::{Candle, CandleStream, ConnectionStatus, Interval, Timespan};
use crate::domain::ports::{
    CandleSink, MarketDataProvider, ProgressHandler, StatusHandler, TradingProvider,
};
use crate::domain::trading::{
    Account, Balance, ExecutedOrder, OrderRequest, OrderSide, OrderStatus, OrderType, Position,
    PositionType,
};

/// One step of a mock subscription's life.
#[derive(Debug, Clone)]
pub enum ScriptedEvent {
    Candle(Candle),
    /// Emitted as a `ConnectionFailed` stream error for the owning symbol.
    Error(String),
    Delay(Duration),
}

#[derive(Debug, Clone)]
pub struct DownloadCall {
    pub ticker: String,
    pub from: DateTime<Utc>,
    pub to: DateTime<Utc>,
}

pub struct MockMarketData {
    symbols: Vec<String>,
    interval: Interval,
    supported_intervals: Option<Vec<Interval>>,
    known_symbols: Option<Vec<String>>,
    scripts: Mutex<HashMap<String, Vec<ScriptedEvent>>>,
    history: Vec<Candle>,
    fail_downloads: bool,
    writer: RwLock<Option<Arc<dyn CandleSink>>>,
    status_handler: RwLock<Option<StatusHandler>>,
    download_calls: Mutex<Vec<DownloadCall>>,
}

impl MockMarketData {
    pub fn new(symbols: Vec<String>, interval: Interval) -> Self {
        Self {
            symbols,
            interval,
            supported_intervals: None,
            known_symbols: None,
            scripts: Mutex::new(HashMap::new()),
            history: Vec::new(),
            fail_downloads: false,
            writer: RwLock::new(None),
            status_handler: RwLock::new(None),
            download_calls: Mutex::new(Vec::new()),
        }
    }

    /// Script the live events for one symbol. Candles are replayed in order;
    /// the subscription ends when the script is exhausted.
    pub fn with_script(self, symbol: &str, events: Vec<ScriptedEvent>) -> Self {
        self.scripts
            .lock()
            .expect("scripts mutex poisoned")
            .insert(symbol.to_string(), events);
        self
    }

    pub fn with_candles(self, symbol: &str, candles: Vec<Candle>) -> Self {
        let events = candles.into_iter().map(ScriptedEvent::Candle).collect();
        self.with_script(symbol, events)
    }

    /// Candles served by the bulk-download path.
    pub fn with_history(mut self, candles: Vec<Candle>) -> Self {
        self.history = candles;
        self
    }

    pub fn with_known_symbols(mut self, symbols: Vec<String>) -> Self {
        self.known_symbols = Some(symbols);
        self
    }

    pub fn with_supported_intervals(mut self, intervals: Vec<Interval>) -> Self {
        self.supported_intervals = Some(intervals);
        self
    }

    pub fn with_failing_downloads(mut self) -> Self {
        self.fail_downloads = true;
        self
    }

    /// Bulk-download invocations observed so far (prefetch and gap fill
    /// assertions).
    pub fn download_calls(&self) -> Vec<DownloadCall> {
        self.download_calls
            .lock()
            .expect("download calls mutex poisoned")
            .clone()
    }
}

#[async_trait]
impl MarketDataProvider for MockMarketData {
    fn provider_tag(&self) -> &'static str {
        "mock"
    }

    fn supports_interval(&self, interval: Interval) -> bool {
        match &self.supported_intervals {
            Some(supported) => supported.contains(&interval),
            None => true,
        }
    }

    fn configure_writer(&self, sink: Arc<dyn CandleSink>) {
        *self.writer.write().expect("writer lock poisoned") = Some(sink);
    }

    fn set_on_status_change(&self, handler: StatusHandler) {
        *self
            .status_handler
            .write()
            .expect("status handler lock poisoned") = Some(handler);
    }

    async fn validate_symbols(
        &self,
        ctx: &CancellationToken,
        symbols: &[String],
    ) -> Result<(), MarketDataError> {
        if ctx.is_cancelled() {
            return Err(MarketDataError::Cancelled);
        }
        let Some(known) = &self.known_symbols else {
            return Ok(());
        };
        let unknown: Vec<String> = symbols
            .iter()
            .filter(|s| !known.contains(s))
            .cloned()
            .collect();
        if unknown.is_empty() {
            Ok(())
        } else {
            Err(MarketDataError::UnknownSymbols(unknown))
        }
    }

    async fn download(
        &self,
        ctx: &CancellationToken,
        ticker: &str,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
        _multiplier: u32,
        _timespan: Timespan,
        on_progress: Option<ProgressHandler>,
    ) -> Result<PathBuf, MarketDataError> {
        if ctx.is_cancelled() {
            return Err(MarketDataError::Cancelled);
        }

        self.download_calls
            .lock()
            .expect("download calls mutex poisoned")
            .push(DownloadCall {
                ticker: ticker.to_string(),
                from,
                to,
            });

        if self.fail_downloads {
            return Err(MarketDataError::DownloadFailed {
                ticker: ticker.to_string(),
                reason: "mock download failure".to_string(),
            });
        }

        let writer = self
            .writer
            .read()
            .expect("writer lock poisoned")
            .clone()
            .ok_or_else(|| {
                MarketDataError::Validation(
                    "bulk download requires a configured writer".to_string(),
                )
            })?;

        for candle in self
            .history
            .iter()
            .filter(|c| c.symbol == ticker && c.start_time >= from && c.start_time <= to)
        {
            writer.write(candle).map_err(|e| MarketDataError::DownloadFailed {
                ticker: ticker.to_string(),
                reason: e.to_string(),
            })?;
        }
        if let Some(progress) = on_progress {
            progress(1.0);
        }
        Ok(writer.output_path())
    }

    fn stream(&self, ctx: &CancellationToken) -> CandleStream {
        if self.symbols.is_empty() {
            return CandleStream::from_error(MarketDataError::Validation(
                "no symbols configured for streaming".to_string(),
            ));
        }
        if !self.supports_interval(self.interval) {
            return CandleStream::from_error(MarketDataError::UnsupportedInterval {
                provider: self.provider_tag(),
                interval: self.interval,
            });
        }

        let handler = self
            .status_handler
            .read()
            .expect("status handler lock poisoned")
            .clone();
        let mut scripts = self.scripts.lock().expect("scripts mutex poisoned");

        let mut mux = StreamMux::new(ctx, self.symbols.len());
        for symbol in &self.symbols {
            let script = scripts.remove(symbol).unwrap_or_default();
            let sink = mux.sink();
            let handler = handler.clone();
            let symbol = symbol.clone();

            mux.spawn(async move {
                if let Some(handler) = &handler {
                    handler(&symbol, ConnectionStatus::Connected);
                }
                for event in script {
                    match event {
                        ScriptedEvent::Candle(candle) => {
                            // Finality filtering happens here, at the
                            // provider edge, exactly like a real adapter.
                            if !candle.is_final {
                                continue;
                            }
                            if !sink.send_candle(candle).await {
                                break;
                            }
                        }
                        ScriptedEvent::Error(reason) => {
                            let err = MarketDataError::ConnectionFailed {
                                symbol: symbol.clone(),
                                reason,
                            };
                            if !sink.send_error(err).await {
                                break;
                            }
                        }
                        ScriptedEvent::Delay(duration) => {
                            tokio::select! {
                                _ = sink.cancelled() => break,
                                _ = tokio::time::sleep(duration) => {}
                            }
                        }
                    }
                }
                if let Some(handler) = &handler {
                    handler(&symbol, ConnectionStatus::Disconnected);
                }
            });
        }
        mux.into_stream()
    }
}

/// Simulated trading venue: fills market orders immediately, keeps limit
/// orders open, tracks naive net positions, and rejects orders whose
/// notional exceeds the quote balance.
pub struct MockTrading {
    quote_asset: String,
    balances: Mutex<HashMap<String, Decimal>>,
    orders: Mutex<Vec<ExecutedOrder>>,
    positions: Mutex<HashMap<String, Position>>,
    reject_reason: Mutex<Option<String>>,
    next_id: AtomicU64,
}

impl MockTrading {
    pub fn with_balance(asset: &str, amount: Decimal) -> Self {
        let mut balances = HashMap::new();
        balances.insert(asset.to_string(), amount);
        Self {
            quote_asset: asset.to_string(),
            balances: Mutex::new(balances),
            orders: Mutex::new(Vec::new()),
            positions: Mutex::new(HashMap::new()),
            reject_reason: Mutex::new(None),
            next_id: AtomicU64::new(1),
        }
    }

    /// Make every subsequent order fail with `Rejected`.
    pub fn reject_with(&self, reason: &str) {
        *self.reject_reason.lock().expect("reject mutex poisoned") = Some(reason.to_string());
    }

    pub fn orders(&self) -> Vec<ExecutedOrder> {
        self.orders.lock().expect("orders mutex poisoned").clone()
    }
}

#[async_trait]
impl TradingProvider for MockTrading {
    async fn place_order(&self, order: &OrderRequest) -> Result<ExecutedOrder, OrderError> {
        order.validate()?;

        if let Some(reason) = self.reject_reason.lock().expect("reject mutex poisoned").clone() {
            return Err(OrderError::Rejected { reason });
        }

        // Balance check only applies when the notional is known.
        if order.side == OrderSide::Buy
            && let Some(price) = order.price
        {
            let need = price * order.quantity;
            let balances = self.balances.lock().expect("balances mutex poisoned");
            let available = balances
                .get(&self.quote_asset)
                .copied()
                .unwrap_or(Decimal::ZERO);
            if need > available {
                return Err(OrderError::InsufficientBalance {
                    reason: format!("need {need} {}, available {available}", self.quote_asset),
                });
            }
        }

        let id = self.next_id.fetch_add(1, Ordering::Relaxed);
        let status = match order.order_type {
            OrderType::Market => OrderStatus::Filled,
            OrderType::Limit => OrderStatus::New,
        };
        let executed = ExecutedOrder::from_request(format!("mock-{id}"), order, status);

        if status == OrderStatus::Filled {
            let mut positions = self.positions.lock().expect("positions mutex poisoned");
            let entry = positions
                .entry(order.symbol.clone())
                .or_insert_with(|| Position {
                    symbol: order.symbol.clone(),
                    quantity: Decimal::ZERO,
                    average_price: order.price.unwrap_or(Decimal::ZERO),
                    position_type: PositionType::Long,
                });
            match order.side {
                OrderSide::Buy => entry.quantity += order.quantity,
                OrderSide::Sell => entry.quantity -= order.quantity,
            }
        }

        debug!(
            "MockTrading: {} {} {} x {} -> {}",
            executed.side, executed.order_type, executed.symbol, executed.quantity, executed.status
        );
        self.orders
            .lock()
            .expect("orders mutex poisoned")
            .push(executed.clone());
        Ok(executed)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), OrderError> {
        let mut orders = self.orders.lock().expect("orders mutex poisoned");
        match orders
            .iter_mut()
            .find(|o| o.id == order_id && o.symbol == symbol)
        {
            Some(order) if order.status == OrderStatus::New => {
                order.status = OrderStatus::Canceled;
                Ok(())
            }
            Some(order) => Err(OrderError::Rejected {
                reason: format!("order {} is {}, not cancellable", order.id, order.status),
            }),
            None => Err(OrderError::Rejected {
                reason: format!("unknown order {order_id} for {symbol}"),
            }),
        }
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExecutedOrder>, OrderError> {
        Ok(self
            .orders
            .lock()
            .expect("orders mutex poisoned")
            .iter()
            .filter(|o| o.status == OrderStatus::New)
            .filter(|o| symbol.is_none_or(|s| o.symbol == s))
            .cloned()
            .collect())
    }

    async fn get_positions(&self) -> Result<Vec<Position>, OrderError> {
        Ok(self
            .positions
            .lock()
            .expect("positions mutex poisoned")
            .values()
            .filter(|p| p.quantity != Decimal::ZERO)
            .cloned()
            .collect())
    }

    async fn get_account(&self) -> Result<Account, OrderError> {
        let balances = self
            .balances
            .lock()
            .expect("balances mutex poisoned")
            .iter()
            .map(|(asset, free)| Balance {
                asset: asset.clone(),
                free: *free,
                locked: Decimal::ZERO,
            })
            .collect();
        Ok(Account { balances })
    }
}

/// Records every engine callback; optionally cancels a token after N
/// candles to exercise the graceful-shutdown path.
#[derive(Default)]
pub struct CallbackRecorder {
    starts: Mutex<Vec<(Vec<String>, Interval)>>,
    stops: Mutex<Vec<Option<String>>>,
    candles: Mutex<Vec<Candle>>,
    errors: Mutex<Vec<String>>,
    strategy_errors: Mutex<Vec<(Candle, String)>>,
    placed: Mutex<Vec<ExecutedOrder>>,
    filled: Mutex<Vec<ExecutedOrder>>,
    cancel_after: Option<(usize, CancellationToken)>,
}

impl CallbackRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cancelling_after(candles: usize, token: CancellationToken) -> Self {
        Self {
            cancel_after: Some((candles, token)),
            ..Self::default()
        }
    }

    pub fn start_count(&self) -> usize {
        self.starts.lock().expect("mutex poisoned").len()
    }

    pub fn stop_count(&self) -> usize {
        self.stops.lock().expect("mutex poisoned").len()
    }

    pub fn stop_errors(&self) -> Vec<Option<String>> {
        self.stops.lock().expect("mutex poisoned").clone()
    }

    pub fn candles(&self) -> Vec<Candle> {
        self.candles.lock().expect("mutex poisoned").clone()
    }

    pub fn errors(&self) -> Vec<String> {
        self.errors.lock().expect("mutex poisoned").clone()
    }

    pub fn strategy_errors(&self) -> Vec<(Candle, String)> {
        self.strategy_errors.lock().expect("mutex poisoned").clone()
    }

    pub fn placed_orders(&self) -> Vec<ExecutedOrder> {
        self.placed.lock().expect("mutex poisoned").clone()
    }

    pub fn filled_orders(&self) -> Vec<ExecutedOrder> {
        self.filled.lock().expect("mutex poisoned").clone()
    }
}

impl EngineCallbacks for CallbackRecorder {
    fn on_engine_start(&self, symbols: &[String], interval: Interval) {
        self.starts
            .lock()
            .expect("mutex poisoned")
            .push((symbols.to_vec(), interval));
    }

    fn on_engine_stop(&self, final_err: Option<&EngineError>) {
        self.stops
            .lock()
            .expect("mutex poisoned")
            .push(final_err.map(|e| e.to_string()));
    }

    fn on_market_data(&self, candle: &Candle) {
        let count = {
            let mut candles = self.candles.lock().expect("mutex poisoned");
            candles.push(candle.clone());
            candles.len()
        };
        if let Some((threshold, token)) = &self.cancel_after
            && count >= *threshold
        {
            token.cancel();
        }
    }

    fn on_order_placed(&self, order: &ExecutedOrder) {
        self.placed.lock().expect("mutex poisoned").push(order.clone());
    }

    fn on_order_filled(&self, order: &ExecutedOrder) {
        self.filled.lock().expect("mutex poisoned").push(order.clone());
    }

    fn on_error(&self, err: &EngineError) {
        self.errors.lock().expect("mutex poisoned").push(err.to_string());
    }

    fn on_strategy_error(&self, candle: &Candle, err: &StrategyError) {
        self.strategy_errors
            .lock()
            .expect("mutex poisoned")
            .push((candle.clone(), err.to_string()));
    }
}

/// Generate a random-walk series of finalized candles, one per interval
/// starting at `start`.
pub fn candle_series(
    symbol: &str,
    start: DateTime<Utc>,
    interval: Interval,
    count: usize,
) -> Vec<Candle> {
    let mut rng = rand::rng();
    let mut price = 100.0_f64;
    let mut series = Vec::with_capacity(count);

    for i in 0..count {
        let open = price;
        price *= 1.0 + rng.random_range(-0.005..0.005);
        let close = price;
        series.push(Candle {
            symbol: symbol.to_string(),
            start_time: start + interval.duration() * i as i32,
            open,
            high: open.max(close) * 1.001,
            low: open.min(close) * 0.999,
            close,
            volume: rng.random_range(1.0..100.0),
            is_final: true,
        });
    }
    series
}
