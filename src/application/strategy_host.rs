//! Strategy host: owns the sandboxed strategy, delivers candles to it, and
//! implements the capability object the strategy calls back into.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, VecDeque};
use std::fs::OpenOptions;
use std::io::Write;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};

use crate::domain::errors::{OrderError, StrategyError};
use crate::domain::market::Candle;
use crate::domain::ports::{LogLevel, Strategy, StrategyApi, TradingProvider};
use crate::domain::trading::{Account, ExecutedOrder, OrderRequest, OrderStatus, Position};

/// Order lifecycle notifications, drained by the engine after each candle is
/// processed and fanned out to the embedder callbacks.
#[derive(Debug, Clone)]
pub enum OrderEvent {
    Placed(ExecutedOrder),
    Filled(ExecutedOrder),
}

/// One structured log line raised by the strategy through the host API.
#[derive(Debug, Clone, Serialize)]
pub struct StrategyLogEntry {
    pub timestamp: DateTime<Utc>,
    pub level: LogLevel,
    pub strategy: String,
    pub message: String,
    pub fields: serde_json::Value,
}

/// Process-scoped key/value store with FIFO eviction. Cleared on engine
/// restart by construction (it lives and dies with the host).
struct BoundedCache {
    map: HashMap<String, serde_json::Value>,
    insertion_order: VecDeque<String>,
    capacity: usize,
}

impl BoundedCache {
    fn new(capacity: usize) -> Self {
        Self {
            map: HashMap::new(),
            insertion_order: VecDeque::new(),
            capacity,
        }
    }

    fn get(&self, key: &str) -> Option<serde_json::Value> {
        self.map.get(key).cloned()
    }

    fn set(&mut self, key: String, value: serde_json::Value) {
        if self.capacity == 0 {
            return;
        }
        if !self.map.contains_key(&key) {
            if self.map.len() >= self.capacity
                && let Some(evicted) = self.insertion_order.pop_front()
            {
                self.map.remove(&evicted);
            }
            self.insertion_order.push_back(key.clone());
        }
        self.map.insert(key, value);
    }
}

struct LogSink {
    buffer: Mutex<Vec<StrategyLogEntry>>,
    file: Option<Mutex<std::fs::File>>,
}

/// The capability object handed to the strategy at load time. The strategy
/// has no other path back into the engine.
pub struct HostApi {
    strategy_name: String,
    cache: Mutex<BoundedCache>,
    trading: Arc<dyn TradingProvider>,
    order_events: mpsc::UnboundedSender<OrderEvent>,
    log_sink: Option<LogSink>,
}

#[async_trait]
impl StrategyApi for HostApi {
    fn get_cache(&self, key: &str) -> Option<serde_json::Value> {
        self.cache.lock().expect("cache mutex poisoned").get(key)
    }

    fn set_cache(&self, key: &str, value: serde_json::Value) {
        self.cache
            .lock()
            .expect("cache mutex poisoned")
            .set(key.to_string(), value);
    }

    async fn place_order(&self, order: OrderRequest) -> Result<ExecutedOrder, OrderError> {
        order.validate()?;

        let executed = self.trading.place_order(&order).await?;
        debug!(
            "HostApi: order {} {} {} x {} accepted as {}",
            executed.side, executed.symbol, executed.quantity, executed.order_type, executed.id
        );

        // The engine drains these after process_data returns; a dropped
        // receiver just means nobody is listening any more.
        let _ = self.order_events.send(OrderEvent::Placed(executed.clone()));
        if executed.status == OrderStatus::Filled {
            let _ = self.order_events.send(OrderEvent::Filled(executed.clone()));
        }
        Ok(executed)
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), OrderError> {
        self.trading.cancel_order(symbol, order_id).await
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExecutedOrder>, OrderError> {
        self.trading.get_open_orders(symbol).await
    }

    fn log(&self, level: LogLevel, message: &str, fields: serde_json::Value) {
        match level {
            LogLevel::Debug => debug!(strategy = %self.strategy_name, %fields, "{}", message),
            LogLevel::Info => info!(strategy = %self.strategy_name, %fields, "{}", message),
            LogLevel::Warn => warn!(strategy = %self.strategy_name, %fields, "{}", message),
            LogLevel::Error => error!(strategy = %self.strategy_name, %fields, "{}", message),
        }

        let Some(sink) = &self.log_sink else {
            return;
        };
        let entry = StrategyLogEntry {
            timestamp: Utc::now(),
            level,
            strategy: self.strategy_name.clone(),
            message: message.to_string(),
            fields,
        };
        if let Some(file) = &sink.file
            && let Ok(line) = serde_json::to_string(&entry)
        {
            let mut file = file.lock().expect("log file mutex poisoned");
            if let Err(e) = writeln!(file, "{}", line) {
                warn!("HostApi: failed to append strategy log: {}", e);
            }
        }
        sink.buffer
            .lock()
            .expect("log buffer mutex poisoned")
            .push(entry);
    }

    async fn get_positions(&self) -> Result<Vec<Position>, OrderError> {
        self.trading.get_positions().await
    }

    async fn get_account(&self) -> Result<Account, OrderError> {
        self.trading.get_account().await
    }
}

/// Owns the strategy for the duration of one engine run. Candle delivery is
/// serialized through the internal mutex, matching the single-threaded
/// delivery contract of the sandbox.
pub struct StrategyHost {
    strategy: tokio::sync::Mutex<Box<dyn Strategy>>,
    api: Arc<HostApi>,
}

impl StrategyHost {
    pub fn new(
        strategy: Box<dyn Strategy>,
        trading: Arc<dyn TradingProvider>,
        cache_capacity: usize,
        enable_logging: bool,
        log_output_path: Option<PathBuf>,
    ) -> Result<(Self, mpsc::UnboundedReceiver<OrderEvent>), StrategyError> {
        let (order_tx, order_rx) = mpsc::unbounded_channel();

        let log_sink = if enable_logging {
            let file = match log_output_path {
                Some(path) => {
                    let file = OpenOptions::new()
                        .create(true)
                        .append(true)
                        .open(&path)
                        .map_err(|e| {
                            StrategyError::Load(format!(
                                "cannot open log output {}: {e}",
                                path.display()
                            ))
                        })?;
                    Some(Mutex::new(file))
                }
                None => None,
            };
            Some(LogSink {
                buffer: Mutex::new(Vec::new()),
                file,
            })
        } else {
            None
        };

        let api = Arc::new(HostApi {
            strategy_name: strategy.name(),
            cache: Mutex::new(BoundedCache::new(cache_capacity)),
            trading,
            order_events: order_tx,
            log_sink,
        });

        let host = Self {
            strategy: tokio::sync::Mutex::new(strategy),
            api,
        };
        Ok((host, order_rx))
    }

    /// Initialize the strategy with its opaque configuration string. Errors
    /// here are fatal to the run.
    pub async fn initialize(&self, config: &str) -> Result<(), StrategyError> {
        let api: Arc<dyn StrategyApi> = self.api.clone();
        self.strategy.lock().await.initialize(config, api).await
    }

    pub async fn process_data(&self, candle: &Candle) -> Result<(), StrategyError> {
        self.strategy.lock().await.process_data(candle).await
    }

    pub async fn strategy_name(&self) -> String {
        self.strategy.lock().await.name()
    }

    /// Drain the buffered strategy log entries (empty when logging is off).
    pub fn take_logs(&self) -> Vec<StrategyLogEntry> {
        match &self.api.log_sink {
            Some(sink) => std::mem::take(&mut *sink.buffer.lock().expect("log buffer poisoned")),
            None => Vec::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::infrastructure::mock::MockTrading;
    use rust_decimal_macros::dec;

    struct CacheProbe;

    #[async_trait]
    impl Strategy for CacheProbe {
        async fn initialize(
            &mut self,
            _config: &str,
            api: Arc<dyn StrategyApi>,
        ) -> Result<(), StrategyError> {
            api.set_cache("greeting", serde_json::json!("hello"));
            Ok(())
        }

        fn name(&self) -> String {
            "cache-probe".to_string()
        }

        fn description(&self) -> String {
            "writes one cache key".to_string()
        }

        fn identifier(&self) -> String {
            "cache-probe-v1".to_string()
        }

        async fn process_data(&mut self, _candle: &Candle) -> Result<(), StrategyError> {
            Ok(())
        }
    }

    fn host_with(strategy: Box<dyn Strategy>) -> (StrategyHost, mpsc::UnboundedReceiver<OrderEvent>) {
        let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
        StrategyHost::new(strategy, trading, 16, true, None).unwrap()
    }

    #[tokio::test]
    async fn test_cache_roundtrip_through_api() {
        let (host, _orders) = host_with(Box::new(CacheProbe));
        host.initialize("{}").await.unwrap();
        assert_eq!(
            host.api.get_cache("greeting"),
            Some(serde_json::json!("hello"))
        );
        assert_eq!(host.api.get_cache("missing"), None);
    }

    #[test]
    fn test_cache_evicts_fifo_beyond_capacity() {
        let mut cache = BoundedCache::new(2);
        cache.set("a".to_string(), serde_json::json!(1));
        cache.set("b".to_string(), serde_json::json!(2));
        cache.set("c".to_string(), serde_json::json!(3));

        assert_eq!(cache.get("a"), None);
        assert_eq!(cache.get("b"), Some(serde_json::json!(2)));
        assert_eq!(cache.get("c"), Some(serde_json::json!(3)));
    }

    #[test]
    fn test_cache_capacity_zero_stores_nothing() {
        let mut cache = BoundedCache::new(0);
        cache.set("a".to_string(), serde_json::json!(1));
        assert_eq!(cache.get("a"), None);
    }

    #[test]
    fn test_cache_overwrite_does_not_evict() {
        let mut cache = BoundedCache::new(2);
        cache.set("a".to_string(), serde_json::json!(1));
        cache.set("b".to_string(), serde_json::json!(2));
        cache.set("a".to_string(), serde_json::json!(10));

        assert_eq!(cache.get("a"), Some(serde_json::json!(10)));
        assert_eq!(cache.get("b"), Some(serde_json::json!(2)));
    }

    #[tokio::test]
    async fn test_log_buffer_collects_entries() {
        let (host, _orders) = host_with(Box::new(CacheProbe));
        host.api.log(
            LogLevel::Info,
            "entered position",
            serde_json::json!({"symbol": "BTCUSDT"}),
        );

        let logs = host.take_logs();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].message, "entered position");
        assert_eq!(logs[0].strategy, "cache-probe");
        // Draining empties the buffer.
        assert!(host.take_logs().is_empty());
    }
}
