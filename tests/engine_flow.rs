//! End-to-end engine runs against the mock provider and trading venue.

use chrono::{DateTime, TimeZone, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;

use candleflow::application::engine::LiveEngine;
use candleflow::application::strategies::SmaCrossStrategy;
use candleflow::config::EngineConfig;
use candleflow::domain::errors::{EngineError, StrategyError};
use candleflow::domain::market::{Candle, Interval};
use candleflow::domain::ports::{Strategy, StrategyApi};
use candleflow::infrastructure::mock::{
    CallbackRecorder, MockMarketData, MockTrading, candle_series,
};
use candleflow::infrastructure::persistence::query;
use rust_decimal_macros::dec;

fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_env_filter("info")
        .with_test_writer()
        .try_init();
}

fn test_config(symbols: Vec<&str>, data_dir: &std::path::Path) -> EngineConfig {
    let mut config = EngineConfig::new(symbols.into_iter().map(String::from).collect());
    config.data_dir = data_dir.to_path_buf();
    config
}

/// A strategy that does nothing, for runs that only exercise the pipeline.
struct PassiveStrategy;

#[async_trait::async_trait]
impl Strategy for PassiveStrategy {
    async fn initialize(
        &mut self,
        _config: &str,
        _api: Arc<dyn StrategyApi>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn name(&self) -> String {
        "passive".to_string()
    }

    fn description(&self) -> String {
        "accepts every candle".to_string()
    }

    fn identifier(&self) -> String {
        "passive-v1".to_string()
    }

    async fn process_data(&mut self, _candle: &Candle) -> Result<(), StrategyError> {
        Ok(())
    }
}

fn build_engine(
    config: EngineConfig,
    provider: Arc<MockMarketData>,
    trading: Arc<MockTrading>,
    strategy: Box<dyn Strategy>,
) -> LiveEngine {
    let mut engine = LiveEngine::new();
    engine.initialize(config).unwrap();
    engine.load_strategy_from_runtime(strategy).unwrap();
    engine.set_market_data_provider(provider);
    engine.set_trading_provider(trading);
    engine
}

#[tokio::test]
async fn test_single_symbol_fifty_candles() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let candles = candle_series("BTCUSDT", start, Interval::OneMinute, 50);

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute)
            .with_candles("BTCUSDT", candles.clone()),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(result.is_ok());

    assert_eq!(recorder.start_count(), 1);
    assert_eq!(recorder.stop_count(), 1);
    assert_eq!(recorder.candles().len(), 50);
    assert!(recorder.errors().is_empty());

    let path = dir.path().join("stream_data_mock_1m.parquet");
    assert_eq!(query::count_rows(&path).await.unwrap(), 50);

    let (min, max) = query::time_bounds(&path).await.unwrap().unwrap();
    assert_eq!(min, candles.first().unwrap().start_time);
    assert_eq!(max, candles.last().unwrap().start_time);
}

#[tokio::test]
async fn test_restart_preserves_data() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let first_start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let second_start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 25, 0).unwrap();

    for start in [first_start, second_start] {
        let candles = candle_series("BTCUSDT", start, Interval::OneMinute, 25);
        let provider = Arc::new(
            MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute)
                .with_candles("BTCUSDT", candles),
        );
        let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
        let mut engine = build_engine(
            test_config(vec!["BTCUSDT"], dir.path()),
            provider,
            trading,
            Box::new(PassiveStrategy),
        );
        let recorder = CallbackRecorder::new();
        engine.run(CancellationToken::new(), &recorder).await.unwrap();
        assert_eq!(recorder.candles().len(), 25);
    }

    let path = dir.path().join("stream_data_mock_1m.parquet");
    assert_eq!(query::count_rows(&path).await.unwrap(), 50);

    let (min, max) = query::time_bounds(&path).await.unwrap().unwrap();
    assert_eq!(min, first_start);
    assert_eq!(max, Utc.with_ymd_and_hms(2024, 1, 1, 10, 49, 0).unwrap());
}

#[tokio::test]
async fn test_multi_symbol_delivery() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    let provider = Arc::new(
        MockMarketData::new(
            vec!["BTCUSDT".to_string(), "ETHUSDT".to_string()],
            Interval::OneMinute,
        )
        .with_candles(
            "BTCUSDT",
            candle_series("BTCUSDT", start, Interval::OneMinute, 25),
        )
        .with_candles(
            "ETHUSDT",
            candle_series("ETHUSDT", start, Interval::OneMinute, 25),
        ),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT", "ETHUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let recorder = CallbackRecorder::new();
    engine.run(CancellationToken::new(), &recorder).await.unwrap();

    let candles = recorder.candles();
    assert_eq!(candles.len(), 50);
    for symbol in ["BTCUSDT", "ETHUSDT"] {
        assert_eq!(candles.iter().filter(|c| c.symbol == symbol).count(), 25);
    }

    // Within one symbol, delivery order follows provider order.
    for symbol in ["BTCUSDT", "ETHUSDT"] {
        let times: Vec<DateTime<Utc>> = candles
            .iter()
            .filter(|c| c.symbol == symbol)
            .map(|c| c.start_time)
            .collect();
        let mut sorted = times.clone();
        sorted.sort();
        assert_eq!(times, sorted);
    }

    let path = dir.path().join("stream_data_mock_1m.parquet");
    assert_eq!(query::count_rows(&path).await.unwrap(), 50);
    assert_eq!(
        query::count_rows_for_symbol(&path, "BTCUSDT").await.unwrap(),
        25
    );
    assert_eq!(
        query::count_rows_for_symbol(&path, "ETHUSDT").await.unwrap(),
        25
    );
}

#[tokio::test]
async fn test_mid_stream_error_is_non_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    let mut events: Vec<candleflow::infrastructure::mock::ScriptedEvent> =
        candle_series("BTCUSDT", start, Interval::OneMinute, 50)
            .into_iter()
            .map(candleflow::infrastructure::mock::ScriptedEvent::Candle)
            .collect();
    events.push(candleflow::infrastructure::mock::ScriptedEvent::Error(
        "connection lost".to_string(),
    ));

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute)
            .with_script("BTCUSDT", events),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;

    // The stream ended cleanly after the error frame: not a fatal run.
    assert!(result.is_ok());
    assert_eq!(recorder.candles().len(), 50);

    let errors = recorder.errors();
    assert_eq!(errors.len(), 1);
    assert!(errors[0].contains("connection lost"));
    assert_eq!(recorder.stop_count(), 1);
}

#[tokio::test]
async fn test_graceful_cancel_mid_stream() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute).with_candles(
            "BTCUSDT",
            candle_series("BTCUSDT", start, Interval::OneMinute, 1000),
        ),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let token = CancellationToken::new();
    let recorder = CallbackRecorder::cancelling_after(100, token.clone());
    let result = engine.run(token, &recorder).await;

    assert!(matches!(result, Err(EngineError::Cancelled)));
    assert_eq!(recorder.stop_count(), 1);
    assert_eq!(recorder.stop_errors()[0].as_deref(), Some("run cancelled"));

    let delivered = recorder.candles().len();
    assert_eq!(delivered, 100);

    let rows = query::count_rows(&dir.path().join("stream_data_mock_1m.parquet"))
        .await
        .unwrap();
    assert!(rows > 0);
    assert!(rows <= 100);
}

#[tokio::test]
async fn test_pre_run_validation_order() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    // Not initialized.
    let mut engine = LiveEngine::new();
    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(matches!(result, Err(EngineError::NotInitialized)));
    assert_eq!(recorder.start_count(), 0);
    assert_eq!(recorder.stop_count(), 1);

    // Initialized but no strategy.
    let mut engine = LiveEngine::new();
    engine
        .initialize(test_config(vec!["BTCUSDT"], dir.path()))
        .unwrap();
    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(matches!(result, Err(EngineError::StrategyNotLoaded)));
    assert_eq!(recorder.start_count(), 0);

    // Strategy loaded but no providers.
    let mut engine = LiveEngine::new();
    engine
        .initialize(test_config(vec!["BTCUSDT"], dir.path()))
        .unwrap();
    engine
        .load_strategy_from_runtime(Box::new(PassiveStrategy))
        .unwrap();
    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(matches!(result, Err(EngineError::ProviderNotSet(_))));
    assert_eq!(recorder.start_count(), 0);
    assert_eq!(recorder.stop_count(), 1);
}

#[tokio::test]
async fn test_double_initialize_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let mut engine = LiveEngine::new();
    engine
        .initialize(test_config(vec!["BTCUSDT"], dir.path()))
        .unwrap();
    let result = engine.initialize(test_config(vec!["BTCUSDT"], dir.path()));
    assert!(matches!(result, Err(EngineError::AlreadyInitialized)));
}

#[tokio::test]
async fn test_empty_stream_fires_lifecycle_only() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let provider = Arc::new(MockMarketData::new(
        vec!["BTCUSDT".to_string()],
        Interval::OneMinute,
    ));
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let recorder = CallbackRecorder::new();
    engine.run(CancellationToken::new(), &recorder).await.unwrap();

    assert_eq!(recorder.start_count(), 1);
    assert_eq!(recorder.stop_count(), 1);
    assert!(recorder.candles().is_empty());
    assert!(recorder.errors().is_empty());
    assert!(recorder.placed_orders().is_empty());
}

/// Fails on one specific candle, to prove per-candle strategy errors do not
/// end the run.
struct FlakyStrategy {
    fail_at: DateTime<Utc>,
}

#[async_trait::async_trait]
impl Strategy for FlakyStrategy {
    async fn initialize(
        &mut self,
        _config: &str,
        _api: Arc<dyn StrategyApi>,
    ) -> Result<(), StrategyError> {
        Ok(())
    }

    fn name(&self) -> String {
        "flaky".to_string()
    }

    fn description(&self) -> String {
        "fails on one candle".to_string()
    }

    fn identifier(&self) -> String {
        "flaky-v1".to_string()
    }

    async fn process_data(&mut self, candle: &Candle) -> Result<(), StrategyError> {
        if candle.start_time == self.fail_at {
            return Err(StrategyError::Process("indicator divide by zero".to_string()));
        }
        Ok(())
    }
}

#[tokio::test]
async fn test_strategy_error_is_surfaced_and_run_continues() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();
    let candles = candle_series("BTCUSDT", start, Interval::OneMinute, 10);
    let fail_at = candles[4].start_time;

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute)
            .with_candles("BTCUSDT", candles),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(FlakyStrategy { fail_at }),
    );

    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(result.is_ok());

    // All candles were still delivered to callbacks and persisted.
    assert_eq!(recorder.candles().len(), 10);
    let strategy_errors = recorder.strategy_errors();
    assert_eq!(strategy_errors.len(), 1);
    assert_eq!(strategy_errors[0].0.start_time, fail_at);
}

/// Fails in `initialize`, which must abort the run before `on_engine_start`.
struct BrokenStrategy;

#[async_trait::async_trait]
impl Strategy for BrokenStrategy {
    async fn initialize(
        &mut self,
        _config: &str,
        _api: Arc<dyn StrategyApi>,
    ) -> Result<(), StrategyError> {
        Err(StrategyError::Initialize("missing parameter".to_string()))
    }

    fn name(&self) -> String {
        "broken".to_string()
    }

    fn description(&self) -> String {
        "never initializes".to_string()
    }

    fn identifier(&self) -> String {
        "broken-v1".to_string()
    }

    async fn process_data(&mut self, _candle: &Candle) -> Result<(), StrategyError> {
        Ok(())
    }
}

#[tokio::test]
async fn test_strategy_initialize_failure_is_fatal() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();

    let provider = Arc::new(MockMarketData::new(
        vec!["BTCUSDT".to_string()],
        Interval::OneMinute,
    ));
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(BrokenStrategy),
    );

    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(matches!(result, Err(EngineError::Strategy(_))));
    assert_eq!(recorder.start_count(), 0);
    assert_eq!(recorder.stop_count(), 1);
}

#[tokio::test]
async fn test_persistence_failure_still_delivers_to_strategy() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    // Block the writer's temp file with a directory of the same name: every
    // export fails, but candles must still reach the strategy and callbacks.
    std::fs::create_dir_all(dir.path().join("stream_data_mock_1m.parquet.tmp")).unwrap();

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute).with_candles(
            "BTCUSDT",
            candle_series("BTCUSDT", start, Interval::OneMinute, 5),
        ),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading,
        Box::new(PassiveStrategy),
    );

    let recorder = CallbackRecorder::new();
    let result = engine.run(CancellationToken::new(), &recorder).await;
    assert!(result.is_ok());

    assert_eq!(recorder.candles().len(), 5);
    let errors = recorder.errors();
    assert_eq!(errors.len(), 5);
    assert!(errors.iter().all(|e| e.contains("persistence failed")));
}

#[tokio::test]
async fn test_sma_strategy_places_orders_through_engine() {
    init_tracing();
    let dir = tempfile::tempdir().unwrap();
    let start = Utc.with_ymd_and_hms(2024, 1, 1, 10, 0, 0).unwrap();

    // Downtrend, then a strong reversal: one buy cross.
    let closes = [100.0, 95.0, 90.0, 85.0, 80.0, 120.0, 140.0, 160.0];
    let candles: Vec<Candle> = closes
        .iter()
        .enumerate()
        .map(|(i, close)| Candle {
            symbol: "BTCUSDT".to_string(),
            start_time: start + chrono::Duration::minutes(i as i64),
            open: *close,
            high: close + 1.0,
            low: close - 1.0,
            close: *close,
            volume: 1.0,
            is_final: true,
        })
        .collect();

    let provider = Arc::new(
        MockMarketData::new(vec!["BTCUSDT".to_string()], Interval::OneMinute)
            .with_candles("BTCUSDT", candles),
    );
    let trading = Arc::new(MockTrading::with_balance("USDT", dec!(100000)));
    let mut engine = build_engine(
        test_config(vec!["BTCUSDT"], dir.path()),
        provider,
        trading.clone(),
        Box::new(SmaCrossStrategy::new()),
    );
    engine.set_strategy_config(r#"{"fast_period": 2, "slow_period": 4}"#);

    let recorder = CallbackRecorder::new();
    engine.run(CancellationToken::new(), &recorder).await.unwrap();

    let placed = recorder.placed_orders();
    assert_eq!(placed.len(), 1);
    assert_eq!(placed[0].symbol, "BTCUSDT");
    // Market orders fill immediately in the mock venue.
    assert_eq!(recorder.filled_orders().len(), 1);
    assert_eq!(trading.orders().len(), 1);
}
