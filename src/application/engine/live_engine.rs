//! The live engine: wires provider, writer, prefetch and strategy host into
//! one run loop and enforces the lifecycle state machine.

use std::path::Path;
use std::sync::Arc;
use tokio::sync::watch;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::application::engine::callbacks::EngineCallbacks;
use crate::application::prefetch::PrefetchController;
use crate::application::strategy_host::{OrderEvent, StrategyHost};
use crate::config::EngineConfig;
use crate::domain::errors::{EngineError, MarketDataError, StrategyError};
use crate::domain::market::EngineStatus;
use crate::domain::ports::{
    CandleSink, MarketDataProvider, Strategy, StrategyLoader, TradingProvider,
};
use crate::infrastructure::persistence::StreamWriter;

/// Orchestrator for one live trading run.
///
/// Construction order: `initialize(config)`, load exactly one strategy, set
/// both providers, then `run`. The engine exclusively owns the writer, the
/// prefetch controller and the strategy host; all of them are created inside
/// `run` and torn down before it returns.
pub struct LiveEngine {
    config: Option<EngineConfig>,
    strategy: Option<Box<dyn Strategy>>,
    strategy_config: Option<String>,
    strategy_loader: Option<Box<dyn StrategyLoader>>,
    market_data: Option<Arc<dyn MarketDataProvider>>,
    trading: Option<Arc<dyn TradingProvider>>,
    status_tx: watch::Sender<EngineStatus>,
}

impl LiveEngine {
    pub fn new() -> Self {
        let (status_tx, _) = watch::channel(EngineStatus::Idle);
        Self {
            config: None,
            strategy: None,
            strategy_config: None,
            strategy_loader: None,
            market_data: None,
            trading: None,
            status_tx,
        }
    }

    /// Validate and store the engine configuration. Calling this twice is an
    /// error.
    pub fn initialize(&mut self, config: EngineConfig) -> Result<(), EngineError> {
        if self.config.is_some() {
            return Err(EngineError::AlreadyInitialized);
        }
        config.validate()?;
        self.set_status(EngineStatus::Initializing);
        self.config = Some(config);
        Ok(())
    }

    /// Install a ready strategy instance (e.g. a native implementation or a
    /// handle produced by an external sandbox runtime).
    pub fn load_strategy_from_runtime(
        &mut self,
        strategy: Box<dyn Strategy>,
    ) -> Result<(), EngineError> {
        if self.strategy.is_some() {
            return Err(EngineError::StrategyAlreadyLoaded);
        }
        info!("LiveEngine: loaded strategy '{}'", strategy.name());
        self.strategy = Some(strategy);
        Ok(())
    }

    /// Load a strategy artifact through the configured [`StrategyLoader`].
    pub fn load_strategy_from_bytes(&mut self, artifact: &[u8]) -> Result<(), EngineError> {
        if self.strategy.is_some() {
            return Err(EngineError::StrategyAlreadyLoaded);
        }
        let loader = self.strategy_loader.as_ref().ok_or_else(|| {
            EngineError::Validation("no strategy loader configured".to_string())
        })?;
        let strategy = loader.load(artifact)?;
        info!("LiveEngine: loaded strategy '{}' from artifact", strategy.name());
        self.strategy = Some(strategy);
        Ok(())
    }

    pub fn load_strategy_from_file(&mut self, path: &Path) -> Result<(), EngineError> {
        let artifact = std::fs::read(path).map_err(|e| {
            EngineError::Strategy(StrategyError::Load(format!(
                "cannot read {}: {e}",
                path.display()
            )))
        })?;
        self.load_strategy_from_bytes(&artifact)
    }

    pub fn set_strategy_loader(&mut self, loader: Box<dyn StrategyLoader>) {
        self.strategy_loader = Some(loader);
    }

    /// Opaque configuration string passed to the strategy's `initialize`.
    pub fn set_strategy_config(&mut self, config: impl Into<String>) {
        self.strategy_config = Some(config.into());
    }

    pub fn set_market_data_provider(&mut self, provider: Arc<dyn MarketDataProvider>) {
        self.market_data = Some(provider);
    }

    pub fn set_trading_provider(&mut self, provider: Arc<dyn TradingProvider>) {
        self.trading = Some(provider);
    }

    pub fn status(&self) -> EngineStatus {
        *self.status_tx.borrow()
    }

    /// Observe status transitions without borrowing the engine.
    pub fn status_watch(&self) -> watch::Receiver<EngineStatus> {
        self.status_tx.subscribe()
    }

    /// Run until the token is cancelled (returns `EngineError::Cancelled`)
    /// or the stream ends. `on_engine_stop` fires exactly once on every exit
    /// path, including pre-run validation failures.
    pub async fn run(
        &mut self,
        ctx: CancellationToken,
        callbacks: &dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        let result = self.run_inner(&ctx, callbacks).await;
        match &result {
            Ok(()) => info!("LiveEngine: run finished cleanly"),
            Err(EngineError::Cancelled) => info!("LiveEngine: run cancelled"),
            Err(e) => warn!("LiveEngine: run failed: {}", e),
        }
        callbacks.on_engine_stop(result.as_ref().err());
        result
    }

    async fn run_inner(
        &mut self,
        ctx: &CancellationToken,
        callbacks: &dyn EngineCallbacks,
    ) -> Result<(), EngineError> {
        // Pre-run validation. Nothing below fires before all of it passes,
        // so a misconfigured engine never emits on_engine_start.
        let config = self.config.clone().ok_or(EngineError::NotInitialized)?;
        if self.strategy.is_none() {
            return Err(EngineError::StrategyNotLoaded);
        }
        let market = self
            .market_data
            .clone()
            .ok_or(EngineError::ProviderNotSet("market data"))?;
        let trading = self
            .trading
            .clone()
            .ok_or(EngineError::ProviderNotSet("trading"))?;
        if !market.supports_interval(config.interval) {
            return Err(EngineError::MarketData(
                MarketDataError::UnsupportedInterval {
                    provider: market.provider_tag(),
                    interval: config.interval,
                },
            ));
        }
        market.validate_symbols(ctx, &config.symbols).await?;

        let strategy = self.strategy.take().ok_or(EngineError::StrategyNotLoaded)?;

        let writer = Arc::new(StreamWriter::new(
            &config.data_dir,
            market.provider_tag(),
            config.interval,
        ));
        writer.initialize()?;
        let sink: Arc<dyn CandleSink> = writer.clone();
        market.configure_writer(sink.clone());

        let (host, mut order_events) = StrategyHost::new(
            strategy,
            trading,
            config.market_data_cache_size,
            config.enable_logging,
            config.log_output_path.clone(),
        )?;

        // A strategy that fails to initialize is fatal, before any callback.
        let strategy_config = self.strategy_config.clone().unwrap_or_default();
        host.initialize(&strategy_config).await?;

        info!(
            "LiveEngine: starting run for {:?} at {}",
            config.symbols, config.interval
        );
        callbacks.on_engine_start(&config.symbols, config.interval);

        let prefetch = PrefetchController::new(
            config.prefetch.clone(),
            market.clone(),
            sink.clone(),
            config.interval,
        );

        let mut fatal: Option<EngineError> = None;

        if prefetch.enabled() {
            self.set_status(EngineStatus::Prefetching);
            if let Err(e) = prefetch.execute_prefetch(ctx, &config.symbols).await {
                fatal = Some(e);
            }
        }

        if fatal.is_none() {
            let mut stream = market.stream(ctx);
            if !prefetch.enabled() {
                self.set_status(EngineStatus::Running);
            }

            let mut first_candle = true;
            while let Some(item) = stream.next().await {
                match item {
                    Err(e) => {
                        // Stream errors are non-fatal; the provider decides
                        // whether the stream also ends.
                        callbacks.on_error(&EngineError::MarketData(e));
                    }
                    Ok(candle) => {
                        if first_candle {
                            first_candle = false;
                            if prefetch.enabled() {
                                self.set_status(EngineStatus::GapFilling);
                                prefetch
                                    .handle_stream_start(ctx, candle.start_time, &config.symbols)
                                    .await;
                                self.set_status(EngineStatus::Running);
                            }
                        }

                        // Persistence strictly precedes delivery. A failed
                        // write is surfaced but the candle is still handed to
                        // the strategy: losing a real-time decision is worse
                        // than a temporary storage hiccup.
                        if let Err(e) = writer.write(&candle) {
                            callbacks.on_error(&EngineError::Persistence(e));
                        }

                        if let Err(e) = host.process_data(&candle).await {
                            callbacks.on_strategy_error(&candle, &e);
                        }

                        while let Ok(event) = order_events.try_recv() {
                            match event {
                                OrderEvent::Placed(order) => callbacks.on_order_placed(&order),
                                OrderEvent::Filled(order) => callbacks.on_order_filled(&order),
                            }
                        }

                        callbacks.on_market_data(&candle);
                    }
                }
            }
            debug!("LiveEngine: candle stream ended");
        }

        if fatal.is_none() && ctx.is_cancelled() {
            fatal = Some(EngineError::Cancelled);
        }

        self.set_status(EngineStatus::Stopping);
        if let Err(e) = writer.close() {
            warn!("LiveEngine: failed to close writer: {}", e);
        }
        self.set_status(EngineStatus::Stopped);

        match fatal {
            Some(e) => Err(e),
            None => Ok(()),
        }
    }

    fn set_status(&self, next: EngineStatus) {
        let current = *self.status_tx.borrow();
        if current == next {
            return;
        }
        if !current.can_transition_to(next) {
            warn!(
                "LiveEngine: ignoring invalid status transition {} -> {}",
                current, next
            );
            return;
        }
        debug!("LiveEngine: status {} -> {}", current, next);
        let _ = self.status_tx.send(next);
    }
}

impl Default for LiveEngine {
    fn default() -> Self {
        Self::new()
    }
}
