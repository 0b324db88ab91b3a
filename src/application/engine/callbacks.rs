use crate::domain::errors::{EngineError, StrategyError};
use crate::domain::market::{Candle, Interval};
use crate::domain::trading::ExecutedOrder;

/// Lifecycle observer handed to [`LiveEngine::run`]. Every hook is optional;
/// the default implementations do nothing.
///
/// Guarantees: `on_engine_start` strictly precedes any `on_market_data`;
/// `on_engine_stop` strictly follows every other callback and fires exactly
/// once per `run`, on every exit path.
///
/// [`LiveEngine::run`]: crate::application::engine::LiveEngine::run
#[allow(unused_variables)]
pub trait EngineCallbacks: Send + Sync {
    fn on_engine_start(&self, symbols: &[String], interval: Interval) {}

    fn on_engine_stop(&self, final_err: Option<&EngineError>) {}

    /// Fired per candle, after persistence and strategy delivery.
    fn on_market_data(&self, candle: &Candle) {}

    fn on_order_placed(&self, order: &ExecutedOrder) {}

    fn on_order_filled(&self, order: &ExecutedOrder) {}

    /// Non-fatal runtime errors (stream errors, persistence failures).
    fn on_error(&self, err: &EngineError) {}

    /// Per-candle strategy failures; the run continues with the next candle.
    fn on_strategy_error(&self, candle: &Candle, err: &StrategyError) {}
}

/// No-op observer for embedders that only want the return value of `run`.
pub struct NoopCallbacks;

impl EngineCallbacks for NoopCallbacks {}
