//! Dual-SMA crossover strategy.
//!
//! Reference implementation of the sandbox contract: it keeps its indicator
//! state in the host cache, logs through the host API and places market
//! orders on crossovers. Doubles as the fixture for the engine tests.

use async_trait::async_trait;
use rust_decimal::Decimal;
use serde::Deserialize;
use std::collections::VecDeque;
use std::sync::Arc;

use crate::domain::errors::StrategyError;
use crate::domain::market::Candle;
use crate::domain::ports::{LogLevel, Strategy, StrategyApi};
use crate::domain::trading::{OrderRequest, OrderSide, OrderType, PositionType};

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
struct SmaCrossConfig {
    fast_period: usize,
    slow_period: usize,
    quantity: Decimal,
}

impl Default for SmaCrossConfig {
    fn default() -> Self {
        Self {
            fast_period: 5,
            slow_period: 20,
            quantity: Decimal::ONE,
        }
    }
}

pub struct SmaCrossStrategy {
    config: SmaCrossConfig,
    api: Option<Arc<dyn StrategyApi>>,
    closes: VecDeque<f64>,
    /// Previous tick's fast-above-slow state, `None` until both SMAs exist.
    was_fast_above: Option<bool>,
    long: bool,
}

impl SmaCrossStrategy {
    pub fn new() -> Self {
        Self {
            config: SmaCrossConfig::default(),
            api: None,
            closes: VecDeque::new(),
            was_fast_above: None,
            long: false,
        }
    }

    fn sma(&self, period: usize) -> Option<f64> {
        if self.closes.len() < period {
            return None;
        }
        let sum: f64 = self.closes.iter().rev().take(period).sum();
        Some(sum / period as f64)
    }

    fn order(&self, candle: &Candle, side: OrderSide, reason: &str) -> OrderRequest {
        OrderRequest {
            symbol: candle.symbol.clone(),
            side,
            order_type: OrderType::Market,
            quantity: self.config.quantity,
            price: None,
            reason: reason.to_string(),
            strategy_name: self.name(),
            take_profit: None,
            stop_loss: None,
            position_type: PositionType::Long,
        }
    }
}

impl Default for SmaCrossStrategy {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Strategy for SmaCrossStrategy {
    async fn initialize(
        &mut self,
        config: &str,
        api: Arc<dyn StrategyApi>,
    ) -> Result<(), StrategyError> {
        if !config.trim().is_empty() {
            self.config = serde_json::from_str(config)
                .map_err(|e| StrategyError::Initialize(format!("bad config: {e}")))?;
        }
        if self.config.fast_period == 0 || self.config.fast_period >= self.config.slow_period {
            return Err(StrategyError::Initialize(format!(
                "fast period ({}) must be positive and below slow period ({})",
                self.config.fast_period, self.config.slow_period
            )));
        }

        api.log(
            LogLevel::Info,
            "sma-cross initialized",
            serde_json::json!({
                "fast": self.config.fast_period,
                "slow": self.config.slow_period,
            }),
        );
        self.api = Some(api);
        Ok(())
    }

    fn name(&self) -> String {
        "sma-cross".to_string()
    }

    fn description(&self) -> String {
        "Buys when the fast SMA crosses above the slow SMA, sells on the reverse cross".to_string()
    }

    fn identifier(&self) -> String {
        format!(
            "sma-cross-{}-{}",
            self.config.fast_period, self.config.slow_period
        )
    }

    fn config_schema(&self) -> String {
        serde_json::json!({
            "type": "object",
            "properties": {
                "fast_period": {"type": "integer", "minimum": 1},
                "slow_period": {"type": "integer", "minimum": 2},
                "quantity": {"type": "string"}
            }
        })
        .to_string()
    }

    async fn process_data(&mut self, candle: &Candle) -> Result<(), StrategyError> {
        let api = self
            .api
            .clone()
            .ok_or_else(|| StrategyError::Process("strategy not initialized".to_string()))?;

        self.closes.push_back(candle.close);
        if self.closes.len() > self.config.slow_period {
            self.closes.pop_front();
        }

        let (Some(fast), Some(slow)) = (
            self.sma(self.config.fast_period),
            self.sma(self.config.slow_period),
        ) else {
            return Ok(());
        };

        api.set_cache(
            &format!("sma:{}", candle.symbol),
            serde_json::json!({"fast": fast, "slow": slow}),
        );

        let fast_above = fast > slow;
        let crossed = self
            .was_fast_above
            .is_some_and(|previous| previous != fast_above);
        self.was_fast_above = Some(fast_above);
        if !crossed {
            return Ok(());
        }

        let (side, reason) = if fast_above {
            (OrderSide::Buy, "fast SMA crossed above slow SMA")
        } else {
            (OrderSide::Sell, "fast SMA crossed below slow SMA")
        };

        // Only trade when the cross changes our exposure.
        if (side == OrderSide::Buy && self.long) || (side == OrderSide::Sell && !self.long) {
            return Ok(());
        }

        match api.place_order(self.order(candle, side, reason)).await {
            Ok(order) => {
                self.long = side == OrderSide::Buy;
                api.log(
                    LogLevel::Info,
                    "order placed",
                    serde_json::json!({"id": order.id, "side": side.to_string(), "symbol": candle.symbol}),
                );
            }
            Err(e) => {
                // Order failures are the strategy's to handle; report and
                // keep the previous exposure state.
                api.log(
                    LogLevel::Warn,
                    "order rejected",
                    serde_json::json!({"error": e.to_string(), "symbol": candle.symbol}),
                );
            }
        }
        Ok(())
    }
}
