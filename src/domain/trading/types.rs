use chrono::{DateTime, Utc};
use rust_decimal::Decimal;
use serde::{Deserialize, Serialize};
use std::fmt;

use crate::domain::errors::OrderError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderSide {
    Buy,
    Sell,
}

impl fmt::Display for OrderSide {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderSide::Buy => write!(f, "BUY"),
            OrderSide::Sell => write!(f, "SELL"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderType {
    Market,
    Limit,
}

impl fmt::Display for OrderType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OrderType::Market => write!(f, "MARKET"),
            OrderType::Limit => write!(f, "LIMIT"),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PositionType {
    Long,
    Short,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum OrderStatus {
    New,
    PartiallyFilled,
    Filled,
    Canceled,
    Rejected,
}

impl fmt::Display for OrderStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:?}", self)
    }
}

/// A strategy's request to trade, handed to the trading provider. The
/// provider assigns the order id on acceptance.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct OrderRequest {
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    /// Required for limit orders, ignored for market orders.
    pub price: Option<Decimal>,
    pub reason: String,
    pub strategy_name: String,
    pub take_profit: Option<Decimal>,
    pub stop_loss: Option<Decimal>,
    pub position_type: PositionType,
}

impl OrderRequest {
    pub fn validate(&self) -> Result<(), OrderError> {
        if self.symbol.is_empty() {
            return Err(OrderError::Invalid {
                reason: "order symbol is empty".to_string(),
            });
        }
        if self.quantity <= Decimal::ZERO {
            return Err(OrderError::Invalid {
                reason: format!("order quantity must be positive, got {}", self.quantity),
            });
        }
        match (self.order_type, self.price) {
            (OrderType::Limit, None) => Err(OrderError::Invalid {
                reason: "limit order requires a price".to_string(),
            }),
            (OrderType::Limit, Some(p)) if p <= Decimal::ZERO => Err(OrderError::Invalid {
                reason: format!("limit price must be positive, got {}", p),
            }),
            _ => Ok(()),
        }
    }
}

/// An order accepted by the trading provider.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ExecutedOrder {
    pub id: String,
    pub symbol: String,
    pub side: OrderSide,
    pub order_type: OrderType,
    pub quantity: Decimal,
    pub price: Option<Decimal>,
    pub status: OrderStatus,
    pub strategy_name: String,
    pub timestamp: DateTime<Utc>,
}

impl ExecutedOrder {
    pub fn from_request(id: impl Into<String>, request: &OrderRequest, status: OrderStatus) -> Self {
        Self {
            id: id.into(),
            symbol: request.symbol.clone(),
            side: request.side,
            order_type: request.order_type,
            quantity: request.quantity,
            price: request.price,
            status,
            strategy_name: request.strategy_name.clone(),
            timestamp: Utc::now(),
        }
    }
}

/// Open position as reported by the trading provider. The engine treats
/// these as opaque and only proxies them to the strategy.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Position {
    pub symbol: String,
    pub quantity: Decimal,
    pub average_price: Decimal,
    pub position_type: PositionType,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Balance {
    pub asset: String,
    pub free: Decimal,
    pub locked: Decimal,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Account {
    pub balances: Vec<Balance>,
}

impl Account {
    pub fn free(&self, asset: &str) -> Decimal {
        self.balances
            .iter()
            .find(|b| b.asset == asset)
            .map(|b| b.free)
            .unwrap_or(Decimal::ZERO)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use rust_decimal_macros::dec;

    fn request(order_type: OrderType, quantity: Decimal, price: Option<Decimal>) -> OrderRequest {
        OrderRequest {
            symbol: "BTCUSDT".to_string(),
            side: OrderSide::Buy,
            order_type,
            quantity,
            price,
            reason: "test".to_string(),
            strategy_name: "unit".to_string(),
            take_profit: None,
            stop_loss: None,
            position_type: PositionType::Long,
        }
    }

    #[test]
    fn test_market_order_without_price_is_valid() {
        assert!(request(OrderType::Market, dec!(0.5), None).validate().is_ok());
    }

    #[test]
    fn test_limit_order_requires_positive_price() {
        assert!(request(OrderType::Limit, dec!(1), None).validate().is_err());
        assert!(
            request(OrderType::Limit, dec!(1), Some(dec!(0)))
                .validate()
                .is_err()
        );
        assert!(
            request(OrderType::Limit, dec!(1), Some(dec!(42000)))
                .validate()
                .is_ok()
        );
    }

    #[test]
    fn test_quantity_must_be_positive() {
        assert!(request(OrderType::Market, dec!(0), None).validate().is_err());
        assert!(request(OrderType::Market, dec!(-1), None).validate().is_err());
    }

    #[test]
    fn test_account_free_lookup() {
        let account = Account {
            balances: vec![Balance {
                asset: "USDT".to_string(),
                free: dec!(1000),
                locked: dec!(50),
            }],
        };
        assert_eq!(account.free("USDT"), dec!(1000));
        assert_eq!(account.free("BTC"), dec!(0));
    }
}
