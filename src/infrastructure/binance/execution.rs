//! Binance spot trading adapter: HMAC-SHA256 signed order placement and
//! account queries.
//!
//! Orders go through a plain (non-retrying) client: replaying a submitted
//! order on a flaky connection could fill it twice.

use async_trait::async_trait;
use chrono::Utc;
use hmac::{Hmac, Mac};
use reqwest::header::{HeaderMap, HeaderValue};
use rust_decimal::Decimal;
use serde::Deserialize;
use sha2::Sha256;
use std::str::FromStr;
use tracing::{debug, warn};

use super::common::DEFAULT_BASE_URL;
use crate::domain::errors::OrderError;
use crate::domain::ports::TradingProvider;
use crate::domain::trading::{
    Account, Balance, ExecutedOrder, OrderRequest, OrderSide, OrderStatus, OrderType, Position,
    PositionType,
};

type HmacSha256 = Hmac<Sha256>;

/// Tolerated clock drift against the venue, in milliseconds.
const RECV_WINDOW: u64 = 5000;

// Binance API error codes surfaced as structured order errors.
const CODE_INSUFFICIENT_BALANCE: i64 = -2010;
const CODE_UNKNOWN_SYMBOL: i64 = -1121;

pub struct BinanceTrading {
    secret: String,
    base_url: String,
    client: reqwest::Client,
}

impl BinanceTrading {
    pub fn new(api_key: impl Into<String>, secret: impl Into<String>) -> Self {
        Self::with_base_url(api_key, secret, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(
        api_key: impl Into<String>,
        secret: impl Into<String>,
        base_url: impl Into<String>,
    ) -> Self {
        let api_key = api_key.into();

        let mut default_headers = HeaderMap::new();
        if let Ok(value) = HeaderValue::from_str(&api_key) {
            default_headers.insert("X-MBX-APIKEY", value);
        }

        let client = reqwest::Client::builder()
            .default_headers(default_headers)
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .unwrap_or_else(|_| reqwest::Client::new());

        Self {
            secret: secret.into(),
            base_url: base_url.into(),
            client,
        }
    }

    fn sign(&self, query: &str) -> String {
        let mut mac =
            HmacSha256::new_from_slice(self.secret.as_bytes()).expect("HMAC accepts any key size");
        mac.update(query.as_bytes());
        hex::encode(mac.finalize().into_bytes())
    }

    fn signed_query(&self, params: &str) -> String {
        let timestamp = Utc::now().timestamp_millis();
        let base = if params.is_empty() {
            format!("timestamp={timestamp}&recvWindow={RECV_WINDOW}")
        } else {
            format!("{params}&timestamp={timestamp}&recvWindow={RECV_WINDOW}")
        };
        let signature = self.sign(&base);
        format!("{base}&signature={signature}")
    }

    fn map_api_error(status: reqwest::StatusCode, body: &str, order: &OrderRequest) -> OrderError {
        #[derive(Deserialize)]
        struct ApiError {
            code: i64,
            msg: String,
        }

        match serde_json::from_str::<ApiError>(body) {
            Ok(api) => match api.code {
                CODE_INSUFFICIENT_BALANCE => OrderError::InsufficientBalance { reason: api.msg },
                CODE_UNKNOWN_SYMBOL => OrderError::UnknownSymbol {
                    symbol: order.symbol.clone(),
                },
                _ => OrderError::Rejected {
                    reason: format!("{} (code {})", api.msg, api.code),
                },
            },
            Err(_) => OrderError::Provider(format!("order endpoint returned {status}: {body}")),
        }
    }

    async fn signed_get(&self, endpoint: &str, params: &str) -> Result<String, OrderError> {
        let query = self.signed_query(params);
        let url = format!("{}{}?{}", self.base_url, endpoint, query);

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| OrderError::Provider(format!("GET {endpoint} failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OrderError::Provider(format!("GET {endpoint} body read failed: {e}")))?;
        if !status.is_success() {
            return Err(OrderError::Provider(format!(
                "GET {endpoint} returned {status}: {body}"
            )));
        }
        Ok(body)
    }
}

fn parse_status(raw: &str) -> OrderStatus {
    match raw {
        "FILLED" => OrderStatus::Filled,
        "PARTIALLY_FILLED" => OrderStatus::PartiallyFilled,
        "CANCELED" => OrderStatus::Canceled,
        "REJECTED" => OrderStatus::Rejected,
        _ => OrderStatus::New,
    }
}

#[derive(Debug, Deserialize)]
struct OrderResponse {
    #[serde(rename = "orderId")]
    order_id: u64,
    status: String,
}

#[derive(Debug, Deserialize)]
struct RawBalance {
    asset: String,
    free: String,
    locked: String,
}

#[derive(Debug, Deserialize)]
struct AccountResponse {
    balances: Vec<RawBalance>,
}

#[async_trait]
impl TradingProvider for BinanceTrading {
    async fn place_order(&self, order: &OrderRequest) -> Result<ExecutedOrder, OrderError> {
        order.validate()?;

        let mut params = format!(
            "symbol={}&side={}&type={}&quantity={}",
            order.symbol, order.side, order.order_type, order.quantity
        );
        if order.order_type == OrderType::Limit {
            let price = order.price.expect("validated: limit orders carry a price");
            params.push_str(&format!("&price={price}&timeInForce=GTC"));
        }

        let query = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        debug!(
            "BinanceTrading: placing {} {} {} x {}",
            order.side, order.order_type, order.symbol, order.quantity
        );

        let response = self
            .client
            .post(&url)
            .send()
            .await
            .map_err(|e| OrderError::Provider(format!("order submit failed: {e}")))?;

        let status = response.status();
        let body = response
            .text()
            .await
            .map_err(|e| OrderError::Provider(format!("order body read failed: {e}")))?;

        if !status.is_success() {
            let err = Self::map_api_error(status, &body, order);
            warn!("BinanceTrading: order for {} failed: {}", order.symbol, err);
            return Err(err);
        }

        let parsed: OrderResponse = serde_json::from_str(&body)
            .map_err(|e| OrderError::Provider(format!("order response parse failed: {e}")))?;

        Ok(ExecutedOrder::from_request(
            parsed.order_id.to_string(),
            order,
            parse_status(&parsed.status),
        ))
    }

    async fn cancel_order(&self, symbol: &str, order_id: &str) -> Result<(), OrderError> {
        let params = format!("symbol={symbol}&orderId={order_id}");
        let query = self.signed_query(&params);
        let url = format!("{}/api/v3/order?{}", self.base_url, query);

        debug!("BinanceTrading: cancelling order {} on {}", order_id, symbol);

        let response = self
            .client
            .delete(&url)
            .send()
            .await
            .map_err(|e| OrderError::Provider(format!("cancel submit failed: {e}")))?;

        let status = response.status();
        if !status.is_success() {
            let body = response.text().await.unwrap_or_default();
            return Err(OrderError::Rejected {
                reason: format!("cancel returned {status}: {body}"),
            });
        }
        Ok(())
    }

    async fn get_open_orders(
        &self,
        symbol: Option<&str>,
    ) -> Result<Vec<ExecutedOrder>, OrderError> {
        let params = match symbol {
            Some(s) => format!("symbol={s}"),
            None => String::new(),
        };
        let body = self.signed_get("/api/v3/openOrders", &params).await?;

        #[derive(Deserialize)]
        struct OpenOrder {
            symbol: String,
            #[serde(rename = "orderId")]
            order_id: u64,
            side: String,
            #[serde(rename = "type")]
            order_type: String,
            #[serde(rename = "origQty")]
            orig_qty: String,
            price: String,
            status: String,
            time: i64,
        }

        let raw: Vec<OpenOrder> = serde_json::from_str(&body)
            .map_err(|e| OrderError::Provider(format!("openOrders parse failed: {e}")))?;

        let orders = raw
            .into_iter()
            .map(|o| ExecutedOrder {
                id: o.order_id.to_string(),
                symbol: o.symbol,
                side: if o.side == "SELL" {
                    OrderSide::Sell
                } else {
                    OrderSide::Buy
                },
                order_type: if o.order_type == "MARKET" {
                    OrderType::Market
                } else {
                    OrderType::Limit
                },
                quantity: Decimal::from_str(&o.orig_qty).unwrap_or(Decimal::ZERO),
                price: Decimal::from_str(&o.price).ok().filter(|p| *p > Decimal::ZERO),
                status: parse_status(&o.status),
                strategy_name: String::new(),
                timestamp: chrono::DateTime::from_timestamp_millis(o.time)
                    .unwrap_or_else(Utc::now),
            })
            .collect();
        Ok(orders)
    }

    async fn get_positions(&self) -> Result<Vec<Position>, OrderError> {
        // Spot venues report holdings, not positions; expose every non-zero
        // base balance as a long position with no tracked entry price.
        let account = self.get_account().await?;
        Ok(account
            .balances
            .into_iter()
            .filter(|b| b.free > Decimal::ZERO || b.locked > Decimal::ZERO)
            .map(|b| Position {
                symbol: b.asset,
                quantity: b.free + b.locked,
                average_price: Decimal::ZERO,
                position_type: PositionType::Long,
            })
            .collect())
    }

    async fn get_account(&self) -> Result<Account, OrderError> {
        let body = self.signed_get("/api/v3/account", "").await?;
        let parsed: AccountResponse = serde_json::from_str(&body)
            .map_err(|e| OrderError::Provider(format!("account parse failed: {e}")))?;

        let balances = parsed
            .balances
            .into_iter()
            .filter_map(|b| {
                let free = Decimal::from_str(&b.free).ok()?;
                let locked = Decimal::from_str(&b.locked).ok()?;
                Some(Balance {
                    asset: b.asset,
                    free,
                    locked,
                })
            })
            .collect();
        Ok(Account { balances })
    }
}

impl std::fmt::Debug for BinanceTrading {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BinanceTrading")
            .field("secret", &"<redacted>")
            .field("base_url", &self.base_url)
            .finish()
    }
}
