//! Per-symbol Binance kline WebSocket subscription.
//!
//! Each subscription owns one connection to `/ws/{symbol}@kline_{interval}`
//! and forwards only finalized klines (frame flag `k.x`) into the shared
//! stream channels. There is no reconnection here: a closed or failed
//! connection emits `Disconnected` and ends the subscription; restarting is
//! the embedder's decision.

use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, info, warn};

use crate::application::market_data::SubscriptionSink;
use crate::domain::errors::MarketDataError;
use crate::domain::market::{Candle, ConnectionStatus};
use crate::domain::ports::StatusHandler;

#[derive(Debug, Deserialize)]
struct KlineEvent {
    #[serde(rename = "k")]
    kline: KlinePayload,
}

#[derive(Debug, Deserialize)]
struct KlinePayload {
    #[serde(rename = "t")]
    start_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "o")]
    open: String,
    #[serde(rename = "h")]
    high: String,
    #[serde(rename = "l")]
    low: String,
    #[serde(rename = "c")]
    close: String,
    #[serde(rename = "v")]
    volume: String,
    #[serde(rename = "x")]
    is_final: bool,
}

impl KlinePayload {
    fn into_candle(self) -> Result<Candle, MarketDataError> {
        let parse = |name: &str, raw: &str| {
            raw.parse::<f64>()
                .map_err(|e| MarketDataError::Stream(format!("kline {name} '{raw}': {e}")))
        };
        let start_time = chrono::DateTime::from_timestamp_millis(self.start_time)
            .ok_or_else(|| {
                MarketDataError::Stream(format!("kline start time {} out of range", self.start_time))
            })?;

        let candle = Candle {
            start_time,
            open: parse("open", &self.open)?,
            high: parse("high", &self.high)?,
            low: parse("low", &self.low)?,
            close: parse("close", &self.close)?,
            volume: parse("volume", &self.volume)?,
            is_final: self.is_final,
            symbol: self.symbol,
        };
        candle.validate().map_err(MarketDataError::Stream)?;
        Ok(candle)
    }
}

fn notify(handler: &Option<StatusHandler>, symbol: &str, status: ConnectionStatus) {
    if let Some(handler) = handler {
        handler(symbol, status);
    }
}

/// Run one kline subscription until cancellation, connection close, or a
/// read error. Connection failure is reported through the error channel and
/// does not affect the other symbols.
pub(crate) async fn kline_subscription(
    url: String,
    symbol: String,
    sink: SubscriptionSink,
    on_status: Option<StatusHandler>,
) {
    let (ws_stream, _) = match connect_async(url.as_str()).await {
        Ok(connected) => connected,
        Err(e) => {
            warn!("BinanceMarketData: connect failed for {}: {}", symbol, e);
            sink.send_error(MarketDataError::ConnectionFailed {
                symbol: symbol.clone(),
                reason: e.to_string(),
            })
            .await;
            notify(&on_status, &symbol, ConnectionStatus::Disconnected);
            return;
        }
    };

    info!("BinanceMarketData: subscribed to {}", symbol);
    notify(&on_status, &symbol, ConnectionStatus::Connected);

    let (mut write, mut read) = ws_stream.split();

    loop {
        tokio::select! {
            _ = sink.cancelled() => break,
            frame = read.next() => match frame {
                None => break,
                Some(Ok(Message::Text(text))) => {
                    match serde_json::from_str::<KlineEvent>(&text) {
                        Ok(event) => {
                            // Non-final frames never cross this boundary.
                            if !event.kline.is_final {
                                continue;
                            }
                            match event.kline.into_candle() {
                                Ok(candle) => {
                                    if !sink.send_candle(candle).await {
                                        break;
                                    }
                                }
                                Err(e) => {
                                    if !sink.send_error(e).await {
                                        break;
                                    }
                                }
                            }
                        }
                        // Subscription confirmations and other frames are
                        // not kline events; skip them quietly.
                        Err(e) => debug!(
                            "BinanceMarketData: ignoring non-kline frame for {}: {}",
                            symbol, e
                        ),
                    }
                }
                Some(Ok(Message::Ping(payload))) => {
                    let _ = write.send(Message::Pong(payload)).await;
                }
                Some(Ok(Message::Close(_))) => {
                    info!("BinanceMarketData: {} closed by server", symbol);
                    break;
                }
                Some(Err(e)) => {
                    sink.send_error(MarketDataError::Stream(format!(
                        "websocket read failed for {symbol}: {e}"
                    )))
                    .await;
                    break;
                }
                _ => {}
            }
        }
    }

    notify(&on_status, &symbol, ConnectionStatus::Disconnected);
}
