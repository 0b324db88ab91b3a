//! Binance market-data provider: live kline streaming over WebSocket plus
//! paged historical download through the REST klines endpoint.

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use super::common::{DEFAULT_BASE_URL, DEFAULT_WS_URL, KLINES_PAGE_LIMIT, parse_kline_array};
use super::websocket::kline_subscription;
use crate::application::market_data::StreamMux;
use crate::domain::errors::MarketDataError;
use crate::domain::market::{CandleStream, Interval, Timespan};
use crate::domain::ports::{
    CandleSink, MarketDataProvider, ProgressHandler, StatusHandler,
};
use crate::infrastructure::core::{HttpClientFactory, build_url_with_query};

pub struct BinanceMarketData {
    client: ClientWithMiddleware,
    /// Optional: market-data endpoints are public, the key only raises
    /// rate limits.
    api_key: Option<String>,
    base_url: String,
    ws_url: String,
    symbols: Vec<String>,
    interval: Interval,
    writer: RwLock<Option<Arc<dyn CandleSink>>>,
    status_handler: RwLock<Option<StatusHandler>>,
}

impl BinanceMarketData {
    pub fn builder() -> BinanceMarketDataBuilder {
        BinanceMarketDataBuilder::default()
    }

    fn download_error(ticker: &str, reason: impl Into<String>) -> MarketDataError {
        MarketDataError::DownloadFailed {
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }

    async fn fetch_kline_page(
        &self,
        ticker: &str,
        interval: Interval,
        start_ms: i64,
        end_ms: i64,
    ) -> Result<Vec<serde_json::Value>, MarketDataError> {
        let url = build_url_with_query(
            &format!("{}/api/v3/klines", self.base_url),
            &[
                ("symbol", ticker),
                ("interval", interval.as_str()),
                ("startTime", &start_ms.to_string()),
                ("endTime", &end_ms.to_string()),
                ("limit", &KLINES_PAGE_LIMIT.to_string()),
            ],
        );

        let mut request = self.client.get(&url);
        if let Some(key) = &self.api_key {
            request = request.header("X-MBX-APIKEY", key);
        }
        let response = request
            .send()
            .await
            .map_err(|e| Self::download_error(ticker, format!("klines request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::download_error(
                ticker,
                format!("klines returned {status}: {body}"),
            ));
        }

        response
            .json::<Vec<serde_json::Value>>()
            .await
            .map_err(|e| Self::download_error(ticker, format!("klines parse failed: {e}")))
    }
}

#[derive(Default)]
pub struct BinanceMarketDataBuilder {
    api_key: Option<String>,
    base_url: Option<String>,
    ws_url: Option<String>,
    symbols: Vec<String>,
    interval: Option<Interval>,
}

impl BinanceMarketDataBuilder {
    pub fn api_key(mut self, api_key: impl Into<String>) -> Self {
        self.api_key = Some(api_key.into());
        self
    }

    pub fn base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = Some(base_url.into());
        self
    }

    pub fn ws_url(mut self, ws_url: impl Into<String>) -> Self {
        self.ws_url = Some(ws_url.into());
        self
    }

    pub fn symbols(mut self, symbols: Vec<String>) -> Self {
        self.symbols = symbols;
        self
    }

    pub fn interval(mut self, interval: Interval) -> Self {
        self.interval = Some(interval);
        self
    }

    pub fn build(self) -> BinanceMarketData {
        BinanceMarketData {
            client: HttpClientFactory::create_client(),
            api_key: self.api_key,
            base_url: self.base_url.unwrap_or_else(|| DEFAULT_BASE_URL.to_string()),
            ws_url: self.ws_url.unwrap_or_else(|| DEFAULT_WS_URL.to_string()),
            symbols: self.symbols,
            interval: self.interval.unwrap_or_default(),
            writer: RwLock::new(None),
            status_handler: RwLock::new(None),
        }
    }
}

#[async_trait]
impl MarketDataProvider for BinanceMarketData {
    fn provider_tag(&self) -> &'static str {
        "binance"
    }

    fn supports_interval(&self, _interval: Interval) -> bool {
        // Binance spot serves every period this engine models, 1s included.
        true
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

        let url = format!("{}/api/v3/exchangeInfo", self.base_url);
        let response = self.client.get(&url).send().await.map_err(|e| {
            MarketDataError::ConnectionFailed {
                symbol: String::new(),
                reason: format!("exchangeInfo request failed: {e}"),
            }
        })?;

        if !response.status().is_success() {
            let status = response.status();
            return Err(MarketDataError::Validation(format!(
                "exchangeInfo returned {status}"
            )));
        }

        #[derive(Deserialize)]
        struct SymbolInfo {
            symbol: String,
        }
        #[derive(Deserialize)]
        struct ExchangeInfo {
            symbols: Vec<SymbolInfo>,
        }

        let info: ExchangeInfo = response.json().await.map_err(|e| {
            MarketDataError::Validation(format!("exchangeInfo parse failed: {e}"))
        })?;
        let known: HashSet<String> = info.symbols.into_iter().map(|s| s.symbol).collect();

        let unknown: Vec<String> = symbols
            .iter()
            .filter(|s| !known.contains(*s))
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
        multiplier: u32,
        timespan: Timespan,
        on_progress: Option<ProgressHandler>,
    ) -> Result<PathBuf, MarketDataError> {
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

        let interval = Interval::from_range(multiplier, timespan).ok_or_else(|| {
            MarketDataError::Validation(format!(
                "unsupported download range: {multiplier} x {timespan}"
            ))
        })?;

        let from_ms = from.timestamp_millis();
        let end_ms = to.timestamp_millis();
        let total_ms = (end_ms - from_ms).max(1);
        let path = writer.output_path();
        let file_existed = path.exists();

        info!(
            "BinanceMarketData: downloading {} {} from {} to {}",
            ticker, interval, from, to
        );

        let mut cursor_ms = from_ms;
        let mut written = 0usize;
        let result: Result<(), MarketDataError> = loop {
            if ctx.is_cancelled() {
                break Err(MarketDataError::Cancelled);
            }

            let page = match self
                .fetch_kline_page(ticker, interval, cursor_ms, end_ms)
                .await
            {
                Ok(page) => page,
                Err(e) => break Err(e),
            };
            if page.is_empty() {
                break Ok(());
            }

            let page_len = page.len();
            let mut last_close_ms = cursor_ms;
            let mut page_error = None;
            for entry in &page {
                let (candle, close_ms) = match parse_kline_array(ticker, entry) {
                    Ok(parsed) => parsed,
                    Err(e) => {
                        page_error = Some(e);
                        break;
                    }
                };
                if let Err(e) = writer.write(&candle) {
                    page_error = Some(Self::download_error(ticker, e.to_string()));
                    break;
                }
                written += 1;
                last_close_ms = close_ms;
            }
            if let Some(e) = page_error {
                break Err(e);
            }

            if let Some(progress) = &on_progress {
                let elapsed = (last_close_ms - from_ms) as f64;
                progress((elapsed / total_ms as f64).clamp(0.0, 1.0));
            }

            // A short page is the last one; a full page continues just past
            // the last close time.
            if page_len < KLINES_PAGE_LIMIT {
                break Ok(());
            }
            cursor_ms = last_close_ms + 1;
            if cursor_ms > end_ms {
                break Ok(());
            }
        };

        match result {
            Ok(()) => {
                debug!(
                    "BinanceMarketData: downloaded {} candles for {}",
                    written, ticker
                );
                writer
                    .finalize()
                    .map_err(|e| Self::download_error(ticker, e.to_string()))
            }
            Err(e) => {
                // A failed run that wrote nothing must not leave a phantom
                // file behind to fool a retry.
                if written == 0 && !file_existed && path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                Err(e)
            }
        }
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

        let mut mux = StreamMux::new(ctx, self.symbols.len());
        for symbol in &self.symbols {
            let url = format!(
                "{}/ws/{}@kline_{}",
                self.ws_url,
                symbol.to_lowercase(),
                self.interval.as_str()
            );
            mux.spawn(kline_subscription(
                url,
                symbol.clone(),
                mux.sink(),
                handler.clone(),
            ));
        }
        mux.into_stream()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_defaults() {
        let provider = BinanceMarketData::builder()
            .symbols(vec!["BTCUSDT".to_string()])
            .build();
        assert_eq!(provider.base_url, DEFAULT_BASE_URL);
        assert_eq!(provider.ws_url, DEFAULT_WS_URL);
        assert_eq!(provider.interval, Interval::OneMinute);
        assert_eq!(provider.provider_tag(), "binance");
    }

    #[tokio::test]
    async fn test_stream_with_no_symbols_yields_single_error() {
        let provider = BinanceMarketData::builder().build();
        let ctx = CancellationToken::new();
        let mut stream = provider.stream(&ctx);

        assert!(matches!(
            stream.next().await,
            Some(Err(MarketDataError::Validation(_)))
        ));
        assert!(stream.next().await.is_none());
    }

    #[tokio::test]
    async fn test_download_without_writer_is_rejected() {
        let provider = BinanceMarketData::builder()
            .symbols(vec!["BTCUSDT".to_string()])
            .build();
        let ctx = CancellationToken::new();
        let err = provider
            .download(
                &ctx,
                "BTCUSDT",
                Utc::now() - chrono::Duration::hours(1),
                Utc::now(),
                1,
                Timespan::Minute,
                None,
            )
            .await
            .unwrap_err();
        assert!(matches!(err, MarketDataError::Validation(_)));
    }
}
