//! Polygon.io bulk-download provider.
//!
//! Download-only: the aggregates endpoint backs historical pulls and gap
//! fills, while `stream` reports that live streaming is not wired up for
//! this adapter. Authentication is the `apiKey` query parameter from the
//! `POLYGON_API_KEY` environment variable (see the download CLI).

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use reqwest_middleware::ClientWithMiddleware;
use serde::Deserialize;
use std::path::PathBuf;
use std::sync::{Arc, RwLock};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use crate::domain::errors::MarketDataError;
use crate::domain::market::{Candle, CandleStream, Interval, Timespan};
use crate::domain::ports::{CandleSink, MarketDataProvider, ProgressHandler, StatusHandler};
use crate::infrastructure::core::{HttpClientFactory, build_url_with_query};

pub const DEFAULT_BASE_URL: &str = "https://api.polygon.io";

/// Maximum results per aggregates page.
pub const AGGS_PAGE_LIMIT: usize = 50_000;

pub struct PolygonMarketData {
    client: ClientWithMiddleware,
    api_key: String,
    base_url: String,
    writer: RwLock<Option<Arc<dyn CandleSink>>>,
    status_handler: RwLock<Option<StatusHandler>>,
}

#[derive(Debug, Deserialize)]
struct AggBar {
    /// Window start, epoch milliseconds.
    t: i64,
    o: f64,
    h: f64,
    l: f64,
    c: f64,
    v: f64,
}

#[derive(Debug, Deserialize)]
struct AggsResponse {
    #[serde(default)]
    results: Vec<AggBar>,
}

impl PolygonMarketData {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self::with_base_url(api_key, DEFAULT_BASE_URL)
    }

    pub fn with_base_url(api_key: impl Into<String>, base_url: impl Into<String>) -> Self {
        Self {
            client: HttpClientFactory::create_client(),
            api_key: api_key.into(),
            base_url: base_url.into(),
            writer: RwLock::new(None),
            status_handler: RwLock::new(None),
        }
    }

    fn download_error(ticker: &str, reason: impl Into<String>) -> MarketDataError {
        MarketDataError::DownloadFailed {
            ticker: ticker.to_string(),
            reason: reason.into(),
        }
    }

    async fn fetch_aggs_page(
        &self,
        ticker: &str,
        multiplier: u32,
        timespan: Timespan,
        from_ms: i64,
        to_ms: i64,
    ) -> Result<Vec<AggBar>, MarketDataError> {
        let endpoint = format!(
            "{}/v2/aggs/ticker/{}/range/{}/{}/{}/{}",
            self.base_url, ticker, multiplier, timespan, from_ms, to_ms
        );
        let url = build_url_with_query(
            &endpoint,
            &[
                ("adjusted", "true"),
                ("sort", "asc"),
                ("limit", &AGGS_PAGE_LIMIT.to_string()),
                ("apiKey", &self.api_key),
            ],
        );

        let response = self
            .client
            .get(&url)
            .send()
            .await
            .map_err(|e| Self::download_error(ticker, format!("aggregates request failed: {e}")))?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            return Err(Self::download_error(
                ticker,
                format!("aggregates returned {status}: {body}"),
            ));
        }

        let parsed: AggsResponse = response
            .json()
            .await
            .map_err(|e| Self::download_error(ticker, format!("aggregates parse failed: {e}")))?;
        Ok(parsed.results)
    }
}

#[async_trait]
impl MarketDataProvider for PolygonMarketData {
    fn provider_tag(&self) -> &'static str {
        "polygon"
    }

    fn supports_interval(&self, _interval: Interval) -> bool {
        // Every modeled period decomposes into a polygon range request.
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
        let mut unknown = Vec::new();
        for symbol in symbols {
            if ctx.is_cancelled() {
                return Err(MarketDataError::Cancelled);
            }

            let endpoint = format!("{}/v3/reference/tickers/{}", self.base_url, symbol);
            let url = build_url_with_query(&endpoint, &[("apiKey", self.api_key.as_str())]);
            let response = self.client.get(&url).send().await.map_err(|e| {
                MarketDataError::ConnectionFailed {
                    symbol: symbol.clone(),
                    reason: format!("ticker lookup failed: {e}"),
                }
            })?;

            if response.status() == reqwest::StatusCode::NOT_FOUND {
                unknown.push(symbol.clone());
            } else if !response.status().is_success() {
                return Err(MarketDataError::Validation(format!(
                    "ticker lookup for {} returned {}",
                    symbol,
                    response.status()
                )));
            }
        }

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
        let interval_ms = interval.duration_ms();

        let from_ms = from.timestamp_millis();
        let end_ms = to.timestamp_millis();
        let total_ms = (end_ms - from_ms).max(1);
        let path = writer.output_path();
        let file_existed = path.exists();

        info!(
            "PolygonMarketData: downloading {} {} from {} to {}",
            ticker, interval, from, to
        );

        let mut cursor_ms = from_ms;
        let mut written = 0usize;
        let result: Result<(), MarketDataError> = loop {
            if ctx.is_cancelled() {
                break Err(MarketDataError::Cancelled);
            }

            let page = match self
                .fetch_aggs_page(ticker, multiplier, timespan, cursor_ms, end_ms)
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
            for bar in &page {
                let Some(start_time) = DateTime::from_timestamp_millis(bar.t) else {
                    page_error = Some(Self::download_error(
                        ticker,
                        format!("bar start {} out of range", bar.t),
                    ));
                    break;
                };
                let candle = Candle {
                    symbol: ticker.to_string(),
                    start_time,
                    open: bar.o,
                    high: bar.h,
                    low: bar.l,
                    close: bar.c,
                    volume: bar.v,
                    is_final: true,
                };
                if let Err(reason) = candle.validate() {
                    page_error = Some(Self::download_error(ticker, reason));
                    break;
                }
                if let Err(e) = writer.write(&candle) {
                    page_error = Some(Self::download_error(ticker, e.to_string()));
                    break;
                }
                written += 1;
                last_close_ms = bar.t + interval_ms - 1;
            }
            if let Some(e) = page_error {
                break Err(e);
            }

            if let Some(progress) = &on_progress {
                let elapsed = (last_close_ms - from_ms) as f64;
                progress((elapsed / total_ms as f64).clamp(0.0, 1.0));
            }

            if page_len < AGGS_PAGE_LIMIT {
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
                    "PolygonMarketData: downloaded {} candles for {}",
                    written, ticker
                );
                writer
                    .finalize()
                    .map_err(|e| Self::download_error(ticker, e.to_string()))
            }
            Err(e) => {
                if written == 0 && !file_existed && path.exists() {
                    let _ = std::fs::remove_file(&path);
                }
                Err(e)
            }
        }
    }

    fn stream(&self, _ctx: &CancellationToken) -> CandleStream {
        CandleStream::from_error(MarketDataError::Stream(
            "live streaming is not supported by the polygon adapter".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_aggs_response_tolerates_missing_results() {
        let parsed: AggsResponse =
            serde_json::from_str(r#"{"status": "OK", "resultsCount": 0}"#).unwrap();
        assert!(parsed.results.is_empty());
    }

    #[test]
    fn test_aggs_bar_parsing() {
        let parsed: AggsResponse = serde_json::from_str(
            r#"{"results": [{"t": 1700000000000, "o": 1.0, "h": 2.0, "l": 0.5, "c": 1.5, "v": 100.0, "vw": 1.2, "n": 5}]}"#,
        )
        .unwrap();
        assert_eq!(parsed.results.len(), 1);
        assert_eq!(parsed.results[0].t, 1_700_000_000_000);
        assert_eq!(parsed.results[0].c, 1.5);
    }

    #[tokio::test]
    async fn test_stream_is_unsupported() {
        let provider = PolygonMarketData::new("test-key");
        let ctx = CancellationToken::new();
        let mut stream = provider.stream(&ctx);
        assert!(matches!(
            stream.next().await,
            Some(Err(MarketDataError::Stream(_)))
        ));
        assert!(stream.next().await.is_none());
    }
}
