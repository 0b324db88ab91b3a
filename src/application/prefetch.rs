//! Historical prefetch and live-stream gap fill.
//!
//! Runs in two phases around stream start: `execute_prefetch` downloads the
//! configured lookback window before any live connection is opened, and
//! `handle_stream_start` reconciles the stored file with the first live
//! candle, backfilling the gap when it exceeds the tolerance.

use chrono::{DateTime, Utc};
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use crate::config::PrefetchConfig;
use crate::domain::errors::EngineError;
use crate::domain::market::Interval;
use crate::domain::ports::{CandleSink, MarketDataProvider};
use crate::infrastructure::persistence::query;

pub struct PrefetchController {
    config: PrefetchConfig,
    provider: Arc<dyn MarketDataProvider>,
    writer: Arc<dyn CandleSink>,
    interval: Interval,
}

impl PrefetchController {
    pub fn new(
        config: PrefetchConfig,
        provider: Arc<dyn MarketDataProvider>,
        writer: Arc<dyn CandleSink>,
        interval: Interval,
    ) -> Self {
        Self {
            config,
            provider,
            writer,
            interval,
        }
    }

    pub fn enabled(&self) -> bool {
        self.config.enabled
    }

    /// Download the configured historical window for every symbol. A
    /// per-symbol failure is logged and the loop continues; only setup
    /// failures (bad window config, cancellation) error out.
    pub async fn execute_prefetch(
        &self,
        ctx: &CancellationToken,
        symbols: &[String],
    ) -> Result<(), EngineError> {
        let now = Utc::now();
        let start = self.config.start_time(now)?;
        let (multiplier, timespan) = self.interval.to_range();

        info!(
            "PrefetchController: downloading history from {} to {} for {} symbols",
            start,
            now,
            symbols.len()
        );

        for symbol in symbols {
            if ctx.is_cancelled() {
                return Err(EngineError::Cancelled);
            }
            match self
                .provider
                .download(ctx, symbol, start, now, multiplier, timespan, None)
                .await
            {
                Ok(path) => debug!(
                    "PrefetchController: prefetched {} into {}",
                    symbol,
                    path.display()
                ),
                Err(e) => warn!("PrefetchController: prefetch for {} failed: {}", symbol, e),
            }
        }
        Ok(())
    }

    /// Called once, on the first live candle. Compares the last stored
    /// candle per symbol against the first live start time and backfills
    /// when the distance exceeds `gap_tolerance_multiplier x interval`.
    /// Every failure in here is non-fatal: the run proceeds with whatever
    /// history exists.
    pub async fn handle_stream_start(
        &self,
        ctx: &CancellationToken,
        first_live_time: DateTime<Utc>,
        symbols: &[String],
    ) {
        let tolerance = self.interval.duration() * self.config.gap_tolerance_multiplier as i32;
        let (multiplier, timespan) = self.interval.to_range();
        let path = self.writer.output_path();

        for symbol in symbols {
            if ctx.is_cancelled() {
                return;
            }

            let last_stored = match query::last_stored_time(&path, symbol).await {
                Ok(value) => value,
                Err(e) => {
                    warn!(
                        "PrefetchController: gap query for {} failed: {}; skipping",
                        symbol, e
                    );
                    continue;
                }
            };

            // No stored history means nothing to reconcile against.
            let Some(last_stored) = last_stored else {
                debug!("PrefetchController: no stored candles for {}", symbol);
                continue;
            };

            let gap = first_live_time - last_stored;
            if gap <= tolerance {
                debug!(
                    "PrefetchController: gap for {} is {}s, within tolerance",
                    symbol,
                    gap.num_seconds()
                );
                continue;
            }

            info!(
                "PrefetchController: filling {}s gap for {} ({} -> {})",
                gap.num_seconds(),
                symbol,
                last_stored,
                first_live_time
            );
            if let Err(e) = self
                .provider
                .download(
                    ctx,
                    symbol,
                    last_stored,
                    first_live_time,
                    multiplier,
                    timespan,
                    None,
                )
                .await
            {
                warn!(
                    "PrefetchController: gap fill for {} failed: {}; continuing with existing data",
                    symbol, e
                );
            }
        }
    }
}
