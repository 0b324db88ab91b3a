//! Bulk-download CLI: pulls a historical candle range from a provider into
//! the columnar stream file, the same file the live engine appends to.
//!
//! Example:
//!   download --ticker BTCUSDT --provider binance \
//!            --start 2024-01-01 --interval 1m --data ./data

use anyhow::{Context, Result, bail};
use chrono::{DateTime, NaiveDate, Utc};
use clap::{Parser, ValueEnum};
use std::path::PathBuf;
use std::sync::Arc;
use tokio_util::sync::CancellationToken;
use tracing::info;

use candleflow::domain::market::Interval;
use candleflow::domain::ports::{CandleSink, MarketDataProvider, ProgressHandler};
use candleflow::infrastructure::binance::BinanceMarketData;
use candleflow::infrastructure::persistence::{StreamWriter, query};
use candleflow::infrastructure::polygon::PolygonMarketData;

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum ProviderKind {
    Polygon,
    Binance,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
enum WriterKind {
    /// Columnar parquet stream file.
    Parquet,
}

#[derive(Debug, Parser)]
#[command(
    name = "download",
    about = "Download historical candles into a stream data file"
)]
struct Cli {
    /// Symbol to download, e.g. BTCUSDT or AAPL.
    #[arg(long)]
    ticker: String,

    /// Range start (RFC 3339 or YYYY-MM-DD).
    #[arg(long)]
    start: String,

    /// Range end (RFC 3339 or YYYY-MM-DD); defaults to now.
    #[arg(long)]
    end: Option<String>,

    #[arg(long, value_enum, default_value = "polygon")]
    provider: ProviderKind,

    #[arg(long, value_enum, default_value = "parquet")]
    writer: WriterKind,

    /// Output directory for the stream data file.
    #[arg(long, default_value = "./data")]
    data: PathBuf,

    /// Candle period, e.g. 1m, 15m, 1h, 1d.
    #[arg(long, default_value = "1m")]
    interval: String,
}

fn parse_time(raw: &str, label: &str) -> Result<DateTime<Utc>> {
    if let Ok(parsed) = DateTime::parse_from_rfc3339(raw) {
        return Ok(parsed.with_timezone(&Utc));
    }
    let date = NaiveDate::parse_from_str(raw, "%Y-%m-%d")
        .with_context(|| format!("{label} must be RFC 3339 or YYYY-MM-DD, got '{raw}'"))?;
    Ok(date
        .and_hms_opt(0, 0, 0)
        .expect("midnight is always valid")
        .and_utc())
}

#[tokio::main]
async fn main() -> Result<()> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| "info".into()),
        )
        .init();

    let cli = Cli::parse();

    let from = parse_time(&cli.start, "--start")?;
    let to = match &cli.end {
        Some(raw) => parse_time(raw, "--end")?,
        None => Utc::now(),
    };
    if from >= to {
        bail!("--start ({from}) must be before --end ({to})");
    }

    let interval: Interval = cli.interval.parse()?;
    let (multiplier, timespan) = interval.to_range();

    let provider: Arc<dyn MarketDataProvider> = match cli.provider {
        ProviderKind::Binance => Arc::new(
            BinanceMarketData::builder()
                .symbols(vec![cli.ticker.clone()])
                .interval(interval)
                .build(),
        ),
        ProviderKind::Polygon => {
            let api_key = std::env::var("POLYGON_API_KEY")
                .context("POLYGON_API_KEY is required for the polygon provider")?;
            Arc::new(PolygonMarketData::new(api_key))
        }
    };

    let WriterKind::Parquet = cli.writer;
    let writer = Arc::new(StreamWriter::new(
        &cli.data,
        provider.provider_tag(),
        interval,
    ));
    writer.initialize().context("writer initialization failed")?;
    provider.configure_writer(writer.clone());

    let ctx = CancellationToken::new();
    let ctrl_c_token = ctx.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            info!("interrupt received, stopping download");
            ctrl_c_token.cancel();
        }
    });

    let progress: ProgressHandler = Arc::new(|ratio: f64| {
        info!("download progress: {:.1}%", ratio * 100.0);
    });

    info!(
        "downloading {} {} from {} to {}",
        cli.ticker, interval, from, to
    );
    let path = provider
        .download(
            &ctx,
            &cli.ticker,
            from,
            to,
            multiplier,
            timespan,
            Some(progress),
        )
        .await
        .context("download failed")?;

    let rows = query::count_rows(&path).await.unwrap_or(0);
    info!("done: {} now holds {} candles", path.display(), rows);
    Ok(())
}
