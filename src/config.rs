use anyhow::{Context, Result};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::env;
use std::path::PathBuf;

use crate::domain::errors::EngineError;
use crate::domain::market::Interval;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum StartTimeMode {
    Days,
    Date,
}

impl std::str::FromStr for StartTimeMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "days" => Ok(StartTimeMode::Days),
            "date" => Ok(StartTimeMode::Date),
            _ => anyhow::bail!("invalid start time mode: {}. Must be 'days' or 'date'", s),
        }
    }
}

/// Historical prefetch and gap-fill settings.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(default)]
pub struct PrefetchConfig {
    pub enabled: bool,
    pub start_time_mode: StartTimeMode,
    /// Lookback window when `start_time_mode == Days`.
    pub days: u32,
    /// Fixed start when `start_time_mode == Date`.
    pub start_date: Option<DateTime<Utc>>,
    /// A gap is only filled when it exceeds `multiplier x interval`. Keeps
    /// sub-interval clock skew from triggering spurious downloads.
    pub gap_tolerance_multiplier: u32,
}

impl Default for PrefetchConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            start_time_mode: StartTimeMode::Days,
            days: 7,
            start_date: None,
            gap_tolerance_multiplier: 2,
        }
    }
}

impl PrefetchConfig {
    pub fn validate(&self) -> Result<(), EngineError> {
        if !self.enabled {
            return Ok(());
        }
        match self.start_time_mode {
            StartTimeMode::Days if self.days == 0 => Err(EngineError::Validation(
                "prefetch.days must be greater than zero".to_string(),
            )),
            StartTimeMode::Date if self.start_date.is_none() => Err(EngineError::Validation(
                "prefetch.start_date is required when start_time_mode is 'date'".to_string(),
            )),
            _ => Ok(()),
        }
    }

    /// Resolve the configured prefetch window start relative to `now`.
    pub fn start_time(&self, now: DateTime<Utc>) -> Result<DateTime<Utc>, EngineError> {
        match self.start_time_mode {
            StartTimeMode::Days => Ok(now - Duration::days(i64::from(self.days))),
            StartTimeMode::Date => self.start_date.ok_or_else(|| {
                EngineError::Validation("prefetch.start_date is not set".to_string())
            }),
        }
    }
}

/// Engine-scope configuration, validated by `LiveEngine::initialize`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct EngineConfig {
    pub symbols: Vec<String>,
    #[serde(default)]
    pub interval: Interval,
    #[serde(default = "default_cache_size")]
    pub market_data_cache_size: usize,
    #[serde(default = "default_enable_logging")]
    pub enable_logging: bool,
    #[serde(default)]
    pub log_output_path: Option<PathBuf>,
    #[serde(default = "default_data_dir")]
    pub data_dir: PathBuf,
    #[serde(default)]
    pub prefetch: PrefetchConfig,
}

fn default_cache_size() -> usize {
    1000
}

fn default_enable_logging() -> bool {
    true
}

fn default_data_dir() -> PathBuf {
    PathBuf::from("./data")
}

impl EngineConfig {
    pub fn new(symbols: Vec<String>) -> Self {
        Self {
            symbols,
            interval: Interval::default(),
            market_data_cache_size: default_cache_size(),
            enable_logging: default_enable_logging(),
            log_output_path: None,
            data_dir: default_data_dir(),
            prefetch: PrefetchConfig::default(),
        }
    }

    pub fn validate(&self) -> Result<(), EngineError> {
        if self.symbols.is_empty() {
            return Err(EngineError::Validation(
                "symbols must not be empty".to_string(),
            ));
        }
        if self.symbols.iter().any(|s| s.trim().is_empty()) {
            return Err(EngineError::Validation(
                "symbols must not contain empty entries".to_string(),
            ));
        }
        let mut seen = std::collections::HashSet::new();
        for symbol in &self.symbols {
            if !seen.insert(symbol.as_str()) {
                return Err(EngineError::Validation(format!(
                    "duplicate symbol: {}",
                    symbol
                )));
            }
        }
        self.prefetch.validate()
    }

    /// Load from environment variables (with `.env` support), the same way
    /// the binaries configure themselves.
    pub fn from_env() -> Result<Self> {
        let _ = dotenvy::dotenv();

        let symbols: Vec<String> = env::var("SYMBOLS")
            .unwrap_or_else(|_| "BTCUSDT".to_string())
            .split(',')
            .map(|s| s.trim().to_string())
            .filter(|s| !s.is_empty())
            .collect();

        let interval = env::var("INTERVAL")
            .unwrap_or_else(|_| "1m".to_string())
            .parse::<Interval>()?;

        let market_data_cache_size = env::var("MARKET_DATA_CACHE_SIZE")
            .unwrap_or_else(|_| "1000".to_string())
            .parse::<usize>()
            .context("failed to parse MARKET_DATA_CACHE_SIZE")?;

        let enable_logging = env::var("ENABLE_LOGGING")
            .map(|v| v != "false" && v != "0")
            .unwrap_or(true);

        let log_output_path = env::var("LOG_OUTPUT_PATH")
            .ok()
            .filter(|v| !v.is_empty())
            .map(PathBuf::from);

        let data_dir = PathBuf::from(env::var("DATA_DIR").unwrap_or_else(|_| "./data".to_string()));

        let prefetch_enabled = env::var("PREFETCH_ENABLED")
            .map(|v| v == "true" || v == "1")
            .unwrap_or(false);

        let start_time_mode = env::var("PREFETCH_START_TIME_MODE")
            .unwrap_or_else(|_| "days".to_string())
            .parse::<StartTimeMode>()?;

        let days = env::var("PREFETCH_DAYS")
            .unwrap_or_else(|_| "7".to_string())
            .parse::<u32>()
            .context("failed to parse PREFETCH_DAYS")?;

        let start_date = match env::var("PREFETCH_START_DATE") {
            Ok(raw) if !raw.is_empty() => Some(
                DateTime::parse_from_rfc3339(&raw)
                    .context("failed to parse PREFETCH_START_DATE as RFC 3339")?
                    .with_timezone(&Utc),
            ),
            _ => None,
        };

        Ok(Self {
            symbols,
            interval,
            market_data_cache_size,
            enable_logging,
            log_output_path,
            data_dir,
            prefetch: PrefetchConfig {
                enabled: prefetch_enabled,
                start_time_mode,
                days,
                start_date,
                gap_tolerance_multiplier: 2,
            },
        })
    }
}
