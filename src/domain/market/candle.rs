use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// One period's OHLCV summary. Identity is `(symbol, start_time)`; every
/// other field is payload. Only candles with `is_final == true` ever leave
/// the market-data layer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub symbol: String,
    pub start_time: DateTime<Utc>,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub is_final: bool,
}

impl Candle {
    pub fn validate(&self) -> Result<(), String> {
        if self.symbol.is_empty() {
            return Err("candle symbol is empty".to_string());
        }

        let prices = [self.open, self.high, self.low, self.close];
        if prices.iter().any(|p| !p.is_finite() || *p < 0.0) {
            return Err(format!(
                "candle {} @ {} has a non-finite or negative price",
                self.symbol, self.start_time
            ));
        }
        if !self.volume.is_finite() || self.volume < 0.0 {
            return Err(format!(
                "candle {} @ {} has invalid volume {}",
                self.symbol, self.start_time, self.volume
            ));
        }

        // low <= open,close <= high
        if self.low > self.open
            || self.low > self.close
            || self.high < self.open
            || self.high < self.close
        {
            return Err(format!(
                "candle {} @ {} violates OHLC ordering (o={} h={} l={} c={})",
                self.symbol, self.start_time, self.open, self.high, self.low, self.close
            ));
        }

        Ok(())
    }

    pub fn start_time_ms(&self) -> i64 {
        self.start_time.timestamp_millis()
    }
}
