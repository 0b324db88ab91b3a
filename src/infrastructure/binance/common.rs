use chrono::DateTime;
use serde_json::Value;

use crate::domain::errors::MarketDataError;
use crate::domain::market::Candle;

pub const DEFAULT_BASE_URL: &str = "https://api.binance.com";
pub const DEFAULT_WS_URL: &str = "wss://stream.binance.com:9443";

/// Maximum candles per `/api/v3/klines` page. A full page means another
/// page may follow; a short page is the last one.
pub const KLINES_PAGE_LIMIT: usize = 1000;

fn field_f64(value: &Value, index: usize) -> Result<f64, MarketDataError> {
    let field = value
        .get(index)
        .ok_or_else(|| MarketDataError::Stream(format!("kline entry missing field {index}")))?;
    if let Some(s) = field.as_str() {
        s.parse::<f64>()
            .map_err(|e| MarketDataError::Stream(format!("kline field {index}: {e}")))
    } else {
        field
            .as_f64()
            .ok_or_else(|| MarketDataError::Stream(format!("kline field {index} is not numeric")))
    }
}

/// Parse one entry of the klines array-of-arrays response.
///
/// Layout: `[0] openTime, [1] open, [2] high, [3] low, [4] close,
/// [5] volume, [6] closeTime, ...`. REST klines are closed periods, so the
/// parsed candle is final. Returns the candle together with its close time
/// in epoch milliseconds, which drives page advancement.
pub fn parse_kline_array(symbol: &str, value: &Value) -> Result<(Candle, i64), MarketDataError> {
    let entry = value
        .as_array()
        .ok_or_else(|| MarketDataError::Stream("kline entry is not an array".to_string()))?;
    if entry.len() < 7 {
        return Err(MarketDataError::Stream(format!(
            "kline entry has {} fields, expected at least 7",
            entry.len()
        )));
    }

    let open_time = entry[0]
        .as_i64()
        .ok_or_else(|| MarketDataError::Stream("kline open time is not an integer".to_string()))?;
    let close_time = entry[6]
        .as_i64()
        .ok_or_else(|| MarketDataError::Stream("kline close time is not an integer".to_string()))?;
    let start_time = DateTime::from_timestamp_millis(open_time)
        .ok_or_else(|| MarketDataError::Stream(format!("kline open time {open_time} out of range")))?;

    let candle = Candle {
        symbol: symbol.to_string(),
        start_time,
        open: field_f64(value, 1)?,
        high: field_f64(value, 2)?,
        low: field_f64(value, 3)?,
        close: field_f64(value, 4)?,
        volume: field_f64(value, 5)?,
        is_final: true,
    };
    candle.validate().map_err(MarketDataError::Stream)?;
    Ok((candle, close_time))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_parse_kline_array() {
        let raw = json!([
            1700000000000i64,
            "37000.1",
            "37100.0",
            "36900.5",
            "37050.2",
            "123.45",
            1700000059999i64,
            "0",
            10,
            "0",
            "0",
            "0"
        ]);
        let (candle, close_time) = parse_kline_array("BTCUSDT", &raw).unwrap();
        assert_eq!(candle.symbol, "BTCUSDT");
        assert_eq!(candle.start_time.timestamp_millis(), 1_700_000_000_000);
        assert_eq!(candle.open, 37000.1);
        assert_eq!(candle.close, 37050.2);
        assert!(candle.is_final);
        assert_eq!(close_time, 1_700_000_059_999);
    }

    #[test]
    fn test_parse_kline_rejects_short_entries() {
        assert!(parse_kline_array("BTCUSDT", &json!([1, "2", "3"])).is_err());
        assert!(parse_kline_array("BTCUSDT", &json!({"not": "array"})).is_err());
    }

    #[test]
    fn test_parse_kline_accepts_numeric_fields() {
        let raw = json!([
            1700000000000i64,
            37000.1,
            37100.0,
            36900.5,
            37050.2,
            123.45,
            1700000059999i64
        ]);
        let (candle, _) = parse_kline_array("BTCUSDT", &raw).unwrap();
        assert_eq!(candle.high, 37100.0);
    }
}
