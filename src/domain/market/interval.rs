use anyhow::Result;
use chrono::Duration;
use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;

/// Candle period. The string form matches the Binance kline codes
/// ("1m", "4h", "1M", ...), which the rest of the codebase treats as the
/// canonical spelling.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1s")]
    OneSecond,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "3m")]
    ThreeMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "2h")]
    TwoHours,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "6h")]
    SixHours,
    #[serde(rename = "8h")]
    EightHours,
    #[serde(rename = "12h")]
    TwelveHours,
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "3d")]
    ThreeDays,
    #[serde(rename = "1w")]
    OneWeek,
    #[serde(rename = "1M")]
    OneMonth,
}

/// Unit component of a bulk-download range request.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Timespan {
    Second,
    Minute,
    Hour,
    Day,
    Week,
    Month,
}

impl Interval {
    pub const ALL: [Interval; 16] = [
        Interval::OneSecond,
        Interval::OneMinute,
        Interval::ThreeMinutes,
        Interval::FiveMinutes,
        Interval::FifteenMinutes,
        Interval::ThirtyMinutes,
        Interval::OneHour,
        Interval::TwoHours,
        Interval::FourHours,
        Interval::SixHours,
        Interval::EightHours,
        Interval::TwelveHours,
        Interval::OneDay,
        Interval::ThreeDays,
        Interval::OneWeek,
        Interval::OneMonth,
    ];

    pub fn as_str(self) -> &'static str {
        match self {
            Interval::OneSecond => "1s",
            Interval::OneMinute => "1m",
            Interval::ThreeMinutes => "3m",
            Interval::FiveMinutes => "5m",
            Interval::FifteenMinutes => "15m",
            Interval::ThirtyMinutes => "30m",
            Interval::OneHour => "1h",
            Interval::TwoHours => "2h",
            Interval::FourHours => "4h",
            Interval::SixHours => "6h",
            Interval::EightHours => "8h",
            Interval::TwelveHours => "12h",
            Interval::OneDay => "1d",
            Interval::ThreeDays => "3d",
            Interval::OneWeek => "1w",
            Interval::OneMonth => "1M",
        }
    }

    /// Nominal wall-clock length of one period. A month counts as 30 days;
    /// callers that compare against it (gap tolerance) absorb the
    /// approximation through their multiplier.
    pub fn duration(self) -> Duration {
        match self {
            Interval::OneSecond => Duration::seconds(1),
            Interval::OneMinute => Duration::minutes(1),
            Interval::ThreeMinutes => Duration::minutes(3),
            Interval::FiveMinutes => Duration::minutes(5),
            Interval::FifteenMinutes => Duration::minutes(15),
            Interval::ThirtyMinutes => Duration::minutes(30),
            Interval::OneHour => Duration::hours(1),
            Interval::TwoHours => Duration::hours(2),
            Interval::FourHours => Duration::hours(4),
            Interval::SixHours => Duration::hours(6),
            Interval::EightHours => Duration::hours(8),
            Interval::TwelveHours => Duration::hours(12),
            Interval::OneDay => Duration::days(1),
            Interval::ThreeDays => Duration::days(3),
            Interval::OneWeek => Duration::weeks(1),
            Interval::OneMonth => Duration::days(30),
        }
    }

    pub fn duration_ms(self) -> i64 {
        self.duration().num_milliseconds()
    }

    /// Decompose into the `(multiplier, timespan)` pair used by range-based
    /// bulk-download endpoints.
    pub fn to_range(self) -> (u32, Timespan) {
        match self {
            Interval::OneSecond => (1, Timespan::Second),
            Interval::OneMinute => (1, Timespan::Minute),
            Interval::ThreeMinutes => (3, Timespan::Minute),
            Interval::FiveMinutes => (5, Timespan::Minute),
            Interval::FifteenMinutes => (15, Timespan::Minute),
            Interval::ThirtyMinutes => (30, Timespan::Minute),
            Interval::OneHour => (1, Timespan::Hour),
            Interval::TwoHours => (2, Timespan::Hour),
            Interval::FourHours => (4, Timespan::Hour),
            Interval::SixHours => (6, Timespan::Hour),
            Interval::EightHours => (8, Timespan::Hour),
            Interval::TwelveHours => (12, Timespan::Hour),
            Interval::OneDay => (1, Timespan::Day),
            Interval::ThreeDays => (3, Timespan::Day),
            Interval::OneWeek => (1, Timespan::Week),
            Interval::OneMonth => (1, Timespan::Month),
        }
    }

    /// Inverse of [`Interval::to_range`]. Returns `None` for pairs that do
    /// not correspond to a supported candle period (e.g. `7 x minute`).
    pub fn from_range(multiplier: u32, timespan: Timespan) -> Option<Interval> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.to_range() == (multiplier, timespan))
    }
}

impl Default for Interval {
    fn default() -> Self {
        Interval::OneMinute
    }
}

impl fmt::Display for Interval {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for Interval {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Interval::ALL
            .iter()
            .copied()
            .find(|i| i.as_str() == s)
            .ok_or_else(|| anyhow::anyhow!("unknown interval: '{}'", s))
    }
}

impl fmt::Display for Timespan {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s = match self {
            Timespan::Second => "second",
            Timespan::Minute => "minute",
            Timespan::Hour => "hour",
            Timespan::Day => "day",
            Timespan::Week => "week",
            Timespan::Month => "month",
        };
        write!(f, "{}", s)
    }
}
