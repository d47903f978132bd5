// =============================================================================
// Shared types used across the candle feed
// =============================================================================

use std::str::FromStr;

use serde::{Deserialize, Serialize};

use crate::error::FeedError;

/// Kline granularities supported by both the REST and streaming endpoints.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum Interval {
    #[serde(rename = "1d")]
    OneDay,
    #[serde(rename = "4h")]
    FourHours,
    #[serde(rename = "1h")]
    OneHour,
    #[serde(rename = "30m")]
    ThirtyMinutes,
    #[serde(rename = "15m")]
    FifteenMinutes,
    #[serde(rename = "5m")]
    FiveMinutes,
    #[serde(rename = "1m")]
    OneMinute,
    #[serde(rename = "1s")]
    OneSecond,
}

impl Interval {
    /// All intervals, coarsest first (the order a picker would list them).
    pub const ALL: [Interval; 8] = [
        Self::OneDay,
        Self::FourHours,
        Self::OneHour,
        Self::ThirtyMinutes,
        Self::FifteenMinutes,
        Self::FiveMinutes,
        Self::OneMinute,
        Self::OneSecond,
    ];

    /// Exchange notation, e.g. `"15m"`.
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::OneDay => "1d",
            Self::FourHours => "4h",
            Self::OneHour => "1h",
            Self::ThirtyMinutes => "30m",
            Self::FifteenMinutes => "15m",
            Self::FiveMinutes => "5m",
            Self::OneMinute => "1m",
            Self::OneSecond => "1s",
        }
    }
}

impl std::fmt::Display for Interval {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Interval {
    type Err = FeedError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        Self::ALL
            .iter()
            .copied()
            .find(|iv| iv.as_str() == trimmed)
            .ok_or_else(|| FeedError::InvalidTarget(format!("unsupported interval '{trimmed}'")))
    }
}

/// The (symbol, interval) pair the stream is subscribed to.
///
/// The symbol is always stored lowercase, which is what the stream topic
/// expects.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SubscriptionTarget {
    pub symbol: String,
    pub interval: Interval,
}

impl SubscriptionTarget {
    /// Build a target, normalising the symbol. Fails on an empty symbol.
    pub fn new(symbol: &str, interval: Interval) -> Result<Self, FeedError> {
        let symbol = normalize_symbol(symbol);
        if symbol.is_empty() || !symbol.chars().all(|c| c.is_ascii_alphanumeric()) {
            return Err(FeedError::InvalidTarget(format!("invalid symbol '{symbol}'")));
        }
        Ok(Self { symbol, interval })
    }

    /// Stream topic name, e.g. `btcusdt@kline_1m`.
    pub fn topic(&self) -> String {
        format!("{}@kline_{}", self.symbol, self.interval)
    }

    /// The JSON subscribe request for this target.
    pub fn subscribe_message(&self) -> String {
        format!(
            r#"{{"method":"SUBSCRIBE","params":["{}"],"id":1}}"#,
            self.topic()
        )
    }
}

impl std::fmt::Display for SubscriptionTarget {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

pub fn normalize_symbol(symbol: &str) -> String {
    symbol.trim().to_lowercase()
}
