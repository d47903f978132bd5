use std::sync::Arc;

use anyhow::{Context, Result};
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use crate::error::FeedError;

// ---------------------------------------------------------------------------
// Data types
// ---------------------------------------------------------------------------

/// A single OHLCV candle keyed by its period open time (epoch ms).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

impl Candle {
    /// Build a candle, widening high/low so that
    /// `high >= max(open, close)` and `low <= min(open, close)`.
    pub fn new(open_time: i64, open: f64, high: f64, low: f64, close: f64, volume: f64) -> Self {
        Self {
            open_time,
            open,
            high: high.max(open).max(close),
            low: low.min(open).min(close),
            close,
            volume,
        }
    }
}

/// The payload of one streamed kline, as extracted from `data.k`.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct KlineUpdate {
    pub open_time: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
}

/// What a merge did to the series.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MergeOutcome {
    /// The currently open candle was updated in place.
    Updated,
    /// A new period started and a candle was appended.
    Appended,
}

/// Direction of the last close relative to the previous candle's close.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Direction {
    Up,
    Down,
    Flat,
}

/// Data for the "last price" overlay line.
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct PriceLine {
    pub last_close: f64,
    pub direction: Direction,
}

/// The series handed between the feed's reader task and consumers.
pub type SharedSeries = Arc<RwLock<CandleSeries>>;

// ---------------------------------------------------------------------------
// CandleSeries
// ---------------------------------------------------------------------------

/// Candles ordered strictly by `open_time`, no duplicates.
///
/// The only mutation path after construction is [`CandleSeries::merge_update`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CandleSeries {
    candles: Vec<Candle>,
}

impl CandleSeries {
    /// Build a series from unordered rows. Rows are sorted by open time; when
    /// two rows share an open time the later row wins.
    pub fn from_candles(mut candles: Vec<Candle>) -> Self {
        // Stable sort keeps input order among equal keys, so the last of each
        // run is the later row.
        candles.sort_by_key(|c| c.open_time);
        let mut deduped: Vec<Candle> = Vec::with_capacity(candles.len());
        for candle in candles {
            match deduped.last_mut() {
                Some(last) if last.open_time == candle.open_time => *last = candle,
                _ => deduped.push(candle),
            }
        }
        Self { candles: deduped }
    }

    /// Wrap into the shared, lock-guarded form.
    pub fn into_shared(self) -> SharedSeries {
        Arc::new(RwLock::new(self))
    }

    /// Fold one streamed kline into the series.
    ///
    /// * `u.open_time <= last.open_time`: same period. Close and volume are
    ///   last-write-wins (volume is the period running total), high/low are
    ///   widened. Applying the same update twice is a no-op the second time.
    /// * `u.open_time > last.open_time`: a new period, appended as-is.
    pub fn merge_update(&mut self, u: &KlineUpdate) -> Result<MergeOutcome, FeedError> {
        let last = self.candles.last_mut().ok_or(FeedError::EmptySeries)?;

        if u.open_time <= last.open_time {
            last.close = u.close;
            last.high = last.high.max(u.high).max(u.close);
            last.low = last.low.min(u.low).min(u.close);
            last.volume = u.volume;
            Ok(MergeOutcome::Updated)
        } else {
            self.candles.push(Candle::new(
                u.open_time,
                u.open,
                u.high,
                u.low,
                u.close,
                u.volume,
            ));
            Ok(MergeOutcome::Appended)
        }
    }

    pub fn len(&self) -> usize {
        self.candles.len()
    }

    pub fn is_empty(&self) -> bool {
        self.candles.is_empty()
    }

    pub fn candles(&self) -> &[Candle] {
        &self.candles
    }

    pub fn first(&self) -> Option<&Candle> {
        self.candles.first()
    }

    pub fn last(&self) -> Option<&Candle> {
        self.candles.last()
    }

    /// Owned copy of the candles, for consumers that render outside the lock.
    pub fn snapshot(&self) -> Vec<Candle> {
        self.candles.clone()
    }

    /// Open times of the second-to-last and last candles.
    pub fn last_two_open_times(&self) -> Option<(i64, i64)> {
        match self.candles.as_slice() {
            [.., prev, last] => Some((prev.open_time, last.open_time)),
            _ => None,
        }
    }

    /// Last close and its direction against the previous close.
    pub fn price_line(&self) -> Option<PriceLine> {
        let last = self.candles.last()?;
        let direction = match self.candles.len().checked_sub(2).map(|i| &self.candles[i]) {
            Some(prev) if last.close > prev.close => Direction::Up,
            Some(prev) if last.close < prev.close => Direction::Down,
            _ => Direction::Flat,
        };
        Some(PriceLine {
            last_close: last.close,
            direction,
        })
    }
}

/// Binance sends prices and volumes as JSON strings; accept plain numbers too.
pub(crate) fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
