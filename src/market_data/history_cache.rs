use async_trait::async_trait;
use chrono::{DateTime, Utc};
use indexmap::IndexMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use super::candle_series::{CandleSeries, SharedSeries};
use crate::error::FeedError;
use crate::types::{normalize_symbol, Interval};

// ---------------------------------------------------------------------------
// Fetcher seam
// ---------------------------------------------------------------------------

/// Source of historical backfill: one bounded request for the most recent
/// candles of a (symbol, interval) pair.
#[async_trait]
pub trait HistoryFetcher: Send + Sync {
    async fn fetch(&self, symbol: &str, interval: Interval) -> Result<CandleSeries, FeedError>;
}

// ---------------------------------------------------------------------------
// Keys and entries
// ---------------------------------------------------------------------------

/// Composite key that identifies a unique candle series.
#[derive(Debug, Clone, Hash, Eq, PartialEq, Serialize, Deserialize)]
pub struct CandleKey {
    pub symbol: String,
    pub interval: Interval,
}

impl CandleKey {
    pub fn new(symbol: &str, interval: Interval) -> Self {
        Self {
            symbol: normalize_symbol(symbol),
            interval,
        }
    }
}

impl std::fmt::Display for CandleKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}@{}", self.symbol, self.interval)
    }
}

#[derive(Debug, Clone)]
pub struct CacheEntry {
    pub series: SharedSeries,
    pub fetched_at: DateTime<Utc>,
}

/// A snapshot is stale once the wall clock reaches the extrapolated start of
/// the next period, `t1 + (t1 - t0)`. Fewer than two candles is always stale.
pub fn is_stale(series: &CandleSeries, now_ms: i64) -> bool {
    match series.last_two_open_times() {
        Some((t0, t1)) => now_ms >= t1 + (t1 - t0),
        None => true,
    }
}

// ---------------------------------------------------------------------------
// HistoryCache
// ---------------------------------------------------------------------------

/// Bounded LRU cache of backfill snapshots.
///
/// Recency is the IndexMap order: index 0 is the least recently used entry.
/// The map lock is never held across a fetch.
pub struct HistoryCache<F> {
    fetcher: F,
    entries: Mutex<IndexMap<CandleKey, CacheEntry>>,
    capacity: usize,
}

impl<F: HistoryFetcher> HistoryCache<F> {
    pub fn new(fetcher: F, capacity: usize) -> Self {
        let capacity = capacity.max(1);
        Self {
            fetcher,
            entries: Mutex::new(IndexMap::with_capacity(capacity + 1)),
            capacity,
        }
    }

    /// Backfill for `(symbol, interval)` against the current wall clock.
    pub async fn get(&self, symbol: &str, interval: Interval) -> Result<SharedSeries, FeedError> {
        self.get_at(symbol, interval, Utc::now().timestamp_millis()).await
    }

    /// Backfill for `(symbol, interval)`, judging staleness at `now_ms`.
    pub async fn get_at(
        &self,
        symbol: &str,
        interval: Interval,
        now_ms: i64,
    ) -> Result<SharedSeries, FeedError> {
        let key = CandleKey::new(symbol, interval);

        let cached = {
            let mut entries = self.entries.lock();
            match entries.shift_remove(&key) {
                Some(entry) => {
                    let stale = is_stale(&entry.series.read(), now_ms);
                    // Re-insert at the back: most recently used.
                    let series = entry.series.clone();
                    entries.insert(key.clone(), entry);
                    (!stale).then_some(series)
                }
                None => None,
            }
        };

        if let Some(series) = cached {
            debug!(key = %key, "history cache hit");
            return Ok(series);
        }

        info!(key = %key, "loading price history");
        let series = self
            .fetcher
            .fetch(&key.symbol, interval)
            .await?
            .into_shared();

        self.insert(key, series.clone());
        Ok(series)
    }

    fn insert(&self, key: CandleKey, series: SharedSeries) {
        let mut entries = self.entries.lock();
        entries.shift_remove(&key);
        entries.insert(
            key,
            CacheEntry {
                series,
                fetched_at: Utc::now(),
            },
        );
        while entries.len() > self.capacity {
            if let Some((evicted, _)) = entries.shift_remove_index(0) {
                debug!(key = %evicted, "evicted least recently used history");
            }
        }
    }

    pub fn len(&self) -> usize {
        self.entries.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.lock().is_empty()
    }

    pub fn contains(&self, symbol: &str, interval: Interval) -> bool {
        self.entries
            .lock()
            .contains_key(&CandleKey::new(symbol, interval))
    }

    /// When the entry for `(symbol, interval)` was last fetched.
    pub fn fetched_at(&self, symbol: &str, interval: Interval) -> Option<DateTime<Utc>> {
        self.entries
            .lock()
            .get(&CandleKey::new(symbol, interval))
            .map(|e| e.fetched_at)
    }

    /// Keys from least to most recently used.
    pub fn keys(&self) -> Vec<CandleKey> {
        self.entries.lock().keys().cloned().collect()
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
