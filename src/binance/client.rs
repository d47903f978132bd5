// =============================================================================
// Binance REST client — public kline history
// =============================================================================
//
// Only the unsigned `/api/v3/klines` endpoint is used, so no API key is
// attached. Each call is a single bounded request; nothing is retained
// between calls.
// =============================================================================

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use tracing::{debug, instrument};

use crate::error::FeedError;
use crate::market_data::candle_series::parse_string_f64;
use crate::market_data::{Candle, CandleSeries, HistoryFetcher};
use crate::runtime_config::FeedConfig;
use crate::types::Interval;

/// Binance REST client for historical klines.
#[derive(Debug, Clone)]
pub struct BinanceClient {
    base_url: String,
    limit: u32,
    client: reqwest::Client,
}

impl BinanceClient {
    /// Create a new `BinanceClient`.
    ///
    /// # Arguments
    /// * `base_url` — REST root, e.g. `https://api.binance.com`.
    /// * `limit`    — number of most recent candles requested per fetch.
    /// * `timeout`  — per-request timeout.
    pub fn new(base_url: impl Into<String>, limit: u32, timeout: Duration) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(timeout)
            .build()
            .context("failed to build reqwest client")?;

        let base_url = base_url.into().trim_end_matches('/').to_string();
        debug!(base_url = %base_url, limit, "BinanceClient initialised");

        Ok(Self {
            base_url,
            limit,
            client,
        })
    }

    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        Self::new(
            config.rest_base_url.clone(),
            config.history_limit,
            Duration::from_secs(config.request_timeout_secs),
        )
    }

    /// Full klines URL for a (symbol, interval) pair.
    fn klines_url(&self, symbol: &str, interval: Interval) -> String {
        format!(
            "{}/api/v3/klines?symbol={}&interval={}&limit={}",
            self.base_url,
            symbol.trim().to_uppercase(),
            interval,
            self.limit
        )
    }

    /// GET /api/v3/klines (public — no signature required).
    #[instrument(skip(self), name = "binance::get_klines")]
    pub async fn get_klines(&self, symbol: &str, interval: Interval) -> Result<Vec<Candle>> {
        let url = self.klines_url(symbol, interval);

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /api/v3/klines request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse klines response")?;

        if !status.is_success() {
            anyhow::bail!("Binance GET /api/v3/klines returned {}: {}", status, body);
        }

        let candles = parse_klines(&body)?;
        debug!(symbol, %interval, count = candles.len(), "klines fetched");
        Ok(candles)
    }
}

#[async_trait]
impl HistoryFetcher for BinanceClient {
    async fn fetch(&self, symbol: &str, interval: Interval) -> Result<CandleSeries, FeedError> {
        let candles = self
            .get_klines(symbol, interval)
            .await
            .map_err(FeedError::fetch)?;
        Ok(CandleSeries::from_candles(candles))
    }
}

/// Parse Binance's array-of-arrays klines payload.
///
/// Array indices:
///   [0] openTime, [1] open, [2] high, [3] low, [4] close, [5] volume,
///   [6..] closeTime, quote volume, trade count, ... (ignored)
pub fn parse_klines(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let raw = body.as_array().context("klines response is not an array")?;
    if raw.is_empty() {
        anyhow::bail!("klines response is empty");
    }

    let mut candles = Vec::with_capacity(raw.len());
    for (i, entry) in raw.iter().enumerate() {
        let arr = entry
            .as_array()
            .with_context(|| format!("kline entry {i} is not an array"))?;

        if arr.len() < 6 {
            anyhow::bail!("kline entry {i} has only {} elements", arr.len());
        }

        let open_time = arr[0]
            .as_i64()
            .with_context(|| format!("kline entry {i} has no integer open time"))?;
        let open = parse_string_f64(&arr[1], "open")?;
        let high = parse_string_f64(&arr[2], "high")?;
        let low = parse_string_f64(&arr[3], "low")?;
        let close = parse_string_f64(&arr[4], "close")?;
        let volume = parse_string_f64(&arr[5], "volume")?;

        candles.push(Candle::new(open_time, open, high, low, close, volume));
    }

    Ok(candles)
}
