// =============================================================================
// Feed Configuration — endpoints, limits and timeouts
// =============================================================================
//
// Loaded from a JSON file. Every field carries `#[serde(default)]` so that a
// partial (or empty) file still deserialises, and a few fields can be
// overridden from the environment.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::types::Interval;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_rest_base_url() -> String {
    "https://api.binance.com".to_string()
}

fn default_ws_url() -> String {
    "wss://stream.binance.com/stream".to_string()
}

fn default_history_limit() -> u32 {
    1000
}

fn default_cache_capacity() -> usize {
    5
}

fn default_connect_timeout_ms() -> u64 {
    10_000
}

fn default_ready_poll_ms() -> u64 {
    100
}

fn default_request_timeout_secs() -> u64 {
    10
}

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_interval() -> Interval {
    Interval::OneMinute
}

fn default_refresh_ms() -> u64 {
    400
}

// =============================================================================
// FeedConfig
// =============================================================================

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FeedConfig {
    // --- Endpoints -----------------------------------------------------------

    /// REST root for historical klines.
    #[serde(default = "default_rest_base_url")]
    pub rest_base_url: String,

    /// Combined-stream WebSocket endpoint.
    #[serde(default = "default_ws_url")]
    pub ws_url: String,

    // --- History ------------------------------------------------------------

    /// Candles requested per backfill.
    #[serde(default = "default_history_limit")]
    pub history_limit: u32,

    /// Maximum number of (symbol, interval) backfills kept in memory.
    #[serde(default = "default_cache_capacity")]
    pub cache_capacity: usize,

    #[serde(default = "default_request_timeout_secs")]
    pub request_timeout_secs: u64,

    // --- Stream -------------------------------------------------------------

    /// Upper bound on waiting for a new connection to become ready.
    #[serde(default = "default_connect_timeout_ms")]
    pub connect_timeout_ms: u64,

    /// Readiness poll interval.
    #[serde(default = "default_ready_poll_ms")]
    pub ready_poll_ms: u64,

    // --- Startup target -----------------------------------------------------

    #[serde(default = "default_symbol")]
    pub symbol: String,

    #[serde(default = "default_interval")]
    pub interval: Interval,

    /// How often the binary checks the live series for changes.
    #[serde(default = "default_refresh_ms")]
    pub refresh_ms: u64,
}

impl Default for FeedConfig {
    fn default() -> Self {
        Self {
            rest_base_url: default_rest_base_url(),
            ws_url: default_ws_url(),
            history_limit: default_history_limit(),
            cache_capacity: default_cache_capacity(),
            request_timeout_secs: default_request_timeout_secs(),
            connect_timeout_ms: default_connect_timeout_ms(),
            ready_poll_ms: default_ready_poll_ms(),
            symbol: default_symbol(),
            interval: default_interval(),
            refresh_ms: default_refresh_ms(),
        }
    }
}

impl FeedConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read feed config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse feed config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            interval = %config.interval,
            "feed config loaded"
        );

        Ok(config)
    }

    /// Apply `FEED_SYMBOL`, `FEED_INTERVAL`, `FEED_REST_URL` and `FEED_WS_URL`.
    pub fn apply_env(&mut self) {
        self.apply_overrides(|key| std::env::var(key).ok());
    }

    fn apply_overrides(&mut self, lookup: impl Fn(&str) -> Option<String>) {
        if let Some(symbol) = lookup("FEED_SYMBOL").filter(|s| !s.trim().is_empty()) {
            self.symbol = symbol.trim().to_uppercase();
        }
        if let Some(raw) = lookup("FEED_INTERVAL") {
            match raw.parse::<Interval>() {
                Ok(interval) => self.interval = interval,
                Err(e) => warn!(value = %raw, error = %e, "ignoring FEED_INTERVAL"),
            }
        }
        if let Some(url) = lookup("FEED_REST_URL") {
            self.rest_base_url = url;
        }
        if let Some(url) = lookup("FEED_WS_URL") {
            self.ws_url = url;
        }
    }
}
