// =============================================================================
// Ingestion Facade — the single entry point for the presentation layer
// =============================================================================
//
// `switch_to` primes a series from the history cache, points the stream feed
// at it and hands back the live series. The feed is the only place the live
// series is recorded, so what `live_series` returns is always what merges
// land in. The returned reference keeps being
// mutated in place by the feed; read it through its lock, never cache a copy
// and expect it to move.
// =============================================================================

use anyhow::Result;
use tokio::sync::watch;
use tracing::{info, instrument};

use crate::binance::BinanceClient;
use crate::error::FeedError;
use crate::market_data::{
    Connector, FeedStatus, HistoryCache, HistoryFetcher, PriceLine, SharedSeries, StreamConfig,
    StreamFeed, WsConnector,
};
use crate::runtime_config::FeedConfig;
use crate::types::{Interval, SubscriptionTarget};

pub struct IngestionFacade<F, C> {
    cache: HistoryCache<F>,
    feed: StreamFeed<C>,
}

impl IngestionFacade<BinanceClient, WsConnector> {
    /// Binance REST history plus the tokio-tungstenite stream.
    pub fn from_config(config: &FeedConfig) -> Result<Self> {
        let client = BinanceClient::from_config(config)?;
        Ok(Self::new(
            client,
            WsConnector,
            config.cache_capacity,
            StreamConfig::from_config(config),
        ))
    }
}

impl<F: HistoryFetcher, C: Connector> IngestionFacade<F, C> {
    pub fn new(fetcher: F, connector: C, cache_capacity: usize, stream: StreamConfig) -> Self {
        Self {
            cache: HistoryCache::new(fetcher, cache_capacity),
            feed: StreamFeed::new(connector, stream),
        }
    }

    /// Make `(symbol, interval)` the live series and return it.
    ///
    /// The backfill becomes the live series even when the stream then fails
    /// to connect, so a caller can still render history while it retries.
    #[instrument(skip(self), name = "ingestion::switch_to")]
    pub async fn switch_to(&self, symbol: &str, interval: Interval) -> Result<SharedSeries, FeedError> {
        let target = SubscriptionTarget::new(symbol, interval)?;

        let series = self.cache.get(&target.symbol, target.interval).await?;
        self.feed.reconnect(target.clone(), series.clone()).await?;
        info!(subscription = %target, candles = series.read().len(), "live series ready");
        Ok(series)
    }

    /// [`switch_to`](Self::switch_to) with the interval in exchange notation.
    pub async fn switch_to_named(&self, symbol: &str, interval: &str) -> Result<SharedSeries, FeedError> {
        let interval = interval.parse::<Interval>()?;
        self.switch_to(symbol, interval).await
    }

    /// The series most recently returned by `switch_to`, if any.
    pub fn live_series(&self) -> Option<SharedSeries> {
        self.feed.series()
    }

    /// Receiver whose value changes every time the live series is mutated or
    /// replaced.
    pub fn subscribe(&self) -> watch::Receiver<u64> {
        self.feed.changes()
    }

    pub fn price_line(&self) -> Option<PriceLine> {
        self.live_series()?.read().price_line()
    }

    pub fn status(&self) -> FeedStatus {
        self.feed.status()
    }

    pub fn active_target(&self) -> Option<SubscriptionTarget> {
        self.feed.active_target()
    }

    pub fn cached_len(&self) -> usize {
        self.cache.len()
    }

    pub fn shutdown(&self) {
        self.feed.close();
    }
}
