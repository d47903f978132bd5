pub mod candle_series;
pub mod history_cache;
pub mod kline_stream;

// Re-export the core types for convenient access (e.g. `use crate::market_data::Candle`).
pub use candle_series::{Candle, CandleSeries, Direction, KlineUpdate, MergeOutcome, PriceLine, SharedSeries};
pub use history_cache::{is_stale, CacheEntry, CandleKey, HistoryCache, HistoryFetcher};
pub use kline_stream::{Connector, FeedStatus, StreamConfig, StreamFeed, WsConnector};
