//! Live Binance candle ingestion: REST backfill, a bounded history cache and a
//! single WebSocket kline subscription merged into one ordered OHLCV series.

pub mod binance;
pub mod error;
pub mod ingestion;
pub mod market_data;
pub mod runtime_config;
pub mod types;

pub use error::FeedError;
pub use ingestion::IngestionFacade;
pub use market_data::{Candle, CandleSeries, SharedSeries};
pub use runtime_config::FeedConfig;
pub use types::{Interval, SubscriptionTarget};
