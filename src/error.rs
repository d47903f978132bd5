use thiserror::Error;

/// All errors surfaced by the ingestion core.
///
/// None of these are retried internally; the caller decides whether to call
/// `switch_to` again.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FeedError {
    #[error("history fetch failed: {0}")]
    Fetch(String),

    #[error("stream connection not ready within {timeout_ms} ms")]
    ConnectTimeout { timeout_ms: u64 },

    #[error("failed to open stream connection: {0}")]
    Connect(String),

    #[error("failed to send subscribe request: {0}")]
    Subscribe(String),

    #[error("malformed stream message: {0}")]
    MalformedMessage(String),

    #[error("merge attempted against an empty candle series")]
    EmptySeries,

    #[error("invalid subscription target: {0}")]
    InvalidTarget(String),
}

impl FeedError {
    /// Build a `Fetch` error from an `anyhow` chain, keeping every context
    /// layer in the message.
    pub fn fetch(err: anyhow::Error) -> Self {
        Self::Fetch(format!("{err:#}"))
    }
}
