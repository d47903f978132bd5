// =============================================================================
// Candle Feed — Main Entry Point
// =============================================================================
//
// Switches to the configured (symbol, interval), then plays the part of the
// chart's refresh timer: every `refresh_ms` it checks the change counter and
// logs the live candle when something moved.
// =============================================================================

use std::time::Duration;

use anyhow::Context;
use tracing::{error, info, warn};
use tracing_subscriber::EnvFilter;

use candle_feed::{FeedConfig, IngestionFacade};

const CONFIG_PATH: &str = "feed_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = FeedConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        FeedConfig::default()
    });
    config.apply_env();

    info!(
        symbol = %config.symbol,
        interval = %config.interval,
        ws_url = %config.ws_url,
        "Candle feed starting"
    );

    // ── 2. Facade ────────────────────────────────────────────────────────
    let facade = IngestionFacade::from_config(&config).context("failed to build ingestion facade")?;

    let series = facade
        .switch_to(&config.symbol, config.interval)
        .await
        .with_context(|| format!("failed to switch to {} {}", config.symbol, config.interval))?;
    info!(candles = series.read().len(), "Backfill loaded, streaming");

    // ── 3. Refresh loop ──────────────────────────────────────────────────
    let mut changes = facade.subscribe();
    let mut refresh = tokio::time::interval(Duration::from_millis(config.refresh_ms.max(1)));
    let ctrl_c = tokio::signal::ctrl_c();
    tokio::pin!(ctrl_c);

    loop {
        tokio::select! {
            _ = refresh.tick() => {
                if !changes.has_changed().unwrap_or(false) {
                    continue;
                }
                changes.borrow_and_update();

                let Some(live) = facade.live_series() else { continue };
                let guard = live.read();
                if let Some(last) = guard.last() {
                    info!(
                        open_time = last.open_time,
                        open = last.open,
                        high = last.high,
                        low = last.low,
                        close = last.close,
                        volume = last.volume,
                        candles = guard.len(),
                        direction = ?guard.price_line().map(|p| p.direction),
                        "live candle"
                    );
                }
            }
            res = &mut ctrl_c => {
                if let Err(e) = res {
                    error!(error = %e, "Failed to listen for Ctrl+C");
                }
                break;
            }
        }
    }

    // ── 4. Shutdown ──────────────────────────────────────────────────────
    warn!("Shutdown signal received — closing stream");
    facade.shutdown();
    info!("Candle feed shut down complete.");
    Ok(())
}
