// =============================================================================
// Borealis Candle Recorder — Main Entry Point
// =============================================================================
//
// Fetches a historical 1-minute candle baseline, then aggregates the live
// public trade stream into candles, merging both into one dataset that is
// flushed to CSV every 10 finalized candles and once at shutdown.
// =============================================================================

// ── Module declarations ──────────────────────────────────────────────────────
mod bybit;
mod market_data;
mod persistence;
mod runtime_config;
mod types;

use std::sync::Arc;

use tokio::sync::mpsc;
use tracing::{debug, error, info, warn};
use tracing_subscriber::EnvFilter;

use crate::bybit::BybitClient;
use crate::market_data::{CandleAggregator, DatasetStore};
use crate::persistence::{CsvPersister, PersistenceScheduler};
use crate::runtime_config::RecorderConfig;
use crate::types::Trade;

const CONFIG_PATH: &str = "recorder_config.json";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // ── 1. Environment & config ──────────────────────────────────────────
    let _ = dotenv::dotenv();

    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new("info")),
        )
        .init();

    let mut config = RecorderConfig::load(CONFIG_PATH).unwrap_or_else(|e| {
        warn!(error = %e, "Failed to load config, using defaults");
        RecorderConfig::default()
    });
    config.apply_env_overrides();

    info!(
        symbol = %config.symbol,
        data_dir = %config.data_dir,
        history_hours = config.history_hours,
        "Borealis candle recorder starting"
    );

    // ── 2. Historical baseline ───────────────────────────────────────────
    let client = BybitClient::new();
    let seed = client
        .get_kline(&config.symbol, &config.kline_interval, config.history_hours)
        .await?;

    // ── 3. Core pipeline ─────────────────────────────────────────────────
    let store = Arc::new(DatasetStore::new());
    let accepted = store.seed(seed)?;
    info!(candles = accepted, "dataset seeded with historical baseline");

    let persister = CsvPersister::new(&config.data_dir, &config.symbol)?;
    let scheduler = PersistenceScheduler::new(store.clone(), Box::new(persister), config.flush_every);
    let mut aggregator = CandleAggregator::new(store.clone(), scheduler);
    let view = aggregator.view();

    // ── 4. Trade feed & aggregation tasks ────────────────────────────────
    let (tx, mut rx) = mpsc::channel::<Trade>(config.trade_channel_capacity);

    let feed_symbol = config.symbol.clone();
    let feed = tokio::spawn(async move {
        loop {
            if let Err(e) =
                market_data::trade_stream::run_trade_stream(&feed_symbol, &tx).await
            {
                error!(symbol = %feed_symbol, error = %e, "Trade stream error — reconnecting in 5s");
            }
            if tx.is_closed() {
                return;
            }
            tokio::time::sleep(tokio::time::Duration::from_secs(5)).await;
        }
    });

    // Single consumer: the only caller of `ingest`, so trades are processed
    // strictly in arrival order. When the channel drains after shutdown it
    // runs the ordered teardown: finalize, then the unconditional flush.
    let consumer = tokio::spawn(async move {
        while let Some(trade) = rx.recv().await {
            aggregator.ingest(trade);
        }
        info!("trade channel drained — finalizing");
        aggregator.finalize_current();
        aggregator.on_stop();
    });

    // ── 5. Status loop ───────────────────────────────────────────────────
    let status_store = store.clone();
    let status_view = view.clone();
    let status_interval = config.status_interval_secs;
    tokio::spawn(async move {
        let mut interval =
            tokio::time::interval(tokio::time::Duration::from_secs(status_interval.max(1)));
        interval.tick().await; // skip the immediate first tick
        loop {
            interval.tick().await;

            info!(
                candles = status_store.len(),
                latest_close = ?status_store.last_close(),
                dropped_malformed = status_view.dropped_malformed(),
                dropped_out_of_order = status_view.dropped_out_of_order(),
                "recorder status"
            );
            let recent: Vec<f64> = status_store.latest(3).iter().map(|c| c.close).collect();
            debug!(closes = ?recent, "recent candle closes");

            if let Some(draft) = status_view.current_candle_info() {
                info!(
                    timestamp = draft.timestamp,
                    open = draft.open,
                    high = draft.high,
                    low = draft.low,
                    close = draft.close,
                    volume = draft.volume,
                    trades = draft.trade_count,
                    "current candle"
                );
            }
        }
    });

    info!("All subsystems running. Press Ctrl+C to stop.");

    // ── 6. Graceful shutdown ─────────────────────────────────────────────
    tokio::signal::ctrl_c().await?;
    warn!("Shutdown signal received — stopping gracefully");

    // Stop accepting trades: kill the feed so the channel sender is dropped,
    // then let the consumer drain, finalize, and run the final flush.
    feed.abort();
    let _ = feed.await;
    if let Err(e) = consumer.await {
        error!(error = %e, "aggregation task failed during shutdown");
    }

    if let Err(e) = config.save(CONFIG_PATH) {
        error!(error = %e, "Failed to save recorder config on shutdown");
    }

    info!("Borealis candle recorder shut down complete.");
    Ok(())
}
