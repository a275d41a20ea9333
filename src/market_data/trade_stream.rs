// =============================================================================
// Trade Stream — Bybit v5 public trade WebSocket feed
// =============================================================================
//
// Delivers trades into a bounded channel with a single consumer (the
// aggregation task), which is what keeps ingestion strictly in arrival
// order even though the socket is read on its own task.
// =============================================================================

use anyhow::{Context, Result};
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;
use tokio_tungstenite::connect_async;
use tokio_tungstenite::tungstenite::Message;
use tracing::{debug, error, info, warn};

use crate::types::Trade;

const WS_URL: &str = "wss://stream.bybit.com/v5/public/spot";

/// Bybit drops idle connections; ping every 20 s keeps the feed alive.
const PING_INTERVAL_SECS: u64 = 20;

/// Connect to the Bybit public-spot WebSocket, subscribe to
/// `publicTrade.<SYMBOL>`, and forward every parsed trade into `tx`.
///
/// Runs until the stream disconnects or an error occurs, then returns so
/// that the caller (main.rs) can handle reconnection. Returns cleanly when
/// the receiving side of the channel is gone (shutdown).
pub async fn run_trade_stream(symbol: &str, tx: &mpsc::Sender<Trade>) -> Result<()> {
    info!(url = WS_URL, symbol = %symbol, "connecting to trade WebSocket");

    let (ws_stream, _response) = connect_async(WS_URL)
        .await
        .context("failed to connect to trade WebSocket")?;

    let (mut write, mut read) = ws_stream.split();

    let subscribe = serde_json::json!({
        "op": "subscribe",
        "args": [format!("publicTrade.{symbol}")],
    });
    write
        .send(Message::Text(subscribe.to_string()))
        .await
        .context("failed to send subscribe frame")?;
    info!(symbol = %symbol, "subscribed to public trade stream");

    let mut ping = tokio::time::interval(tokio::time::Duration::from_secs(PING_INTERVAL_SECS));
    ping.reset(); // first tick should not fire immediately after subscribe

    loop {
        tokio::select! {
            _ = ping.tick() => {
                write
                    .send(Message::Text(r#"{"op":"ping"}"#.to_string()))
                    .await
                    .context("failed to send ping frame")?;
            }
            msg = read.next() => match msg {
                Some(Ok(Message::Text(text))) => {
                    match parse_public_trade(&text) {
                        Ok(trades) => {
                            for trade in trades {
                                if tx.send(trade).await.is_err() {
                                    // Consumer gone — shutdown in progress.
                                    info!(symbol = %symbol, "trade channel closed — stopping stream");
                                    return Ok(());
                                }
                            }
                        }
                        Err(e) => {
                            warn!(error = %e, "failed to parse trade message");
                        }
                    }
                }
                Some(Ok(_)) => {
                    // Ping / Pong / Binary / Close frames — tungstenite
                    // answers protocol pings automatically.
                }
                Some(Err(e)) => {
                    error!(symbol = %symbol, error = %e, "trade WebSocket read error");
                    return Err(e.into());
                }
                None => {
                    warn!(symbol = %symbol, "trade WebSocket stream ended");
                    return Ok(());
                }
            }
        }
    }
}

/// Parse a Bybit `publicTrade` frame into trades.
///
/// Expected shape:
/// ```json
/// {
///   "topic": "publicTrade.BTCUSDT",
///   "data": [ { "T": 1700000000123, "p": "37000.5", "v": "0.012", "S": "Buy" } ]
/// }
/// ```
///
/// Operational frames (subscribe acks, pong replies) carry an `op` field and
/// no `topic`; they yield an empty list.
fn parse_public_trade(text: &str) -> Result<Vec<Trade>> {
    let root: serde_json::Value =
        serde_json::from_str(text).context("failed to parse trade JSON")?;

    let topic = match root["topic"].as_str() {
        Some(t) => t,
        None => {
            debug!(frame = %text, "non-topic frame ignored");
            return Ok(Vec::new());
        }
    };
    if !topic.starts_with("publicTrade") {
        return Ok(Vec::new());
    }

    let entries = root["data"]
        .as_array()
        .context("publicTrade frame missing data array")?;

    let mut trades = Vec::with_capacity(entries.len());
    for entry in entries {
        let timestamp = entry["T"].as_i64().context("missing field T")?;
        let price: f64 = entry["p"]
            .as_str()
            .context("missing field p")?
            .parse()
            .context("failed to parse price")?;
        let volume: f64 = entry["v"]
            .as_str()
            .context("missing field v")?
            .parse()
            .context("failed to parse volume")?;

        trades.push(Trade {
            timestamp,
            price,
            volume,
        });
    }

    Ok(trades)
}
