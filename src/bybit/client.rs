// =============================================================================
// Bybit REST API Client — public market-data endpoints
// =============================================================================
//
// Only unauthenticated endpoints are used; the recorder never trades, so no
// request signing is required.
// =============================================================================

use anyhow::{Context, Result};
use tracing::{debug, info};

use crate::types::Candle;

/// Bybit v5 REST client for fetching the historical candle baseline.
#[derive(Clone)]
pub struct BybitClient {
    base_url: String,
    client: reqwest::Client,
}

impl BybitClient {
    pub fn new() -> Self {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(10))
            .build()
            .expect("failed to build reqwest client");

        debug!("BybitClient initialised (base_url=https://api.bybit.com)");

        Self {
            base_url: "https://api.bybit.com".to_string(),
            client,
        }
    }

    /// Fetch the trailing `hours` of spot klines for `symbol`.
    ///
    /// `interval` follows the Bybit kline interval notation ("1" = 1 minute).
    /// Bybit returns the list newest-first; the result is sorted ascending by
    /// timestamp before it is returned.
    pub async fn get_kline(&self, symbol: &str, interval: &str, hours: u64) -> Result<Vec<Candle>> {
        let end = chrono::Utc::now().timestamp_millis();
        let start = end - (hours as i64) * 60 * 60 * 1000;

        let url = format!(
            "{}/v5/market/kline?category=spot&symbol={}&interval={}&start={}&end={}&limit=1000",
            self.base_url, symbol, interval, start, end
        );
        info!(symbol = %symbol, interval = %interval, hours, "fetching historical klines");

        let resp = self
            .client
            .get(&url)
            .send()
            .await
            .context("GET /v5/market/kline request failed")?;

        let status = resp.status();
        let body: serde_json::Value = resp
            .json()
            .await
            .context("failed to parse kline response")?;

        if !status.is_success() {
            anyhow::bail!("Bybit GET /v5/market/kline returned {}: {}", status, body);
        }

        let candles = parse_kline_response(&body)?;
        info!(count = candles.len(), "historical klines fetched");
        Ok(candles)
    }
}

impl Default for BybitClient {
    fn default() -> Self {
        Self::new()
    }
}

/// Parse a Bybit v5 kline response body into ascending candles.
///
/// Expected shape:
/// ```json
/// {
///   "retCode": 0,
///   "result": {
///     "list": [ ["1700000040000","37000","37050","36990","37020","12.3","455000.1"], ... ]
///   }
/// }
/// ```
/// Entries are `[start, open, high, low, close, volume, turnover]`, all
/// strings, newest first.
fn parse_kline_response(body: &serde_json::Value) -> Result<Vec<Candle>> {
    let ret_code = body["retCode"].as_i64().context("missing retCode")?;
    if ret_code != 0 {
        anyhow::bail!(
            "Bybit kline request failed: retCode={} retMsg={}",
            ret_code,
            body["retMsg"].as_str().unwrap_or("unknown")
        );
    }

    let list = body["result"]["list"]
        .as_array()
        .context("kline response missing result.list")?;

    let mut candles = Vec::with_capacity(list.len());
    for entry in list {
        let row = entry.as_array().context("kline entry is not an array")?;
        if row.len() < 7 {
            anyhow::bail!("kline entry has {} fields, expected 7", row.len());
        }

        let timestamp: i64 = row[0]
            .as_str()
            .context("kline start time is not a string")?
            .parse()
            .context("failed to parse kline start time")?;

        candles.push(Candle {
            timestamp,
            open: parse_string_f64(&row[1], "open")?,
            high: parse_string_f64(&row[2], "high")?,
            low: parse_string_f64(&row[3], "low")?,
            close: parse_string_f64(&row[4], "close")?,
            volume: parse_string_f64(&row[5], "volume")?,
            turnover: parse_string_f64(&row[6], "turnover")?,
        });
    }

    // Oldest first, as the dataset store expects.
    candles.sort_by_key(|c| c.timestamp);
    Ok(candles)
}

/// Helper: Bybit sends numeric values as JSON strings inside kline rows.
fn parse_string_f64(val: &serde_json::Value, name: &str) -> Result<f64> {
    match val {
        serde_json::Value::String(s) => s
            .parse::<f64>()
            .with_context(|| format!("failed to parse {name} as f64: {s}")),
        serde_json::Value::Number(n) => n
            .as_f64()
            .with_context(|| format!("field {name} is not a valid f64")),
        _ => anyhow::bail!("field {name} has unexpected JSON type"),
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parse_kline_response_sorts_ascending() {
        // Newest first, as Bybit sends it.
        let body = serde_json::json!({
            "retCode": 0,
            "retMsg": "OK",
            "result": {
                "category": "spot",
                "symbol": "BTCUSDT",
                "list": [
                    ["1700000100000", "37020", "37060", "37000", "37040", "10.5", "389000.2"],
                    ["1700000040000", "37000", "37050", "36990", "37020", "12.3", "455000.1"]
                ]
            }
        });

        let candles = parse_kline_response(&body).expect("should parse");
        assert_eq!(candles.len(), 2);
        assert_eq!(candles[0].timestamp, 1_700_000_040_000);
        assert_eq!(candles[1].timestamp, 1_700_000_100_000);
        assert!((candles[0].open - 37_000.0).abs() < f64::EPSILON);
        assert!((candles[0].turnover - 455_000.1).abs() < 1e-6);
    }

    #[test]
    fn parse_kline_response_nonzero_ret_code() {
        let body = serde_json::json!({
            "retCode": 10001,
            "retMsg": "params error",
            "result": {}
        });
        let err = parse_kline_response(&body).unwrap_err();
        assert!(err.to_string().contains("10001"));
    }

    #[test]
    fn parse_kline_response_short_row() {
        let body = serde_json::json!({
            "retCode": 0,
            "result": { "list": [ ["1700000040000", "37000"] ] }
        });
        assert!(parse_kline_response(&body).is_err());
    }
}
