// =============================================================================
// Runtime Configuration — recorder settings with atomic save
// =============================================================================
//
// Persistence uses an atomic tmp + rename pattern to prevent corruption on
// crash. All fields carry `#[serde(default)]` so that adding new fields
// never breaks loading an older config file.
// =============================================================================

use std::path::Path;

use anyhow::{Context, Result};
use serde::{Deserialize, Serialize};
use tracing::info;

// =============================================================================
// Default-value helpers (required by serde `default = "..."` attribute)
// =============================================================================

fn default_symbol() -> String {
    "BTCUSDT".to_string()
}

fn default_data_dir() -> String {
    "data".to_string()
}

fn default_history_hours() -> u64 {
    48
}

fn default_kline_interval() -> String {
    "1".to_string()
}

fn default_flush_every() -> u64 {
    10
}

fn default_trade_channel_capacity() -> usize {
    1024
}

fn default_status_interval_secs() -> u64 {
    10
}

/// Top-level configuration for the Borealis candle recorder.
///
/// Every field has a serde default so that older JSON files missing new
/// fields will still deserialise correctly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RecorderConfig {
    /// Spot symbol to record.
    #[serde(default = "default_symbol")]
    pub symbol: String,

    /// Directory for CSV snapshot files. Created on startup if missing.
    #[serde(default = "default_data_dir")]
    pub data_dir: String,

    /// How many trailing hours of historical candles to fetch at startup.
    #[serde(default = "default_history_hours")]
    pub history_hours: u64,

    /// Bybit kline interval notation ("1" = 1 minute).
    #[serde(default = "default_kline_interval")]
    pub kline_interval: String,

    /// Flush a full snapshot every N finalized candles.
    #[serde(default = "default_flush_every")]
    pub flush_every: u64,

    /// Capacity of the bounded trade channel between the WebSocket task and
    /// the aggregation task.
    #[serde(default = "default_trade_channel_capacity")]
    pub trade_channel_capacity: usize,

    /// How often the status line is logged.
    #[serde(default = "default_status_interval_secs")]
    pub status_interval_secs: u64,
}

impl Default for RecorderConfig {
    fn default() -> Self {
        Self {
            symbol: default_symbol(),
            data_dir: default_data_dir(),
            history_hours: default_history_hours(),
            kline_interval: default_kline_interval(),
            flush_every: default_flush_every(),
            trade_channel_capacity: default_trade_channel_capacity(),
            status_interval_secs: default_status_interval_secs(),
        }
    }
}

impl RecorderConfig {
    /// Load configuration from a JSON file at `path`.
    ///
    /// If the file does not exist, returns an error so the caller can fall
    /// back to defaults with a warning.
    pub fn load(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        let content = std::fs::read_to_string(path)
            .with_context(|| format!("failed to read recorder config from {}", path.display()))?;

        let config: Self = serde_json::from_str(&content)
            .with_context(|| format!("failed to parse recorder config from {}", path.display()))?;

        info!(
            path = %path.display(),
            symbol = %config.symbol,
            history_hours = config.history_hours,
            "recorder config loaded"
        );

        Ok(config)
    }

    /// Persist the current configuration to `path` using an atomic write
    /// (write to `.tmp`, then rename).
    pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {
        let path = path.as_ref();

        let content = serde_json::to_string_pretty(self)
            .context("failed to serialise recorder config to JSON")?;

        let tmp_path = path.with_extension("json.tmp");

        std::fs::write(&tmp_path, &content)
            .with_context(|| format!("failed to write tmp config to {}", tmp_path.display()))?;

        std::fs::rename(&tmp_path, path)
            .with_context(|| format!("failed to rename tmp config to {}", path.display()))?;

        info!(path = %path.display(), "recorder config saved (atomic)");
        Ok(())
    }

    /// Apply environment-variable overrides (`RECORDER_SYMBOL`,
    /// `RECORDER_DATA_DIR`).
    pub fn apply_env_overrides(&mut self) {
        if let Ok(symbol) = std::env::var("RECORDER_SYMBOL") {
            let symbol = symbol.trim().to_uppercase();
            if !symbol.is_empty() {
                self.symbol = symbol;
            }
        }
        if let Ok(dir) = std::env::var("RECORDER_DATA_DIR") {
            if !dir.trim().is_empty() {
                self.data_dir = dir;
            }
        }
    }
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn default_config_has_expected_values() {
        let cfg = RecorderConfig::default();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.data_dir, "data");
        assert_eq!(cfg.history_hours, 48);
        assert_eq!(cfg.kline_interval, "1");
        assert_eq!(cfg.flush_every, 10);
        assert_eq!(cfg.trade_channel_capacity, 1024);
        assert_eq!(cfg.status_interval_secs, 10);
    }

    #[test]
    fn deserialise_empty_json_uses_defaults() {
        let cfg: RecorderConfig = serde_json::from_str("{}").unwrap();
        assert_eq!(cfg.symbol, "BTCUSDT");
        assert_eq!(cfg.flush_every, 10);
        assert_eq!(cfg.history_hours, 48);
    }

    #[test]
    fn deserialise_partial_json_fills_defaults() {
        let json = r#"{ "symbol": "ETHUSDT", "history_hours": 24 }"#;
        let cfg: RecorderConfig = serde_json::from_str(json).unwrap();
        assert_eq!(cfg.symbol, "ETHUSDT");
        assert_eq!(cfg.history_hours, 24);
        assert_eq!(cfg.flush_every, 10);
        assert_eq!(cfg.data_dir, "data");
    }

    #[test]
    fn roundtrip_serialisation() {
        let cfg = RecorderConfig::default();
        let json = serde_json::to_string(&cfg).unwrap();
        let cfg2: RecorderConfig = serde_json::from_str(&json).unwrap();
        assert_eq!(cfg.symbol, cfg2.symbol);
        assert_eq!(cfg.flush_every, cfg2.flush_every);
        assert_eq!(cfg.trade_channel_capacity, cfg2.trade_channel_capacity);
    }
}
