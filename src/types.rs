// =============================================================================
// Shared types used across the Borealis candle recorder
// =============================================================================

use serde::{Deserialize, Serialize};

/// Milliseconds per candle bucket. The recorder works exclusively on
/// 1-minute candles.
pub const BUCKET_MS: i64 = 60_000;

/// A single executed trade from the public trade feed.
///
/// Ephemeral: trades are consumed by the aggregator as they arrive and are
/// never stored.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Trade {
    /// Trade time in milliseconds since the UNIX epoch (UTC).
    pub timestamp: i64,
    pub price: f64,
    pub volume: f64,
}

/// A finalized OHLCV candle.
///
/// `timestamp` is the minute-aligned bucket start (`timestamp % 60_000 == 0`).
/// Once finalized a candle is immutable; the dataset store owns the
/// authoritative sequence.
#[derive(Debug, Clone, Copy, PartialEq, Serialize, Deserialize)]
pub struct Candle {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    /// Sum of `price * volume` over all trades in the bucket.
    pub turnover: f64,
}

/// The in-progress candle owned by the aggregator.
///
/// Identical to [`Candle`] plus the aggregation-only trade counter. The
/// counter is dropped when the draft is sealed via [`CandleDraft::finish`].
#[derive(Debug, Clone, Copy, PartialEq, Serialize)]
pub struct CandleDraft {
    pub timestamp: i64,
    pub open: f64,
    pub high: f64,
    pub low: f64,
    pub close: f64,
    pub volume: f64,
    pub turnover: f64,
    pub trade_count: u64,
}

impl CandleDraft {
    /// Start a new draft from the first trade of a bucket.
    pub fn open(bucket: i64, trade: &Trade) -> Self {
        Self {
            timestamp: bucket,
            open: trade.price,
            high: trade.price,
            low: trade.price,
            close: trade.price,
            volume: trade.volume,
            turnover: trade.price * trade.volume,
            trade_count: 1,
        }
    }

    /// Fold another trade from the same bucket into the draft.
    pub fn apply(&mut self, trade: &Trade) {
        self.high = self.high.max(trade.price);
        self.low = self.low.min(trade.price);
        self.close = trade.price;
        self.volume += trade.volume;
        self.turnover += trade.price * trade.volume;
        self.trade_count += 1;
    }

    /// Seal the draft into an immutable candle.
    pub fn finish(&self) -> Candle {
        Candle {
            timestamp: self.timestamp,
            open: self.open,
            high: self.high,
            low: self.low,
            close: self.close,
            volume: self.volume,
            turnover: self.turnover,
        }
    }
}

/// Bucket start for a trade timestamp (floor to the minute).
pub fn bucket_of(timestamp_ms: i64) -> i64 {
    timestamp_ms.div_euclid(BUCKET_MS) * BUCKET_MS
}
