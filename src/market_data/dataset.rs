// =============================================================================
// DatasetStore — thread-safe ordered candle sequence
// =============================================================================
//
// Single source of truth for finalized candles: the historical seed merged
// with live candles from the aggregator. Strictly ascending by timestamp,
// never two entries with the same timestamp. All reads copy out, so no
// caller ever holds a reference into the store.
// =============================================================================

use anyhow::{bail, Result};
use parking_lot::RwLock;
use tracing::warn;

use crate::types::Candle;

struct Inner {
    candles: Vec<Candle>,
    seeded: bool,
    appended: bool,
}

/// Thread-safe store holding the authoritative ordered candle dataset.
///
/// Written by the aggregation task (`append`), read concurrently by the
/// status loop and the persistence flush. Every operation is a single
/// critical section.
pub struct DatasetStore {
    inner: RwLock<Inner>,
}

impl DatasetStore {
    pub fn new() -> Self {
        Self {
            inner: RwLock::new(Inner {
                candles: Vec::new(),
                seeded: false,
                appended: false,
            }),
        }
    }

    /// Bulk-insert the historical baseline.
    ///
    /// Must be called at most once, before any live `append` — both are
    /// caller-contract violations and return an error. The input is expected
    /// already ascending; an entry that is not strictly newer than its
    /// predecessor is skipped and logged, keeping all prior valid entries.
    /// Returns the number of accepted candles.
    pub fn seed(&self, candles: Vec<Candle>) -> Result<usize> {
        let mut inner = self.inner.write();
        if inner.seeded {
            bail!("dataset store already seeded");
        }
        if inner.appended {
            bail!("cannot seed dataset store after live appends");
        }

        for candle in candles {
            match inner.candles.last() {
                Some(last) if candle.timestamp <= last.timestamp => {
                    warn!(
                        timestamp = candle.timestamp,
                        previous = last.timestamp,
                        "historical seed entry out of order — skipped"
                    );
                }
                _ => inner.candles.push(candle),
            }
        }

        inner.seeded = true;
        Ok(inner.candles.len())
    }

    /// Insert a finalized live candle.
    ///
    /// If the tail already holds a candle with the same timestamp (the
    /// boundary overlap between the seed and the first live candle), the
    /// live candle replaces it — live data supersedes historical data.
    /// A candle older than the tail would break the ascending invariant and
    /// is dropped with a warning; the aggregator never produces one.
    pub fn append(&self, candle: Candle) {
        let mut inner = self.inner.write();

        match inner.candles.last() {
            Some(last) if candle.timestamp == last.timestamp => {
                warn!(
                    timestamp = candle.timestamp,
                    "timestamp collision — live candle replaces existing entry"
                );
                let idx = inner.candles.len() - 1;
                inner.candles[idx] = candle;
            }
            Some(last) if candle.timestamp < last.timestamp => {
                warn!(
                    timestamp = candle.timestamp,
                    tail = last.timestamp,
                    "stale candle older than dataset tail — dropped"
                );
                return;
            }
            _ => inner.candles.push(candle),
        }

        inner.appended = true;
    }

    /// Last `n` candles in ascending order, as an independent copy.
    /// Returns fewer if the store holds fewer.
    pub fn latest(&self, n: usize) -> Vec<Candle> {
        let inner = self.inner.read();
        let start = inner.candles.len().saturating_sub(n);
        inner.candles[start..].to_vec()
    }

    /// Full independent copy of the dataset, for persistence or inspection.
    pub fn snapshot_all(&self) -> Vec<Candle> {
        self.inner.read().candles.clone()
    }

    /// Number of finalized candles currently held.
    pub fn len(&self) -> usize {
        self.inner.read().candles.len()
    }

    /// Close price of the newest candle, if any.
    pub fn last_close(&self) -> Option<f64> {
        self.inner.read().candles.last().map(|c| c.close)
    }
}

impl Default for DatasetStore {
    fn default() -> Self {
        Self::new()
    }
}
