// =============================================================================
// Persistence — CSV snapshot writer and flush scheduler
// =============================================================================
//
// Every flush writes the COMPLETE dataset, never a delta. A failed flush is
// logged and retried at the next trigger with the (larger) full snapshot, so
// no finalized candle is ever permanently lost. The snapshot copy is taken
// before the persister is invoked; no store lock is held during I/O.
// =============================================================================

use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, Result};
use chrono::{TimeZone, Utc};
use tracing::{info, warn};

use crate::market_data::DatasetStore;
use crate::types::Candle;

/// Durable-write collaborator. Injected into the scheduler so tests can
/// substitute a recording double.
pub trait Persister: Send {
    fn persist(&self, candles: &[Candle]) -> Result<()>;
}

// ---------------------------------------------------------------------------
// CsvPersister
// ---------------------------------------------------------------------------

/// Writes the dataset to `<data_dir>/<SYMBOL>_historical_<YYYYMMDD>.csv`
/// (UTC date) using an atomic tmp + rename write.
pub struct CsvPersister {
    data_dir: PathBuf,
    symbol: String,
}

impl CsvPersister {
    /// Create the persister, ensuring `data_dir` exists.
    pub fn new(data_dir: impl Into<PathBuf>, symbol: impl Into<String>) -> Result<Self> {
        let data_dir = data_dir.into();
        std::fs::create_dir_all(&data_dir)
            .with_context(|| format!("failed to create data dir {}", data_dir.display()))?;
        Ok(Self {
            data_dir,
            symbol: symbol.into(),
        })
    }

    /// Target path for today's snapshot file.
    fn file_path(&self) -> PathBuf {
        let date = Utc::now().format("%Y%m%d");
        self.data_dir
            .join(format!("{}_historical_{}.csv", self.symbol, date))
    }
}

impl Persister for CsvPersister {
    fn persist(&self, candles: &[Candle]) -> Result<()> {
        let path = self.file_path();
        write_csv_atomic(&path, candles)?;
        info!(
            path = %path.display(),
            records = candles.len(),
            "dataset snapshot saved"
        );
        Ok(())
    }
}

/// Render one candle as a CSV row. Timestamps are written as UTC
/// `YYYY-MM-DD HH:MM:SS` to keep the files human-readable.
fn csv_row(candle: &Candle) -> String {
    let ts = Utc
        .timestamp_millis_opt(candle.timestamp)
        .single()
        .map(|dt| dt.format("%Y-%m-%d %H:%M:%S").to_string())
        .unwrap_or_else(|| candle.timestamp.to_string());
    format!(
        "{},{},{},{},{},{},{}",
        ts, candle.open, candle.high, candle.low, candle.close, candle.volume, candle.turnover
    )
}

const CSV_HEADER: &str = "timestamp,open,high,low,close,volume,turnover";

/// Write the snapshot to a temporary sibling file, then rename. Prevents a
/// crash mid-write from corrupting the previous snapshot.
fn write_csv_atomic(path: &Path, candles: &[Candle]) -> Result<()> {
    let mut content = String::with_capacity(64 * (candles.len() + 1));
    content.push_str(CSV_HEADER);
    content.push('\n');
    for candle in candles {
        content.push_str(&csv_row(candle));
        content.push('\n');
    }

    let tmp_path = path.with_extension("csv.tmp");
    std::fs::write(&tmp_path, &content)
        .with_context(|| format!("failed to write tmp snapshot to {}", tmp_path.display()))?;
    std::fs::rename(&tmp_path, path)
        .with_context(|| format!("failed to rename tmp snapshot to {}", path.display()))?;
    Ok(())
}

// ---------------------------------------------------------------------------
// PersistenceScheduler
// ---------------------------------------------------------------------------

/// Counts candle finalizations and hands full-dataset snapshots to the
/// persister every `flush_every` finalizations, plus once unconditionally at
/// shutdown via [`PersistenceScheduler::on_stop`].
pub struct PersistenceScheduler {
    store: Arc<DatasetStore>,
    persister: Box<dyn Persister>,
    finalized: u64,
    flush_every: u64,
}

impl PersistenceScheduler {
    pub fn new(store: Arc<DatasetStore>, persister: Box<dyn Persister>, flush_every: u64) -> Self {
        Self {
            store,
            persister,
            finalized: 0,
            flush_every: flush_every.max(1),
        }
    }

    /// Called once per finalized candle.
    pub fn on_finalized(&mut self) {
        self.finalized += 1;
        if self.finalized % self.flush_every == 0 {
            self.flush();
        }
    }

    /// Snapshot the full dataset and hand it to the persister. Failure is
    /// non-fatal: the counter is untouched and the next trigger re-attempts
    /// with the complete, larger snapshot.
    pub fn flush(&mut self) {
        let snapshot = self.store.snapshot_all();
        if let Err(e) = self.persister.persist(&snapshot) {
            warn!(error = %e, records = snapshot.len(), "snapshot persist failed — will retry at next flush");
        }
    }

    /// Final flush before shutdown, regardless of counter state.
    pub fn on_stop(&mut self) {
        self.flush();
    }

    /// Total finalizations observed.
    pub fn finalized_count(&self) -> u64 {
        self.finalized
    }
}
