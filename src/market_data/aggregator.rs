// =============================================================================
// CandleAggregator — folds the live trade stream into 1-minute candles
// =============================================================================
//
// Single-writer state machine: Empty -> Building -> (boundary crossed) ->
// Building(new), and Building -> Closed on shutdown. Exactly one task calls
// `ingest`; trades must arrive in delivery order. The in-progress draft is
// behind its own lock only so the status loop can read it concurrently.
// =============================================================================

use std::sync::Arc;
use std::sync::atomic::{AtomicU64, Ordering};

use parking_lot::RwLock;
use tracing::{debug, info, warn};

use crate::market_data::DatasetStore;
use crate::persistence::PersistenceScheduler;
use crate::types::{bucket_of, CandleDraft, Trade};

/// Aggregates trades into minute candles and routes finalized candles to the
/// dataset store and the persistence scheduler.
pub struct CandleAggregator {
    /// In-progress candle. `None` before the first trade and after close.
    current: Arc<RwLock<Option<CandleDraft>>>,
    closed: bool,
    store: Arc<DatasetStore>,
    scheduler: PersistenceScheduler,
    /// Trades rejected for bad price/volume.
    dropped_malformed: Arc<AtomicU64>,
    /// Trades rejected for targeting an already-superseded bucket.
    dropped_out_of_order: Arc<AtomicU64>,
}

/// Read-only view of the aggregator shared with the status loop.
#[derive(Clone)]
pub struct AggregatorView {
    current: Arc<RwLock<Option<CandleDraft>>>,
    dropped_malformed: Arc<AtomicU64>,
    dropped_out_of_order: Arc<AtomicU64>,
}

impl AggregatorView {
    /// Immutable snapshot of the in-progress candle, or `None`. Repeated
    /// calls with no intervening trades return an identical snapshot.
    pub fn current_candle_info(&self) -> Option<CandleDraft> {
        *self.current.read()
    }

    pub fn dropped_malformed(&self) -> u64 {
        self.dropped_malformed.load(Ordering::Relaxed)
    }

    pub fn dropped_out_of_order(&self) -> u64 {
        self.dropped_out_of_order.load(Ordering::Relaxed)
    }
}

impl CandleAggregator {
    pub fn new(store: Arc<DatasetStore>, scheduler: PersistenceScheduler) -> Self {
        Self {
            current: Arc::new(RwLock::new(None)),
            closed: false,
            store,
            scheduler,
            dropped_malformed: Arc::new(AtomicU64::new(0)),
            dropped_out_of_order: Arc::new(AtomicU64::new(0)),
        }
    }

    /// Handle for concurrent readers (status loop).
    pub fn view(&self) -> AggregatorView {
        AggregatorView {
            current: self.current.clone(),
            dropped_malformed: self.dropped_malformed.clone(),
            dropped_out_of_order: self.dropped_out_of_order.clone(),
        }
    }

    /// Immutable snapshot of the in-progress candle, or `None`.
    pub fn current_candle_info(&self) -> Option<CandleDraft> {
        *self.current.read()
    }

    /// Consume one trade in arrival order.
    pub fn ingest(&mut self, trade: Trade) {
        if self.closed {
            debug!("trade received after aggregator close — ignored");
            return;
        }

        if !trade_is_valid(&trade) {
            self.dropped_malformed.fetch_add(1, Ordering::Relaxed);
            warn!(
                timestamp = trade.timestamp,
                price = trade.price,
                volume = trade.volume,
                "malformed trade dropped"
            );
            return;
        }

        let bucket = bucket_of(trade.timestamp);

        // Drafts are Copy: read, decide, write back, and release the lock
        // before touching the store or scheduler.
        let mut guard = self.current.write();
        let sealed = match *guard {
            None => {
                *guard = Some(CandleDraft::open(bucket, &trade));
                debug!(bucket, price = trade.price, "opened first candle");
                None
            }
            Some(mut draft) if bucket == draft.timestamp => {
                draft.apply(&trade);
                *guard = Some(draft);
                None
            }
            Some(draft) if bucket > draft.timestamp => {
                // Boundary crossed: finalize exactly one candle and open
                // exactly one new draft. Skipped empty minutes are not
                // back-filled.
                *guard = Some(CandleDraft::open(bucket, &trade));
                Some(draft.finish())
            }
            Some(draft) => {
                // bucket < draft.timestamp: the candle for that minute is
                // already sealed (or being built); finalized candles are
                // immutable, so the trade is dropped.
                self.dropped_out_of_order.fetch_add(1, Ordering::Relaxed);
                warn!(
                    trade_bucket = bucket,
                    current_bucket = draft.timestamp,
                    "out-of-order trade dropped"
                );
                None
            }
        };
        drop(guard);

        if let Some(candle) = sealed {
            info!(
                timestamp = candle.timestamp,
                open = candle.open,
                high = candle.high,
                low = candle.low,
                close = candle.close,
                volume = candle.volume,
                "candle finalized"
            );
            self.store.append(candle);
            self.scheduler.on_finalized();
        }
    }

    /// Force-finalize the in-progress candle and close the aggregator.
    /// Used only at shutdown; idempotent when nothing is in progress.
    pub fn finalize_current(&mut self) {
        let sealed = self.current.write().take().map(|draft| draft.finish());
        if let Some(candle) = sealed {
            info!(
                timestamp = candle.timestamp,
                close = candle.close,
                "final candle sealed at shutdown"
            );
            self.store.append(candle);
            self.scheduler.on_finalized();
        }
        self.closed = true;
    }

    /// Shutdown hook: final flush of the complete dataset.
    pub fn on_stop(&mut self) {
        self.scheduler.on_stop();
    }
}

fn trade_is_valid(trade: &Trade) -> bool {
    trade.price.is_finite()
        && trade.price > 0.0
        && trade.volume.is_finite()
        && trade.volume >= 0.0
}

// =============================================================================
// Tests
// =============================================================================
#[cfg(test)]
mod tests {
    use super::*;
    use crate::persistence::Persister;
    use crate::types::Candle;
    use anyhow::Result;
    use parking_lot::Mutex;

    /// Persister double that records how many candles each flush carried.
    struct RecordingPersister(Arc<Mutex<Vec<usize>>>);

    impl Persister for RecordingPersister {
        fn persist(&self, candles: &[Candle]) -> Result<()> {
            self.0.lock().push(candles.len());
            Ok(())
        }
    }

    fn aggregator() -> (CandleAggregator, Arc<DatasetStore>, Arc<Mutex<Vec<usize>>>) {
        let store = Arc::new(DatasetStore::new());
        let flushes = Arc::new(Mutex::new(Vec::new()));
        let scheduler = PersistenceScheduler::new(
            store.clone(),
            Box::new(RecordingPersister(flushes.clone())),
            10,
        );
        (
            CandleAggregator::new(store.clone(), scheduler),
            store,
            flushes,
        )
    }

    fn trade(timestamp: i64, price: f64, volume: f64) -> Trade {
        Trade {
            timestamp,
            price,
            volume,
        }
    }

    const T0: i64 = 1_700_000_040_000; // minute-aligned

    #[test]
    fn single_bucket_aggregation() {
        let (mut agg, store, _) = aggregator();

        agg.ingest(trade(T0, 100.0, 1.0));
        agg.ingest(trade(T0 + 10_000, 105.0, 2.0));
        agg.ingest(trade(T0 + 30_000, 98.0, 1.0));

        // Nothing finalized yet.
        assert_eq!(store.len(), 0);

        let draft = agg.current_candle_info().expect("draft in progress");
        assert_eq!(draft.timestamp, T0);
        assert_eq!(draft.open, 100.0);
        assert_eq!(draft.high, 105.0);
        assert_eq!(draft.low, 98.0);
        assert_eq!(draft.close, 98.0);
        assert_eq!(draft.volume, 4.0);
        assert!((draft.turnover - 408.0).abs() < 1e-9);
        assert_eq!(draft.trade_count, 3);
    }

    #[test]
    fn boundary_crossing_finalizes_exactly_one() {
        let (mut agg, store, _) = aggregator();

        agg.ingest(trade(T0, 100.0, 1.0));
        // Three minutes later — the two empty minutes are not back-filled.
        agg.ingest(trade(T0 + 3 * 60_000, 110.0, 2.0));

        let all = store.snapshot_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, T0);
        assert_eq!(all[0].close, 100.0);

        let draft = agg.current_candle_info().unwrap();
        assert_eq!(draft.timestamp, T0 + 3 * 60_000);
        assert_eq!(draft.open, 110.0);
        assert_eq!(draft.trade_count, 1);
    }

    #[test]
    fn out_of_order_trade_leaves_draft_unchanged() {
        let (mut agg, _store, _) = aggregator();

        agg.ingest(trade(T0 + 60_000, 100.0, 1.0));
        let before = agg.current_candle_info();

        // Trade for the previous minute.
        agg.ingest(trade(T0, 95.0, 5.0));

        assert_eq!(agg.current_candle_info(), before);
        assert_eq!(agg.view().dropped_out_of_order(), 1);
    }

    #[test]
    fn malformed_trades_are_dropped() {
        let (mut agg, store, _) = aggregator();

        agg.ingest(trade(T0, f64::NAN, 1.0));
        agg.ingest(trade(T0, 0.0, 1.0));
        agg.ingest(trade(T0, -5.0, 1.0));
        agg.ingest(trade(T0, 100.0, -1.0));
        agg.ingest(trade(T0, 100.0, f64::NAN));

        assert!(agg.current_candle_info().is_none());
        assert_eq!(store.len(), 0);
        assert_eq!(agg.view().dropped_malformed(), 5);

        // Zero-volume trades are valid.
        agg.ingest(trade(T0, 100.0, 0.0));
        let draft = agg.current_candle_info().unwrap();
        assert_eq!(draft.volume, 0.0);
        assert_eq!(draft.trade_count, 1);
    }

    #[test]
    fn finalize_current_is_idempotent_and_closes() {
        let (mut agg, store, _) = aggregator();

        agg.ingest(trade(T0, 100.0, 1.0));
        agg.finalize_current();
        assert_eq!(store.len(), 1);
        assert!(agg.current_candle_info().is_none());

        // Nothing in progress — no-op.
        agg.finalize_current();
        assert_eq!(store.len(), 1);

        // Closed: further trades are ignored.
        agg.ingest(trade(T0 + 60_000, 101.0, 1.0));
        assert!(agg.current_candle_info().is_none());
        assert_eq!(store.len(), 1);
    }

    #[test]
    fn current_candle_info_is_stable_between_trades() {
        let (mut agg, _store, _) = aggregator();
        agg.ingest(trade(T0, 100.0, 1.0));

        let a = agg.current_candle_info();
        let b = agg.current_candle_info();
        assert_eq!(a, b);

        let view = agg.view();
        assert_eq!(view.current_candle_info(), a);
    }

    #[test]
    fn persistence_cadence_driven_by_finalizations() {
        let (mut agg, store, flushes) = aggregator();

        // 25 boundary crossings: one trade per minute for 26 minutes
        // finalizes minutes 0..25.
        for i in 0..26 {
            agg.ingest(trade(T0 + i * 60_000, 100.0 + i as f64, 1.0));
        }
        assert_eq!(store.len(), 25);
        assert_eq!(*flushes.lock(), vec![10, 20]);

        // Shutdown: the 26th candle is sealed, then the final flush carries
        // the complete dataset.
        agg.finalize_current();
        agg.on_stop();
        assert_eq!(store.len(), 26);
        assert_eq!(*flushes.lock(), vec![10, 20, 26]);
    }

    #[test]
    fn live_candles_supersede_seeded_boundary() {
        let (mut agg, store, _) = aggregator();
        store
            .seed(vec![Candle {
                timestamp: T0,
                open: 1.0,
                high: 1.0,
                low: 1.0,
                close: 1.0,
                volume: 1.0,
                turnover: 1.0,
            }])
            .unwrap();

        // Live trades land on the seeded minute, then cross the boundary.
        agg.ingest(trade(T0 + 5_000, 100.0, 1.0));
        agg.ingest(trade(T0 + 60_000, 101.0, 1.0));

        let all = store.snapshot_all();
        assert_eq!(all.len(), 1);
        assert_eq!(all[0].timestamp, T0);
        assert_eq!(all[0].close, 100.0); // live replaced the seed
    }
}
