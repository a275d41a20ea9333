pub mod aggregator;
pub mod dataset;
pub mod trade_stream;

// Re-export the core pieces for convenient access (e.g. `use crate::market_data::DatasetStore`).
pub use aggregator::{AggregatorView, CandleAggregator};
pub use dataset::DatasetStore;
