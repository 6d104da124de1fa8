//! Time-windowed aggregation engine: bucket store, market state, and the
//! metrics calculator that queries them.

pub mod bucket;
pub mod market;
pub mod metrics;

pub use bucket::{AddPointOutcome, Bucket, BucketStore, Resolution};
pub use market::{MarketState, SymbolState};
pub use metrics::{Metrics, MetricsCalculator};
