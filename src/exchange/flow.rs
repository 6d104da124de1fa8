//! Aggressive-volume accumulation from per-trade streams.
//!
//! Trades fold into per-symbol taker buy/sell totals; a flush timer drains
//! the accumulator into one aggregated update per symbol, dropping symbols
//! whose flushed quote notional stays under the micro-trade floor.

use crate::event::Side;
use chrono::{DateTime, Utc};
use fnv::FnvHashMap;

/// Flush cadence for aggregated flow updates.
pub const FLOW_FLUSH_MS: u64 = 120;
/// Minimum quote notional for a flushed update.
pub const MIN_QUOTE_NOTIONAL: f64 = 250.0;

/// Accumulated taker flow for one symbol since the last flush.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
pub struct FlowTotals {
    pub buy_base: f64,
    pub sell_base: f64,
    pub buy_quote: f64,
    pub sell_quote: f64,
    pub last_price: f64,
    pub last_time_ms: i64,
}

impl FlowTotals {
    pub fn quote_notional(&self) -> f64 {
        self.buy_quote + self.sell_quote
    }

    pub fn is_zero(&self) -> bool {
        self.buy_base == 0.0 && self.sell_base == 0.0
    }
}

/// Per-symbol aggressive-volume accumulator.
#[derive(Debug, Default)]
pub struct FlowAccumulator {
    totals: FnvHashMap<String, FlowTotals>,
}

impl FlowAccumulator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Fold one trade. `side` is the taker side.
    pub fn record(
        &mut self,
        symbol: &str,
        side: Side,
        price: f64,
        amount: f64,
        time: DateTime<Utc>,
    ) {
        if !(price.is_finite() && price > 0.0 && amount.is_finite() && amount > 0.0) {
            return;
        }

        let totals = self.totals.entry(symbol.to_string()).or_default();
        let quote = price * amount;
        match side {
            Side::Buy => {
                totals.buy_base += amount;
                totals.buy_quote += quote;
            }
            Side::Sell => {
                totals.sell_base += amount;
                totals.sell_quote += quote;
            }
        }
        totals.last_price = price;
        totals.last_time_ms = time.timestamp_millis();
    }

    /// Take all symbols with flow at or above `min_quote_notional`, zeroing
    /// the accumulator. Sub-floor flow is discarded.
    pub fn drain(&mut self, min_quote_notional: f64) -> Vec<(String, FlowTotals)> {
        let drained: Vec<(String, FlowTotals)> = self
            .totals
            .drain()
            .filter(|(_, totals)| {
                !totals.is_zero() && totals.quote_notional() >= min_quote_notional
            })
            .collect();
        drained
    }

    pub fn is_empty(&self) -> bool {
        self.totals.is_empty()
    }
}
