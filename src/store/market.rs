//! Per-symbol latest market state with TTL and capacity eviction.

use fnv::FnvHashMap;
use tracing::debug;

/// Symbols idle longer than this are evicted by maintenance.
const SYMBOL_TTL_MS: i64 = 24 * 60 * 60 * 1_000;

/// Latest observations for one symbol.
#[derive(Debug, Clone)]
pub struct SymbolState {
    pub last_price: Option<f64>,
    pub last_oi: Option<f64>,
    pub last_funding_rate: Option<f64>,
    /// First observation, set once.
    pub first_seen_ms: i64,
    /// Most recent observation, never regresses.
    pub last_update_ms: i64,
    /// Count of out-of-order records detected by the bucket store.
    pub out_of_order_count: u64,
}

impl SymbolState {
    fn new(ts_ms: i64) -> Self {
        Self {
            last_price: None,
            last_oi: None,
            last_funding_rate: None,
            first_seen_ms: ts_ms,
            last_update_ms: ts_ms,
            out_of_order_count: 0,
        }
    }
}

/// Tracks last known price and open interest per symbol.
#[derive(Debug)]
pub struct MarketState {
    symbols: FnvHashMap<String, SymbolState>,
    max_tracked: usize,
}

impl MarketState {
    pub fn new(max_tracked: usize) -> Self {
        Self {
            symbols: FnvHashMap::default(),
            max_tracked,
        }
    }

    /// Fold an observation. Prices must be strictly positive and open
    /// interest finite and non-negative to overwrite; anything else leaves
    /// the previous value in place.
    pub fn update(
        &mut self,
        symbol: &str,
        ts_ms: i64,
        price: Option<f64>,
        open_interest: Option<f64>,
        funding_rate: Option<f64>,
    ) {
        let state = self
            .symbols
            .entry(symbol.to_string())
            .or_insert_with(|| SymbolState::new(ts_ms));

        if let Some(price) = price.filter(|p| p.is_finite() && *p > 0.0) {
            state.last_price = Some(price);
        }
        if let Some(oi) = open_interest.filter(|oi| oi.is_finite() && *oi >= 0.0) {
            state.last_oi = Some(oi);
        }
        if let Some(rate) = funding_rate.filter(|r| r.is_finite()) {
            state.last_funding_rate = Some(rate);
        }
        state.last_update_ms = state.last_update_ms.max(ts_ms);
    }

    pub fn record_out_of_order(&mut self, symbol: &str) {
        if let Some(state) = self.symbols.get_mut(symbol) {
            state.out_of_order_count += 1;
        }
    }

    pub fn price(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_price)
    }

    pub fn open_interest(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_oi)
    }

    pub fn funding_rate(&self, symbol: &str) -> Option<f64> {
        self.symbols.get(symbol).and_then(|s| s.last_funding_rate)
    }

    pub fn state(&self, symbol: &str) -> Option<&SymbolState> {
        self.symbols.get(symbol)
    }

    pub fn all_symbols(&self) -> Vec<String> {
        self.symbols.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.symbols.len()
    }

    pub fn is_empty(&self) -> bool {
        self.symbols.is_empty()
    }

    /// Periodic maintenance: TTL eviction first, then least-recently-updated
    /// eviction down to the configured cap. The hook runs once per evicted
    /// symbol so sibling stores can purge their maps.
    pub fn maintenance(&mut self, now_ms: i64, mut evict_hook: impl FnMut(&str)) {
        let cutoff = now_ms - SYMBOL_TTL_MS;
        let expired: Vec<String> = self
            .symbols
            .iter()
            .filter(|(_, state)| state.last_update_ms < cutoff)
            .map(|(symbol, _)| symbol.clone())
            .collect();

        for symbol in &expired {
            self.symbols.remove(symbol);
            evict_hook(symbol);
        }

        if self.symbols.len() > self.max_tracked {
            let surplus = self.symbols.len() - self.max_tracked;
            let mut by_age: Vec<(String, i64)> = self
                .symbols
                .iter()
                .map(|(symbol, state)| (symbol.clone(), state.last_update_ms))
                .collect();
            by_age.sort_by_key(|(_, last_update)| *last_update);

            for (symbol, _) in by_age.into_iter().take(surplus) {
                self.symbols.remove(&symbol);
                evict_hook(&symbol);
            }
        }

        if !expired.is_empty() {
            debug!(evicted = expired.len(), "market state ttl eviction");
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_first_seen_set_once_last_update_advances() {
        let mut state = MarketState::new(10);
        state.update("BTCUSDT", 1_000, Some(100.0), None, None);
        state.update("BTCUSDT", 5_000, Some(101.0), None, None);
        // Out-of-order record must not regress last_update.
        state.update("BTCUSDT", 3_000, Some(99.0), None, None);

        let snapshot = state.state("BTCUSDT").unwrap();
        assert_eq!(snapshot.first_seen_ms, 1_000);
        assert_eq!(snapshot.last_update_ms, 5_000);
        assert_eq!(snapshot.last_price, Some(99.0));
    }

    #[test]
    fn test_rejects_bad_values() {
        let mut state = MarketState::new(10);
        state.update("BTCUSDT", 1_000, Some(100.0), Some(5_000.0), None);
        state.update("BTCUSDT", 2_000, Some(0.0), Some(-1.0), None);
        state.update("BTCUSDT", 3_000, Some(f64::NAN), Some(f64::INFINITY), None);

        assert_eq!(state.price("BTCUSDT"), Some(100.0));
        assert_eq!(state.open_interest("BTCUSDT"), Some(5_000.0));
    }

    #[test]
    fn test_zero_oi_overwrites() {
        let mut state = MarketState::new(10);
        state.update("BTCUSDT", 1_000, None, Some(5_000.0), None);
        state.update("BTCUSDT", 2_000, None, Some(0.0), None);
        assert_eq!(state.open_interest("BTCUSDT"), Some(0.0));
    }

    #[test]
    fn test_ttl_eviction_calls_hook() {
        let mut state = MarketState::new(10);
        state.update("BTCUSDT", 0, Some(100.0), None, None);
        state.update("ETHUSDT", SYMBOL_TTL_MS, Some(200.0), None, None);

        let mut evicted = Vec::new();
        state.maintenance(SYMBOL_TTL_MS + 1, |symbol| evicted.push(symbol.to_string()));

        assert_eq!(evicted, vec!["BTCUSDT".to_string()]);
        assert!(state.state("BTCUSDT").is_none());
        assert!(state.state("ETHUSDT").is_some());
    }

    #[test]
    fn test_cap_eviction_drops_least_recently_updated() {
        let mut state = MarketState::new(2);
        state.update("AUSDT", 1_000, Some(1.0), None, None);
        state.update("BUSDT", 2_000, Some(1.0), None, None);
        state.update("CUSDT", 3_000, Some(1.0), None, None);

        let mut evicted = Vec::new();
        state.maintenance(4_000, |symbol| evicted.push(symbol.to_string()));

        assert_eq!(evicted, vec!["AUSDT".to_string()]);
        assert_eq!(state.len(), 2);
    }

    #[test]
    fn test_out_of_order_counter() {
        let mut state = MarketState::new(10);
        state.update("BTCUSDT", 1_000, Some(100.0), None, None);
        state.record_out_of_order("BTCUSDT");
        state.record_out_of_order("BTCUSDT");
        assert_eq!(state.state("BTCUSDT").unwrap().out_of_order_count, 2);
    }
}
