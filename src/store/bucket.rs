//! Dual-resolution OHLC-style bucket store over open interest, price, and
//! signed aggressive volume.
//!
//! Each symbol keeps two parallel bucket maps (15 s and 60 s). A map pairs a
//! hash map keyed by aligned bucket start with an incrementally maintained
//! sorted key index, so inserts are O(log n) and range scans never re-sort.

use crate::event::{sanitize_non_negative, sanitize_positive, MarketUpdate};
use fnv::FnvHashMap;

/// Bucket resolution.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Resolution {
    /// 15-second buckets, used for intervals of two minutes or less.
    Fast,
    /// 60-second buckets.
    Minute,
}

impl Resolution {
    pub fn size_ms(&self) -> i64 {
        match self {
            Resolution::Fast => 15_000,
            Resolution::Minute => 60_000,
        }
    }

    /// Resolution serving a trigger interval.
    pub fn for_interval_minutes(interval_minutes: u32) -> Self {
        if interval_minutes <= 2 {
            Resolution::Fast
        } else {
            Resolution::Minute
        }
    }

    pub fn align(&self, ts_ms: i64) -> i64 {
        let size = self.size_ms();
        ts_ms.div_euclid(size) * size
    }
}

/// One aggregation bucket. Optional fields stay unset until a record
/// supplies them.
#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub start_ms: i64,
    pub oi_open: Option<f64>,
    pub oi_close: Option<f64>,
    pub oi_high: Option<f64>,
    pub oi_low: Option<f64>,
    pub price_open: Option<f64>,
    pub price_close: Option<f64>,
    pub volume_buy: f64,
    pub volume_sell: f64,
    pub volume_buy_quote: f64,
    pub volume_sell_quote: f64,
    pub total_volume: f64,
    pub total_quote_volume: f64,
    pub count: u32,
    pub first_ts: i64,
    pub last_ts: i64,
}

impl Bucket {
    fn open(start_ms: i64, ts_ms: i64, oi: Option<f64>, price: Option<f64>) -> Self {
        let mut bucket = Self {
            start_ms,
            oi_open: oi,
            oi_close: oi,
            oi_high: oi,
            oi_low: oi,
            price_open: price,
            price_close: price,
            volume_buy: 0.0,
            volume_sell: 0.0,
            volume_buy_quote: 0.0,
            volume_sell_quote: 0.0,
            total_volume: 0.0,
            total_quote_volume: 0.0,
            count: 0,
            first_ts: ts_ms,
            last_ts: ts_ms,
        };
        bucket.rederive_totals();
        bucket
    }

    fn track_oi_extremes(&mut self, oi: f64) {
        self.oi_high = Some(self.oi_high.map_or(oi, |high| high.max(oi)));
        self.oi_low = Some(self.oi_low.map_or(oi, |low| low.min(oi)));
    }

    fn add_flow(&mut self, update: &MarketUpdate) {
        if let Some(buy) = sanitize_non_negative(update.volume_buy) {
            self.volume_buy += buy;
        }
        if let Some(sell) = sanitize_non_negative(update.volume_sell) {
            self.volume_sell += sell;
        }
        if let Some(buy_quote) = sanitize_non_negative(update.volume_buy_quote) {
            self.volume_buy_quote += buy_quote;
        }
        if let Some(sell_quote) = sanitize_non_negative(update.volume_sell_quote) {
            self.volume_sell_quote += sell_quote;
        }
        self.rederive_totals();
    }

    /// Totals are re-derived from the components after every addition so
    /// they cannot drift from the invariant `total == buy + sell`.
    fn rederive_totals(&mut self) {
        self.total_volume = self.volume_buy + self.volume_sell;
        self.total_quote_volume = self.volume_buy_quote + self.volume_sell_quote;
    }
}

/// Outcome of folding one record into the store.
#[derive(Debug, Clone, Copy, Default)]
pub struct AddPointOutcome {
    /// The record arrived with a timestamp earlier than an already
    /// populated bucket's first observation.
    pub out_of_order: bool,
}

/// Bucket map for one symbol at one resolution: hash map plus sorted index.
#[derive(Debug)]
struct BucketSeries {
    resolution: Resolution,
    capacity: usize,
    buckets: FnvHashMap<i64, Bucket>,
    index: Vec<i64>,
}

impl BucketSeries {
    fn new(resolution: Resolution, capacity: usize) -> Self {
        Self {
            resolution,
            capacity,
            buckets: FnvHashMap::default(),
            index: Vec::with_capacity(capacity.min(64)),
        }
    }

    fn len(&self) -> usize {
        self.index.len()
    }

    /// Fold a record into its bucket, creating the bucket lazily.
    /// Returns true when the record was out of order for an existing bucket.
    fn apply(
        &mut self,
        update: &MarketUpdate,
        price_fallback: Option<f64>,
        oi_fallback: Option<f64>,
    ) -> bool {
        let ts = update.timestamp_ms();
        let start = self.resolution.align(ts);
        let oi = sanitize_non_negative(update.open_interest);
        let price = sanitize_positive(update.price);

        let mut out_of_order = false;

        if !self.buckets.contains_key(&start) {
            let opening_oi = oi.or(oi_fallback);
            let opening_price = price.or(price_fallback);
            self.buckets
                .insert(start, Bucket::open(start, ts, opening_oi, opening_price));
            if let Err(position) = self.index.binary_search(&start) {
                self.index.insert(position, start);
            }
            self.enforce_retention();
        }

        // Retention may have evicted the slot when the record predates the
        // whole window.
        let Some(bucket) = self.buckets.get_mut(&start) else {
            return false;
        };

        if ts < bucket.first_ts {
            if bucket.count > 0 {
                out_of_order = true;
            }
            // A late record becomes the new opening observation.
            if let Some(oi) = oi {
                bucket.oi_open = Some(oi);
            }
            if let Some(price) = price {
                bucket.price_open = Some(price);
            }
            bucket.first_ts = ts;
        }

        if ts >= bucket.last_ts {
            if let Some(oi) = oi {
                bucket.oi_close = Some(oi);
            }
            if let Some(price) = price {
                bucket.price_close = Some(price);
            }
            bucket.last_ts = ts;
        }

        if let Some(oi) = oi {
            bucket.track_oi_extremes(oi);
        }

        bucket.add_flow(update);
        bucket.count += 1;

        out_of_order
    }

    fn enforce_retention(&mut self) {
        while self.index.len() > self.capacity {
            let oldest = self.index.remove(0);
            self.buckets.remove(&oldest);
        }
    }

    /// Buckets whose timespan intersects `[from_ms, to_ms]`, oldest first.
    fn range(&self, from_ms: i64, to_ms: i64) -> Vec<Bucket> {
        let size = self.resolution.size_ms();
        // A bucket starting one slot before `from_ms` may still overlap it.
        let lower = self.resolution.align(from_ms) - size;
        let start_pos = self.index.partition_point(|&key| key < lower);

        self.index[start_pos..]
            .iter()
            .take_while(|&&key| key <= to_ms)
            .filter(|&&key| key + size > from_ms)
            .filter_map(|key| self.buckets.get(key).cloned())
            .collect()
    }
}

/// Per-symbol dual-resolution bucket store.
#[derive(Debug)]
pub struct BucketStore {
    symbols: FnvHashMap<String, SymbolBuckets>,
    fast_capacity: usize,
    minute_capacity: usize,
}

#[derive(Debug)]
struct SymbolBuckets {
    fast: BucketSeries,
    minute: BucketSeries,
}

impl BucketStore {
    pub fn new(fast_capacity: usize, minute_capacity: usize) -> Self {
        Self {
            symbols: FnvHashMap::default(),
            fast_capacity,
            minute_capacity,
        }
    }

    /// Fold a record into both resolutions for its symbol.
    ///
    /// `price_fallback` / `oi_fallback` seed the opening values of lazily
    /// created buckets when the record itself does not carry the field.
    pub fn add_point(
        &mut self,
        update: &MarketUpdate,
        price_fallback: Option<f64>,
        oi_fallback: Option<f64>,
    ) -> AddPointOutcome {
        let fast_capacity = self.fast_capacity;
        let minute_capacity = self.minute_capacity;
        let entry = self
            .symbols
            .entry(update.symbol.clone())
            .or_insert_with(|| SymbolBuckets {
                fast: BucketSeries::new(Resolution::Fast, fast_capacity),
                minute: BucketSeries::new(Resolution::Minute, minute_capacity),
            });

        let late_fast = entry.fast.apply(update, price_fallback, oi_fallback);
        let late_minute = entry.minute.apply(update, price_fallback, oi_fallback);

        AddPointOutcome {
            // One record counts once even when both resolutions saw it late.
            out_of_order: late_fast || late_minute,
        }
    }

    /// Clone the buckets intersecting `[from_ms, to_ms]`, oldest first.
    pub fn buckets_in_range(
        &self,
        symbol: &str,
        from_ms: i64,
        to_ms: i64,
        resolution: Resolution,
    ) -> Vec<Bucket> {
        match self.symbols.get(symbol) {
            Some(entry) => match resolution {
                Resolution::Fast => entry.fast.range(from_ms, to_ms),
                Resolution::Minute => entry.minute.range(from_ms, to_ms),
            },
            None => Vec::new(),
        }
    }

    /// Drop all buckets for an evicted symbol.
    pub fn cleanup_symbol(&mut self, symbol: &str) {
        self.symbols.remove(symbol);
    }

    /// Larger of the two per-resolution map sizes.
    pub fn history_length(&self, symbol: &str) -> usize {
        self.symbols
            .get(symbol)
            .map(|entry| entry.fast.len().max(entry.minute.len()))
            .unwrap_or(0)
    }

    pub fn tracked_symbols(&self) -> usize {
        self.symbols.len()
    }
}
