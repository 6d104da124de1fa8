//! Window queries over the aggregation stores.
//!
//! The primary open-interest change follows the max-deviation rule: measure
//! the live value against both the window minimum and the window maximum and
//! keep whichever move is larger in magnitude, preserving sign. When no live
//! value is available the calculator falls back to boundary interpolation.

use crate::store::bucket::{Bucket, BucketStore, Resolution};
use crate::store::market::MarketState;
use parking_lot::RwLock;
use std::sync::Arc;

/// Ephemeral result of one window query.
#[derive(Debug, Clone, PartialEq)]
pub struct Metrics {
    pub oi_change_percent: f64,
    /// Extremum (or interpolated boundary) the change was measured from.
    pub oi_start: f64,
    pub oi_end: f64,
    pub price_change_percent: Option<f64>,
    pub current_price: Option<f64>,
    pub previous_price: Option<f64>,
    pub total_volume: f64,
    pub delta_volume: f64,
    pub total_quote_volume: f64,
    pub delta_quote_volume: f64,
    pub volume_baseline: f64,
    pub volume_baseline_quote: f64,
    pub volume_ratio: Option<f64>,
    pub volume_ratio_quote: Option<f64>,
    pub time_window_seconds: u32,
}

/// Signed volume sums over one window.
#[derive(Debug, Clone, Copy, Default, PartialEq)]
struct VolumeSums {
    buy: f64,
    sell: f64,
    buy_quote: f64,
    sell_quote: f64,
}

impl VolumeSums {
    fn total(&self) -> f64 {
        self.buy + self.sell
    }

    fn delta(&self) -> f64 {
        self.buy - self.sell
    }

    fn total_quote(&self) -> f64 {
        self.buy_quote + self.sell_quote
    }

    fn delta_quote(&self) -> f64 {
        self.buy_quote - self.sell_quote
    }
}

#[derive(Debug, Default)]
struct WindowScan {
    min_oi: Option<f64>,
    max_oi: Option<f64>,
    min_price: Option<f64>,
    max_price: Option<f64>,
    volumes: VolumeSums,
    earliest_open_price: Option<f64>,
}

impl WindowScan {
    fn fold_oi(&mut self, value: Option<f64>) {
        if let Some(value) = value.filter(|v| v.is_finite()) {
            self.min_oi = Some(self.min_oi.map_or(value, |min| min.min(value)));
            self.max_oi = Some(self.max_oi.map_or(value, |max| max.max(value)));
        }
    }

    fn fold_price(&mut self, value: Option<f64>) {
        if let Some(value) = value.filter(|v| v.is_finite() && *v > 0.0) {
            self.min_price = Some(self.min_price.map_or(value, |min| min.min(value)));
            self.max_price = Some(self.max_price.map_or(value, |max| max.max(value)));
        }
    }
}

/// Read-side calculator over the shared stores.
#[derive(Clone)]
pub struct MetricsCalculator {
    buckets: Arc<RwLock<BucketStore>>,
    market: Arc<RwLock<MarketState>>,
    shift_multiplier: i64,
}

impl MetricsCalculator {
    pub fn new(
        buckets: Arc<RwLock<BucketStore>>,
        market: Arc<RwLock<MarketState>>,
        shift_multiplier: u32,
    ) -> Self {
        Self {
            buckets,
            market,
            shift_multiplier: shift_multiplier.max(1) as i64,
        }
    }

    /// Window query for `symbol` over the trailing `interval_minutes`.
    ///
    /// Returns `None` during warmup, when no buckets exist, or when the
    /// open-interest change cannot be established at all.
    pub fn metric_changes(
        &self,
        symbol: &str,
        interval_minutes: u32,
        now_ms: i64,
    ) -> Option<Metrics> {
        let interval_ms = i64::from(interval_minutes) * 60_000;
        let resolution = Resolution::for_interval_minutes(interval_minutes);
        let size = resolution.size_ms();

        let (first_seen, current_price, current_oi) = {
            let market = self.market.read();
            let state = market.state(symbol)?;
            (state.first_seen_ms, state.last_price, state.last_oi)
        };

        // Warmup: the symbol must have been observed for the whole window.
        if first_seen > now_ms - interval_ms {
            return None;
        }

        let window_start = now_ms - interval_ms;
        let window_end = now_ms;
        let max_reach = (self.shift_multiplier * size).min(interval_ms / 20).max(1);

        let extended = self.buckets.read().buckets_in_range(
            symbol,
            window_start - max_reach - size,
            window_end,
            resolution,
        );
        if extended.is_empty() {
            return None;
        }

        let scan = scan_window(&extended, window_start, window_end, size);

        let mut oi_scan_min = scan.min_oi;
        let mut oi_scan_max = scan.max_oi;
        if let Some(cur) = current_oi.filter(|v| v.is_finite()) {
            oi_scan_min = Some(oi_scan_min.map_or(cur, |min| min.min(cur)));
            oi_scan_max = Some(oi_scan_max.map_or(cur, |max| max.max(cur)));
        }

        // Primary rule: live value against window extrema.
        let oi_change = match (current_oi, oi_scan_min, oi_scan_max) {
            (Some(cur), Some(min), Some(max)) => {
                max_deviation_change(cur, min, max).map(|(change, reference)| (change, reference, cur))
            }
            _ => None,
        };

        // Fallback: interpolate both boundaries.
        let (oi_change_percent, oi_start, oi_end) = match oi_change {
            Some(result) => result,
            None => {
                let start =
                    interpolate_boundary(&extended, window_start, max_reach, oi_open, oi_close)?;
                let end =
                    interpolate_boundary(&extended, window_end, max_reach, oi_open, oi_close)?;
                if start <= 0.0 {
                    return None;
                }
                ((end - start) / start * 100.0, start, end)
            }
        };

        let mut price_scan_min = scan.min_price;
        let mut price_scan_max = scan.max_price;
        if let Some(cur) = current_price.filter(|v| v.is_finite() && *v > 0.0) {
            price_scan_min = Some(price_scan_min.map_or(cur, |min| min.min(cur)));
            price_scan_max = Some(price_scan_max.map_or(cur, |max| max.max(cur)));
        }

        let price_result = match (current_price, price_scan_min, price_scan_max) {
            (Some(cur), Some(min), Some(max)) => {
                max_deviation_change(cur, min, max).map(|(change, reference)| (change, reference, cur))
            }
            _ => None,
        }
        .or_else(|| {
            let start = interpolate_boundary(
                &extended,
                window_start,
                max_reach,
                price_open,
                price_close,
            )
            .or(scan.earliest_open_price)?;
            let end =
                interpolate_boundary(&extended, window_end, max_reach, price_open, price_close)
                    .or(current_price)?;
            (start > 0.0).then(|| ((end - start) / start * 100.0, start, end))
        });

        let baseline = scan_window(
            &self.buckets.read().buckets_in_range(
                symbol,
                window_start - interval_ms,
                window_start,
                resolution,
            ),
            window_start - interval_ms,
            window_start,
            size,
        )
        .volumes;

        let volume_ratio = (baseline.total() > 0.0).then(|| scan.volumes.total() / baseline.total());
        let volume_ratio_quote =
            (baseline.total_quote() > 0.0).then(|| scan.volumes.total_quote() / baseline.total_quote());

        Some(Metrics {
            oi_change_percent: round6(oi_change_percent),
            oi_start,
            oi_end,
            price_change_percent: price_result.map(|(change, _, _)| round6(change)),
            current_price: price_result.map(|(_, _, end)| end).or(current_price),
            previous_price: price_result.map(|(_, start, _)| start),
            total_volume: scan.volumes.total(),
            delta_volume: scan.volumes.delta(),
            total_quote_volume: scan.volumes.total_quote(),
            delta_quote_volume: scan.volumes.delta_quote(),
            volume_baseline: baseline.total(),
            volume_baseline_quote: baseline.total_quote(),
            volume_ratio,
            volume_ratio_quote,
            time_window_seconds: interval_minutes * 60,
        })
    }
}

fn oi_open(bucket: &Bucket) -> Option<f64> {
    bucket.oi_open
}

fn oi_close(bucket: &Bucket) -> Option<f64> {
    bucket.oi_close
}

fn price_open(bucket: &Bucket) -> Option<f64> {
    bucket.price_open
}

fn price_close(bucket: &Bucket) -> Option<f64> {
    bucket.price_close
}

/// Scan buckets intersecting the window, folding extrema and the
/// overlap-weighted signed volume sums.
fn scan_window(buckets: &[Bucket], window_start: i64, window_end: i64, size_ms: i64) -> WindowScan {
    let mut scan = WindowScan::default();

    for bucket in buckets {
        let bucket_end = bucket.start_ms + size_ms;
        let overlap = window_end.min(bucket_end) - window_start.max(bucket.start_ms);
        if overlap <= 0 {
            continue;
        }

        scan.fold_oi(bucket.oi_open);
        scan.fold_oi(bucket.oi_close);
        scan.fold_oi(bucket.oi_high);
        scan.fold_oi(bucket.oi_low);
        scan.fold_price(bucket.price_open);
        scan.fold_price(bucket.price_close);

        if scan.earliest_open_price.is_none() {
            scan.earliest_open_price = bucket.price_open.filter(|p| *p > 0.0);
        }

        // Buckets partially inside the window contribute proportionally.
        let fraction = (overlap as f64 / size_ms as f64).clamp(0.0, 1.0);
        scan.volumes.buy += bucket.volume_buy * fraction;
        scan.volumes.sell += bucket.volume_sell * fraction;
        scan.volumes.buy_quote += bucket.volume_buy_quote * fraction;
        scan.volumes.sell_quote += bucket.volume_sell_quote * fraction;
    }

    scan
}

/// Max-deviation rule: measure `current` against both extrema and keep the
/// move with the larger magnitude. Returns `(change_percent, reference)`.
fn max_deviation_change(current: f64, min: f64, max: f64) -> Option<(f64, f64)> {
    let from_min = (min > 0.0).then(|| (current - min) / min * 100.0);
    let from_max = (max > 0.0).then(|| (current - max) / max * 100.0);

    match (from_min, from_max) {
        (Some(up), Some(down)) => {
            if up.abs() >= down.abs() {
                Some((up, min))
            } else {
                Some((down, max))
            }
        }
        (Some(up), None) => Some((up, min)),
        (None, Some(down)) => Some((down, max)),
        (None, None) => None,
    }
}

/// Point-in-time boundary interpolation over a sorted bucket slice.
///
/// Prefers interpolating inside the bucket covering the boundary; otherwise
/// uses the nearest closing observation before and opening observation after,
/// rejecting supports further than `max_reach` from the boundary.
fn interpolate_boundary(
    buckets: &[Bucket],
    boundary_ms: i64,
    max_reach: i64,
    open: fn(&Bucket) -> Option<f64>,
    close: fn(&Bucket) -> Option<f64>,
) -> Option<f64> {
    if buckets.is_empty() {
        return None;
    }

    // Last bucket at or before the boundary.
    let position = buckets.partition_point(|b| b.start_ms <= boundary_ms);
    let covering = position.checked_sub(1).map(|i| &buckets[i]);

    if let Some(bucket) = covering {
        if bucket.first_ts <= boundary_ms && boundary_ms <= bucket.last_ts {
            match (open(bucket), close(bucket)) {
                (Some(open_value), Some(close_value)) => {
                    return Some(lerp(
                        bucket.first_ts,
                        open_value,
                        bucket.last_ts,
                        close_value,
                        boundary_ms,
                    ));
                }
                (Some(only), None) | (None, Some(only)) => return Some(only),
                (None, None) => {}
            }
        }
    }

    // Nearest supports either side of the boundary.
    let before = buckets[..position]
        .iter()
        .rev()
        .find(|b| b.last_ts <= boundary_ms && close(b).is_some())
        .filter(|b| boundary_ms - b.last_ts <= max_reach);
    let after = buckets
        .iter()
        .find(|b| b.first_ts >= boundary_ms && open(b).is_some())
        .filter(|b| b.first_ts - boundary_ms <= max_reach);

    match (before, after) {
        (Some(prev), Some(next)) => Some(lerp(
            prev.last_ts,
            close(prev).expect("filtered above"),
            next.first_ts,
            open(next).expect("filtered above"),
            boundary_ms,
        )),
        (Some(prev), None) => close(prev),
        (None, Some(next)) => open(next),
        (None, None) => None,
    }
}

fn lerp(t0: i64, v0: f64, t1: i64, v1: f64, t: i64) -> f64 {
    if t1 <= t0 {
        return v1;
    }
    let fraction = (t - t0) as f64 / (t1 - t0) as f64;
    v0 + (v1 - v0) * fraction.clamp(0.0, 1.0)
}

fn round6(value: f64) -> f64 {
    (value * 1e6).round() / 1e6
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Exchange, MarketType, MarketUpdate, ProviderId};
    use chrono::{TimeZone, Utc};

    struct Fixture {
        buckets: Arc<RwLock<BucketStore>>,
        market: Arc<RwLock<MarketState>>,
        calc: MetricsCalculator,
    }

    fn fixture() -> Fixture {
        let buckets = Arc::new(RwLock::new(BucketStore::new(300, 70)));
        let market = Arc::new(RwLock::new(MarketState::new(2_000)));
        let calc = MetricsCalculator::new(buckets.clone(), market.clone(), 2);
        Fixture {
            buckets,
            market,
            calc,
        }
    }

    fn feed(fixture: &Fixture, ts_ms: i64, price: Option<f64>, oi: Option<f64>) {
        let provider = ProviderId::new(Exchange::Binance, MarketType::Futures);
        let update = MarketUpdate {
            price,
            open_interest: oi,
            ..MarketUpdate::new(provider, "BTCUSDT", Utc.timestamp_millis_opt(ts_ms).unwrap())
        };
        let mut market = fixture.market.write();
        let price_fallback = market.price("BTCUSDT");
        let oi_fallback = market.open_interest("BTCUSDT");
        market.update("BTCUSDT", ts_ms, price, oi, None);
        fixture
            .buckets
            .write()
            .add_point(&update, price_fallback, oi_fallback);
    }

    #[test]
    fn test_linear_rise_reports_change_from_minimum() {
        let fx = fixture();
        // 1 Hz samples, OI 100 -> 106 over one minute.
        for i in 0..=60i64 {
            let oi = 100.0 + 6.0 * (i as f64 / 60.0);
            feed(&fx, i * 1_000, Some(50_000.0), Some(oi));
        }

        let metrics = fx.calc.metric_changes("BTCUSDT", 1, 60_000).unwrap();
        assert!(
            (metrics.oi_change_percent - 6.0).abs() < 0.2,
            "got {}",
            metrics.oi_change_percent
        );
        assert_eq!(metrics.oi_end, 106.0);
        assert_eq!(metrics.time_window_seconds, 60);
    }

    #[test]
    fn test_max_deviation_prefers_larger_drawdown() {
        let fx = fixture();
        // 100 for 0..20s, 120 for 20..40s, 108 for 40..60s.
        for i in 0..60i64 {
            let oi = match i {
                0..=19 => 100.0,
                20..=39 => 120.0,
                _ => 108.0,
            };
            feed(&fx, i * 1_000, Some(50_000.0), Some(oi));
        }

        let metrics = fx.calc.metric_changes("BTCUSDT", 1, 60_000).unwrap();
        // Peak-to-now drawdown (108 vs 120 = -10%) beats trough-to-now (+8%).
        assert!(
            (metrics.oi_change_percent + 10.0).abs() < 0.01,
            "got {}",
            metrics.oi_change_percent
        );
        assert_eq!(metrics.oi_start, 120.0);
        assert_eq!(metrics.oi_end, 108.0);
    }

    #[test]
    fn test_warmup_rejection() {
        let fx = fixture();
        let first_seen = 10 * 60_000;
        for i in 0..=120i64 {
            feed(&fx, first_seen + i * 1_000, Some(50_000.0), Some(100.0));
        }

        // 5-minute interval only 120s after first observation.
        let now = first_seen + 120_000;
        assert!(fx.calc.metric_changes("BTCUSDT", 5, now).is_none());

        // After warmup elapses the result is non-null.
        for i in 121..=301i64 {
            feed(&fx, first_seen + i * 1_000, Some(50_000.0), Some(100.0));
        }
        let now = first_seen + 301_000;
        assert!(fx.calc.metric_changes("BTCUSDT", 5, now).is_some());
    }

    #[test]
    fn test_unknown_symbol_is_null() {
        let fx = fixture();
        assert!(fx.calc.metric_changes("ETHUSDT", 1, 60_000).is_none());
    }

    #[test]
    fn test_fallback_interpolation_without_live_oi() {
        let fx = fixture();
        let provider = ProviderId::new(Exchange::Binance, MarketType::Futures);

        // Buckets carry OI, but market state never saw one (forces fallback).
        for i in 0..=60i64 {
            let ts = i * 1_000;
            let update = MarketUpdate {
                open_interest: Some(100.0 + i as f64 * 0.1),
                ..MarketUpdate::new(provider, "BTCUSDT", Utc.timestamp_millis_opt(ts).unwrap())
            };
            fx.buckets.write().add_point(&update, None, None);
            fx.market.write().update("BTCUSDT", ts, Some(50_000.0), None, None);
        }

        let metrics = fx.calc.metric_changes("BTCUSDT", 1, 60_000).unwrap();
        // 100 -> 106 via boundary interpolation, ~6%.
        assert!(
            (metrics.oi_change_percent - 6.0).abs() < 0.5,
            "got {}",
            metrics.oi_change_percent
        );
    }

    #[test]
    fn test_price_change_and_rounding() {
        let fx = fixture();
        for i in 0..=60i64 {
            let price = 30_000.0 + i as f64;
            feed(&fx, i * 1_000, Some(price), Some(100.0));
        }

        let metrics = fx.calc.metric_changes("BTCUSDT", 1, 60_000).unwrap();
        let price_change = metrics.price_change_percent.unwrap();
        // Six decimal places.
        assert_eq!(price_change, round6(price_change));
        assert!(price_change > 0.0);
        assert_eq!(metrics.current_price, Some(30_060.0));
    }

    #[test]
    fn test_volume_sums_and_zero_baseline_ratio() {
        let fx = fixture();
        let provider = ProviderId::new(Exchange::Binance, MarketType::Futures);

        // OI and price throughout; signed flow only in the last minute, so
        // the baseline window (60..120 s) carries no flow at all.
        for i in 0..180i64 {
            let ts = i * 1_000;
            let in_last_minute = i >= 120;
            let update = MarketUpdate {
                open_interest: Some(100.0),
                price: Some(10.0),
                volume_buy: in_last_minute.then_some(2.0),
                volume_sell: in_last_minute.then_some(1.0),
                volume_buy_quote: in_last_minute.then_some(20.0),
                volume_sell_quote: in_last_minute.then_some(10.0),
                ..MarketUpdate::new(provider, "BTCUSDT", Utc.timestamp_millis_opt(ts).unwrap())
            };
            fx.market
                .write()
                .update("BTCUSDT", ts, Some(10.0), Some(100.0), None);
            fx.buckets.write().add_point(&update, None, None);
        }

        let metrics = fx.calc.metric_changes("BTCUSDT", 1, 180_000).unwrap();
        // 60 samples of buy 2 / sell 1.
        assert!((metrics.total_volume - 180.0).abs() < 1.0);
        assert!((metrics.delta_volume - 60.0).abs() < 1.0);
        assert!((metrics.total_quote_volume - 1_800.0).abs() < 10.0);
        assert_eq!(metrics.volume_baseline, 0.0);
        assert!(metrics.volume_ratio.is_none());
        assert!(metrics.volume_ratio_quote.is_none());
    }

    #[test]
    fn test_boundary_interpolation_rejects_distant_support() {
        // One bucket far before the boundary, nothing after.
        let mut store = BucketStore::new(300, 70);
        let provider = ProviderId::new(Exchange::Binance, MarketType::Futures);
        let update = MarketUpdate {
            open_interest: Some(100.0),
            ..MarketUpdate::new(provider, "BTCUSDT", Utc.timestamp_millis_opt(0).unwrap())
        };
        store.add_point(&update, None, None);
        let buckets = store.buckets_in_range("BTCUSDT", -60_000, 600_000, Resolution::Fast);

        // Support is 120s away; reach capped at 30s.
        let value = interpolate_boundary(&buckets, 120_000, 30_000, oi_open, oi_close);
        assert!(value.is_none());

        // Within reach it resolves to the closing observation.
        let value = interpolate_boundary(&buckets, 20_000, 30_000, oi_open, oi_close);
        assert_eq!(value, Some(100.0));
    }

    #[test]
    fn test_max_deviation_rule() {
        // Rising from trough dominates.
        let (change, reference) = max_deviation_change(106.0, 100.0, 106.0).unwrap();
        assert!((change - 6.0).abs() < 1e-9);
        assert_eq!(reference, 100.0);

        // Drawdown from peak dominates.
        let (change, reference) = max_deviation_change(108.0, 100.0, 120.0).unwrap();
        assert!((change + 10.0).abs() < 1e-9);
        assert_eq!(reference, 120.0);

        // Non-positive extrema are unavailable as divisors.
        assert!(max_deviation_change(10.0, 0.0, 0.0).is_none());
    }
}
