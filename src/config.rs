//! Environment-driven configuration, read once at startup.

use crate::event::{Exchange, MarketType, ProviderId};
use tracing::warn;

/// Engine configuration with spec defaults. Every knob is overridable via
/// environment variables; unparseable values fall back with a warning.
#[derive(Debug, Clone)]
pub struct Config {
    pub providers: Vec<ProviderId>,
    pub max_tracked_symbols: usize,
    pub max_minute_buckets: usize,
    pub max_15s_buckets: usize,
    /// Multiplier on bucket size bounding how far a boundary interpolation
    /// may reach for a supporting bucket.
    pub fallback_shift_multiplier: u32,
    /// Market-state maintenance tick, ms.
    pub symbol_check_interval_ms: u64,
    pub batch_processing_size: usize,
    pub flush_ms: u64,
    pub metric_cache_ttl_ms: i64,
    pub min_check_interval_ms: i64,
    pub debounce_threshold: u32,
}

impl Default for Config {
    fn default() -> Self {
        Self {
            providers: vec![ProviderId::new(Exchange::Binance, MarketType::Futures)],
            max_tracked_symbols: 2_000,
            max_minute_buckets: 70,
            max_15s_buckets: 300,
            fallback_shift_multiplier: 2,
            symbol_check_interval_ms: 5_000,
            batch_processing_size: 10,
            flush_ms: 200,
            metric_cache_ttl_ms: 500,
            min_check_interval_ms: 1_000,
            debounce_threshold: 3,
        }
    }
}

impl Config {
    /// Build the configuration from the process environment.
    pub fn from_env() -> Self {
        let defaults = Config::default();
        Self {
            providers: parse_providers(),
            max_tracked_symbols: env_parse("MAX_TRACKED_SYMBOLS", defaults.max_tracked_symbols),
            max_minute_buckets: env_parse("MAX_MINUTE_BUCKETS", defaults.max_minute_buckets),
            max_15s_buckets: env_parse("MAX_15S_BUCKETS", defaults.max_15s_buckets),
            fallback_shift_multiplier: env_parse(
                "FALLBACK_SHIFT_MULTIPLIER",
                defaults.fallback_shift_multiplier,
            ),
            symbol_check_interval_ms: env_parse(
                "SYMBOL_CHECK_INTERVAL",
                defaults.symbol_check_interval_ms,
            ),
            batch_processing_size: env_parse(
                "BATCH_PROCESSING_SIZE",
                defaults.batch_processing_size,
            ),
            flush_ms: env_parse("TRIGGER_ENGINE_FLUSH_MS", defaults.flush_ms),
            metric_cache_ttl_ms: env_parse(
                "TRIGGER_ENGINE_METRIC_CACHE_TTL_MS",
                defaults.metric_cache_ttl_ms,
            ),
            min_check_interval_ms: env_parse(
                "MIN_CHECK_INTERVAL_MS",
                defaults.min_check_interval_ms,
            ),
            debounce_threshold: env_parse(
                "TRIGGER_ENGINE_DEBOUNCE_THRESHOLD",
                defaults.debounce_threshold,
            ),
        }
    }
}

fn env_parse<T: std::str::FromStr + Copy>(key: &str, default: T) -> T {
    match std::env::var(key) {
        Ok(raw) => match raw.trim().parse::<T>() {
            Ok(value) => value,
            Err(_) => {
                warn!(key, raw = %raw, "unparseable value, using default");
                default
            }
        },
        Err(_) => default,
    }
}

/// Global market-type fallback from `MARKET_TYPE` (default spot).
fn global_market_type() -> MarketType {
    std::env::var("MARKET_TYPE")
        .ok()
        .and_then(|raw| MarketType::parse(&raw))
        .unwrap_or(MarketType::Spot)
}

/// Per-exchange override, e.g. `BINANCE_MARKET_TYPE=futures`.
fn exchange_market_type(exchange: Exchange) -> Option<MarketType> {
    let key = format!("{}_MARKET_TYPE", exchange.as_str().to_uppercase());
    std::env::var(key).ok().and_then(|raw| MarketType::parse(&raw))
}

/// Parse `MARKET_DATA_PROVIDERS`, comma-separated, each entry either a bare
/// exchange name or `exchange:marketType`. Falls back to a single default
/// provider when nothing parses.
fn parse_providers() -> Vec<ProviderId> {
    let raw = std::env::var("MARKET_DATA_PROVIDERS").unwrap_or_default();
    let mut providers = Vec::new();

    for entry in raw.split(',') {
        let entry = entry.trim();
        if entry.is_empty() {
            continue;
        }

        let (exchange_raw, inline_type) = match entry.split_once(':') {
            Some((ex, mt)) => (ex, MarketType::parse(mt)),
            None => (entry, None),
        };

        let Some(exchange) = Exchange::parse(exchange_raw) else {
            warn!(entry, "unknown provider entry, skipping");
            continue;
        };

        let market_type = inline_type
            .or_else(|| exchange_market_type(exchange))
            .unwrap_or_else(global_market_type);

        let id = ProviderId::new(exchange, market_type);
        if !providers.contains(&id) {
            providers.push(id);
        }
    }

    if providers.is_empty() {
        let fallback = ProviderId::new(Exchange::Binance, MarketType::Futures);
        warn!(%fallback, "no providers configured, falling back to default");
        providers.push(fallback);
    }

    providers
}
