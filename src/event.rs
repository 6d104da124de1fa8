//! Core data types for normalized market updates.
//!
//! Every venue connector translates its wire payloads into [`MarketUpdate`]
//! records before they enter the aggregation layer.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Quote asset suffix all tracked symbols must terminate in.
pub const QUOTE_SUFFIX: &str = "USDT";

/// Supported venues.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Exchange {
    Binance,
    Bybit,
    Okx,
}

impl Exchange {
    pub fn as_str(&self) -> &'static str {
        match self {
            Exchange::Binance => "binance",
            Exchange::Bybit => "bybit",
            Exchange::Okx => "okx",
        }
    }

    /// Parse a venue name as it appears in `MARKET_DATA_PROVIDERS`.
    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "binance" => Some(Exchange::Binance),
            "bybit" => Some(Exchange::Bybit),
            "okx" => Some(Exchange::Okx),
            _ => None,
        }
    }
}

impl fmt::Display for Exchange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Market segment a provider serves.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum MarketType {
    Spot,
    Futures,
}

impl MarketType {
    pub fn as_str(&self) -> &'static str {
        match self {
            MarketType::Spot => "spot",
            MarketType::Futures => "futures",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        match raw.trim().to_lowercase().as_str() {
            "spot" => Some(MarketType::Spot),
            "futures" | "perp" | "perpetual" | "linear" => Some(MarketType::Futures),
            _ => None,
        }
    }
}

impl fmt::Display for MarketType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Provider identity, e.g. `binance-futures`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Deserialize, Serialize)]
pub struct ProviderId {
    pub exchange: Exchange,
    pub market_type: MarketType,
}

impl ProviderId {
    pub fn new(exchange: Exchange, market_type: MarketType) -> Self {
        Self {
            exchange,
            market_type,
        }
    }
}

impl fmt::Display for ProviderId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}-{}", self.exchange, self.market_type)
    }
}

/// Trade aggressor side.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum Side {
    Buy,
    Sell,
}

impl Side {
    pub fn as_str(&self) -> &'static str {
        match self {
            Side::Buy => "Buy",
            Side::Sell => "Sell",
        }
    }
}

impl fmt::Display for Side {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Normalized ingress record produced by every provider.
///
/// Field absence means "no update for that field in this record". All
/// monetary values are non-negative finite numbers; records violating that
/// are dropped at the provider boundary.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct MarketUpdate {
    pub provider: ProviderId,
    pub symbol: String,
    pub time: DateTime<Utc>,
    pub price: Option<f64>,
    pub open_interest: Option<f64>,
    /// Venue timestamp of the open interest reading, when reported.
    pub open_interest_time: Option<DateTime<Utc>>,
    pub volume: Option<f64>,
    pub quote_volume: Option<f64>,
    pub mark_price: Option<f64>,
    pub funding_rate: Option<f64>,
    /// Taker buy volume in base units since the last flush.
    pub volume_buy: Option<f64>,
    /// Taker sell volume in base units since the last flush.
    pub volume_sell: Option<f64>,
    pub volume_buy_quote: Option<f64>,
    pub volume_sell_quote: Option<f64>,
}

impl MarketUpdate {
    /// Empty record for `symbol` stamped with `time`.
    pub fn new(provider: ProviderId, symbol: impl Into<String>, time: DateTime<Utc>) -> Self {
        Self {
            provider,
            symbol: symbol.into(),
            time,
            price: None,
            open_interest: None,
            open_interest_time: None,
            volume: None,
            quote_volume: None,
            mark_price: None,
            funding_rate: None,
            volume_buy: None,
            volume_sell: None,
            volume_buy_quote: None,
            volume_sell_quote: None,
        }
    }

    /// True when the record carries at least one data field.
    pub fn has_payload(&self) -> bool {
        self.price.is_some()
            || self.open_interest.is_some()
            || self.volume.is_some()
            || self.quote_volume.is_some()
            || self.mark_price.is_some()
            || self.funding_rate.is_some()
            || self.volume_buy.is_some()
            || self.volume_sell.is_some()
    }

    pub fn timestamp_ms(&self) -> i64 {
        self.time.timestamp_millis()
    }
}

/// Validate an upper-case ticker terminating in the quote suffix,
/// shape `^[A-Z][A-Z0-9]*USDT$`.
pub fn is_valid_symbol(symbol: &str) -> bool {
    let Some(base) = symbol.strip_suffix(QUOTE_SUFFIX) else {
        return false;
    };
    let mut chars = base.chars();
    match chars.next() {
        Some(first) if first.is_ascii_uppercase() => {}
        _ => return false,
    }
    chars.all(|c| c.is_ascii_uppercase() || c.is_ascii_digit())
}

/// Accept a finite, non-negative monetary value; anything else is "absent".
pub fn sanitize_non_negative(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v >= 0.0)
}

/// Accept a finite, strictly positive value (prices, divisors).
pub fn sanitize_positive(value: Option<f64>) -> Option<f64> {
    value.filter(|v| v.is_finite() && *v > 0.0)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_provider_id_display() {
        let id = ProviderId::new(Exchange::Binance, MarketType::Futures);
        assert_eq!(id.to_string(), "binance-futures");
        let id = ProviderId::new(Exchange::Bybit, MarketType::Spot);
        assert_eq!(id.to_string(), "bybit-spot");
    }

    #[test]
    fn test_symbol_validation() {
        struct TestCase {
            input: &'static str,
            expected: bool,
        }

        let tests = vec![
            // TC0: plain ticker
            TestCase {
                input: "BTCUSDT",
                expected: true,
            },
            // TC1: leading digit rejected
            TestCase {
                input: "1000PEPEUSDT",
                expected: false,
            },
            // TC2: digit allowed once the first char is a letter
            TestCase {
                input: "API3USDT",
                expected: true,
            },
            // TC3: wrong quote asset
            TestCase {
                input: "BTCUSD",
                expected: false,
            },
            // TC4: lower-case rejected
            TestCase {
                input: "btcusdt",
                expected: false,
            },
            // TC5: bare suffix rejected
            TestCase {
                input: "USDT",
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(
                is_valid_symbol(test.input),
                test.expected,
                "TC{} failed",
                index
            );
        }
    }

    #[test]
    fn test_sanitize() {
        assert_eq!(sanitize_non_negative(Some(0.0)), Some(0.0));
        assert_eq!(sanitize_non_negative(Some(-1.0)), None);
        assert_eq!(sanitize_non_negative(Some(f64::NAN)), None);
        assert_eq!(sanitize_non_negative(Some(f64::INFINITY)), None);
        assert_eq!(sanitize_positive(Some(0.0)), None);
        assert_eq!(sanitize_positive(Some(12.5)), Some(12.5));
    }

    #[test]
    fn test_empty_update_has_no_payload() {
        let provider = ProviderId::new(Exchange::Okx, MarketType::Futures);
        let update = MarketUpdate::new(provider, "BTCUSDT", Utc::now());
        assert!(!update.has_payload());

        let update = MarketUpdate {
            price: Some(64_000.0),
            ..update
        };
        assert!(update.has_payload());
    }
}
