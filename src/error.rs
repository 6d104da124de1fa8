use crate::event::ProviderId;
use thiserror::Error;

/// Errors generated by venue connectors and the ingestion layer.
#[derive(Debug, Clone, Error)]
pub enum FeedError {
    #[error("websocket error ({provider}): {detail}")]
    Socket { provider: ProviderId, detail: String },

    #[error("instrument catalog fetch failed ({provider}): {detail}")]
    Catalog { provider: ProviderId, detail: String },

    #[error("rest request failed ({provider}): {detail}")]
    Rest { provider: ProviderId, detail: String },

    #[error("subscription rejected ({provider}): {symbol}")]
    SubscriptionRejected { provider: ProviderId, symbol: String },

    #[error("provider not connected: {0}")]
    NotConnected(ProviderId),

    #[error("no providers connected")]
    NoProvidersConnected,
}

impl FeedError {
    /// Determine if a transport error requires the connection loop to
    /// re-initialise rather than continue reading.
    pub fn is_terminal(&self) -> bool {
        match self {
            FeedError::Socket { detail, .. } => {
                let detail = detail.to_lowercase();
                detail.contains("closed")
                    || detail.contains("terminated")
                    || detail.contains("reset")
                    || detail.contains("io(")
                    || detail.contains("timeout")
            }
            FeedError::NotConnected(_) | FeedError::NoProvidersConnected => true,
            _ => false,
        }
    }
}

/// Errors surfaced by the trigger and signal repositories.
#[derive(Debug, Clone, Error)]
pub enum StoreError {
    #[error("repository unavailable: {0}")]
    Unavailable(String),

    #[error("invalid trigger spec: {0}")]
    InvalidSpec(String),
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::event::{Exchange, MarketType};

    fn provider() -> ProviderId {
        ProviderId::new(Exchange::Binance, MarketType::Futures)
    }

    #[test]
    fn test_feed_error_is_terminal() {
        struct TestCase {
            input: FeedError,
            expected: bool,
        }

        let tests = vec![
            // TC0: closed connection is terminal
            TestCase {
                input: FeedError::Socket {
                    provider: provider(),
                    detail: "ConnectionClosed".into(),
                },
                expected: true,
            },
            // TC1: read timeout is terminal
            TestCase {
                input: FeedError::Socket {
                    provider: provider(),
                    detail: "read timeout after 120s".into(),
                },
                expected: true,
            },
            // TC2: parse noise is not terminal
            TestCase {
                input: FeedError::Socket {
                    provider: provider(),
                    detail: "unexpected frame payload".into(),
                },
                expected: false,
            },
            // TC3: per-symbol rejection is not terminal
            TestCase {
                input: FeedError::SubscriptionRejected {
                    provider: provider(),
                    symbol: "BTCUSDT".into(),
                },
                expected: false,
            },
        ];

        for (index, test) in tests.into_iter().enumerate() {
            assert_eq!(test.input.is_terminal(), test.expected, "TC{} failed", index);
        }
    }
}
