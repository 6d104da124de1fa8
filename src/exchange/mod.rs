//! Venue connectors.
//!
//! Every connector implements [`MarketDataProvider`] and normalizes its wire
//! payloads into [`MarketUpdate`] records pushed onto the lane handed to
//! `connect`. Connection loops recover from transport failures internally;
//! only the initial connect propagates errors.

pub mod binance;
pub mod bybit;
pub mod flow;
pub mod hybrid;
pub mod okx;

pub use binance::BinanceFuturesProvider;
pub use bybit::BybitFuturesProvider;
pub use hybrid::HybridProvider;
pub use okx::OkxFuturesProvider;

use crate::error::FeedError;
use crate::event::{MarketUpdate, ProviderId};
use async_trait::async_trait;
use parking_lot::Mutex;
use rand::Rng;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicI64, AtomicU64, Ordering};
use std::time::Duration;
use tokio::sync::{mpsc, watch};

/// Symbols per subscription frame.
pub const SUBSCRIBE_BATCH: usize = 50;
/// Gap between subscription frames.
pub const SUBSCRIBE_GAP: Duration = Duration::from_millis(250);
/// Keep-alive cadence.
pub const PING_INTERVAL: Duration = Duration::from_secs(20);
/// Reconnect backoff base and cap.
pub const RECONNECT_BASE: Duration = Duration::from_secs(5);
pub const RECONNECT_CAP: Duration = Duration::from_secs(60);
/// Instrument catalog fetch attempts (linear backoff).
pub const CATALOG_ATTEMPTS: u32 = 5;
pub const CATALOG_RETRY_BASE: Duration = Duration::from_secs(2);
/// REST call deadline.
pub const REST_TIMEOUT: Duration = Duration::from_secs(10);

/// Provider connection lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
    Disconnected,
    Connecting,
    Connected,
    Reconnecting,
}

/// Health snapshot reported by every provider.
#[derive(Debug, Clone)]
pub struct ProviderHealth {
    pub provider: ProviderId,
    pub state: ConnectionState,
    pub messages: u64,
    pub parse_errors: u64,
    pub reconnects: u64,
    pub last_message_ms: Option<i64>,
    pub subscribed: usize,
}

/// Uniform venue connector contract.
#[async_trait]
pub trait MarketDataProvider: Send + Sync {
    fn id(&self) -> ProviderId;

    /// Open the venue connection and start pushing normalized updates onto
    /// `updates`. Fails only when the initial connection cannot be
    /// established; later transport failures reconnect internally.
    async fn connect(
        &self,
        updates: mpsc::UnboundedSender<MarketUpdate>,
    ) -> Result<(), FeedError>;

    /// Intentional disconnect: suppresses reconnection, cancels timers,
    /// closes the socket.
    async fn disconnect(&self);

    fn is_connected(&self) -> bool;

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError>;

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError>;

    /// Instrument catalog discovered at startup, already filtered and
    /// validated.
    fn available_symbols(&self) -> Vec<String>;

    fn health(&self) -> ProviderHealth;
}

/// State shared between a provider handle and its spawned loops.
pub(crate) struct ProviderCore {
    pub id: ProviderId,
    state: Mutex<ConnectionState>,
    intentional_disconnect: AtomicBool,
    messages: AtomicU64,
    parse_errors: AtomicU64,
    reconnects: AtomicU64,
    last_message_ms: AtomicI64,
    subscribed: Mutex<BTreeSet<String>>,
    catalog: Mutex<Vec<String>>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl ProviderCore {
    pub fn new(id: ProviderId) -> Self {
        Self {
            id,
            state: Mutex::new(ConnectionState::Disconnected),
            intentional_disconnect: AtomicBool::new(false),
            messages: AtomicU64::new(0),
            parse_errors: AtomicU64::new(0),
            reconnects: AtomicU64::new(0),
            last_message_ms: AtomicI64::new(0),
            subscribed: Mutex::new(BTreeSet::new()),
            catalog: Mutex::new(Vec::new()),
            shutdown: Mutex::new(None),
        }
    }

    pub fn set_state(&self, state: ConnectionState) {
        *self.state.lock() = state;
    }

    pub fn state(&self) -> ConnectionState {
        *self.state.lock()
    }

    pub fn is_connected(&self) -> bool {
        self.state() == ConnectionState::Connected
    }

    pub fn set_catalog(&self, symbols: Vec<String>) {
        *self.catalog.lock() = symbols;
    }

    pub fn catalog(&self) -> Vec<String> {
        self.catalog.lock().clone()
    }

    pub fn add_subscriptions(&self, symbols: &[String]) {
        let mut subscribed = self.subscribed.lock();
        for symbol in symbols {
            subscribed.insert(symbol.clone());
        }
    }

    pub fn remove_subscriptions(&self, symbols: &[String]) {
        let mut subscribed = self.subscribed.lock();
        for symbol in symbols {
            subscribed.remove(symbol);
        }
    }

    pub fn subscriptions(&self) -> Vec<String> {
        self.subscribed.lock().iter().cloned().collect()
    }

    pub fn is_subscribed(&self, symbol: &str) -> bool {
        self.subscribed.lock().contains(symbol)
    }

    pub fn subscription_count(&self) -> usize {
        self.subscribed.lock().len()
    }

    pub fn record_message(&self, now_ms: i64) {
        self.messages.fetch_add(1, Ordering::Relaxed);
        self.last_message_ms.store(now_ms, Ordering::Relaxed);
    }

    pub fn record_parse_error(&self) {
        self.parse_errors.fetch_add(1, Ordering::Relaxed);
    }

    pub fn record_reconnect(&self) {
        self.reconnects.fetch_add(1, Ordering::Relaxed);
    }

    /// Arm a fresh shutdown channel for a new connection session.
    pub fn arm_shutdown(&self) -> watch::Receiver<bool> {
        let (tx, rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);
        self.intentional_disconnect.store(false, Ordering::SeqCst);
        rx
    }

    /// Flag an intentional disconnect and fire the shutdown signal.
    pub fn trigger_shutdown(&self) {
        self.intentional_disconnect.store(true, Ordering::SeqCst);
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        self.set_state(ConnectionState::Disconnected);
    }

    pub fn is_intentional_disconnect(&self) -> bool {
        self.intentional_disconnect.load(Ordering::SeqCst)
    }

    pub fn health(&self) -> ProviderHealth {
        let last = self.last_message_ms.load(Ordering::Relaxed);
        ProviderHealth {
            provider: self.id,
            state: self.state(),
            messages: self.messages.load(Ordering::Relaxed),
            parse_errors: self.parse_errors.load(Ordering::Relaxed),
            reconnects: self.reconnects.load(Ordering::Relaxed),
            last_message_ms: (last > 0).then_some(last),
            subscribed: self.subscription_count(),
        }
    }
}

/// Exponential reconnect backoff with jitter, base 5 s capped at 60 s.
pub(crate) fn reconnect_backoff(attempt: u32) -> Duration {
    let exp = attempt.min(8);
    let multiplier = 1u64 << exp;
    let raw = RECONNECT_BASE
        .saturating_mul(multiplier as u32)
        .min(RECONNECT_CAP);
    let jitter_ms = rand::thread_rng().gen_range(0..=raw.as_millis() as u64 / 4);
    raw + Duration::from_millis(jitter_ms)
}

/// Retry an async operation with linear backoff.
pub(crate) async fn retry_linear<T, E, F, Fut>(
    attempts: u32,
    base_delay: Duration,
    mut op: F,
) -> Result<T, E>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let mut last_err = None;
    for attempt in 1..=attempts {
        match op().await {
            Ok(value) => return Ok(value),
            Err(err) => {
                last_err = Some(err);
                if attempt < attempts {
                    tokio::time::sleep(base_delay * attempt).await;
                }
            }
        }
    }
    Err(last_err.expect("at least one attempt"))
}

/// Split a symbol list into subscription batches.
pub(crate) fn subscription_batches(symbols: &[String]) -> Vec<Vec<String>> {
    symbols
        .chunks(SUBSCRIBE_BATCH)
        .map(|chunk| chunk.to_vec())
        .collect()
}
