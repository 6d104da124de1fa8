//! Ingestion gateway: fans provider lanes into the aggregation stores.
//!
//! All store writes are confined to the gateway's single fan-in task, so a
//! symbol's buckets and state never see concurrent mutation. Evaluation is
//! notified per folded update.

use crate::error::FeedError;
use crate::event::{is_valid_symbol, MarketUpdate, ProviderId};
use crate::exchange::{MarketDataProvider, ProviderHealth};
use crate::store::{BucketStore, MarketState};
use chrono::Utc;
use parking_lot::{Mutex, RwLock};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tracing::{debug, info, warn};

/// Cadence of the provider health log line.
const HEALTH_SNAPSHOT_INTERVAL: Duration = Duration::from_secs(5 * 60);

/// A symbol touched by ingestion, forwarded to the trigger evaluator.
#[derive(Debug, Clone)]
pub struct SymbolTouch {
    pub symbol: String,
    pub price: Option<f64>,
}

/// Provider registry plus the fan-in pipeline.
pub struct IngestionGateway {
    providers: Mutex<Vec<Arc<dyn MarketDataProvider>>>,
    buckets: Arc<RwLock<BucketStore>>,
    market: Arc<RwLock<MarketState>>,
    touches: mpsc::UnboundedSender<SymbolTouch>,
    maintenance_interval: Duration,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl IngestionGateway {
    pub fn new(
        buckets: Arc<RwLock<BucketStore>>,
        market: Arc<RwLock<MarketState>>,
        touches: mpsc::UnboundedSender<SymbolTouch>,
        maintenance_interval_ms: u64,
    ) -> Self {
        Self {
            providers: Mutex::new(Vec::new()),
            buckets,
            market,
            touches,
            maintenance_interval: Duration::from_millis(maintenance_interval_ms.max(5_000)),
            shutdown: Mutex::new(None),
        }
    }

    pub fn register_provider(&self, provider: Arc<dyn MarketDataProvider>) {
        info!(provider = %provider.id(), "provider registered");
        self.providers.lock().push(provider);
    }

    /// Connect all registered providers concurrently. Succeeds when at
    /// least one provider comes up; with zero feeds the engine keeps
    /// running and health reporting carries the outage.
    pub async fn connect(&self) -> Result<usize, FeedError> {
        let providers = self.providers.lock().clone();
        let (updates_tx, updates_rx) = mpsc::unbounded_channel();

        let attempts = providers.iter().map(|provider| {
            let tx = updates_tx.clone();
            async move { (provider.id(), provider.connect(tx).await) }
        });
        let results = futures::future::join_all(attempts).await;

        let mut connected = 0usize;
        for (id, result) in results {
            match result {
                Ok(()) => connected += 1,
                Err(e) => warn!(provider = %id, error = %e, "provider failed to connect"),
            }
        }

        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        *self.shutdown.lock() = Some(shutdown_tx);

        tokio::spawn(run_fan_in(
            self.buckets.clone(),
            self.market.clone(),
            self.touches.clone(),
            updates_rx,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_maintenance(
            self.buckets.clone(),
            self.market.clone(),
            self.maintenance_interval,
            shutdown_rx.clone(),
        ));
        tokio::spawn(run_health_snapshots(
            self.providers.lock().clone(),
            shutdown_rx,
        ));

        if connected == 0 {
            return Err(FeedError::NoProvidersConnected);
        }
        info!(connected, total = providers.len(), "market data feeds up");
        Ok(connected)
    }

    /// Concurrently disconnect every provider and stop the pipeline tasks.
    pub async fn disconnect(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        let providers = self.providers.lock().clone();
        futures::future::join_all(providers.iter().map(|p| p.disconnect())).await;
        info!("ingestion gateway stopped");
    }

    pub fn active_providers(&self) -> Vec<ProviderId> {
        self.providers
            .lock()
            .iter()
            .filter(|p| p.is_connected())
            .map(|p| p.id())
            .collect()
    }

    pub fn providers_health(&self) -> Vec<ProviderHealth> {
        self.providers.lock().iter().map(|p| p.health()).collect()
    }
}

/// Fold one normalized update into the stores and report the touch.
pub(crate) fn ingest_update(
    buckets: &RwLock<BucketStore>,
    market: &RwLock<MarketState>,
    touches: &mpsc::UnboundedSender<SymbolTouch>,
    update: &MarketUpdate,
) {
    if !is_valid_symbol(&update.symbol) {
        debug!(symbol = %update.symbol, "dropping update with invalid symbol");
        return;
    }

    let ts_ms = update.timestamp_ms();
    let (price_fallback, oi_fallback) = {
        let market = market.read();
        (market.price(&update.symbol), market.open_interest(&update.symbol))
    };

    {
        let mut market = market.write();
        market.update(
            &update.symbol,
            ts_ms,
            update.price,
            update.open_interest,
            update.funding_rate,
        );
    }

    let outcome = buckets
        .write()
        .add_point(update, price_fallback, oi_fallback);
    if outcome.out_of_order {
        market.write().record_out_of_order(&update.symbol);
    }

    let price = update.price.or(price_fallback);
    let _ = touches.send(SymbolTouch {
        symbol: update.symbol.clone(),
        price,
    });
}

async fn run_fan_in(
    buckets: Arc<RwLock<BucketStore>>,
    market: Arc<RwLock<MarketState>>,
    touches: mpsc::UnboundedSender<SymbolTouch>,
    mut updates_rx: mpsc::UnboundedReceiver<MarketUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = updates_rx.recv() => match maybe {
                Some(update) => ingest_update(&buckets, &market, &touches, &update),
                None => break,
            },
        }
    }
}

/// Market-state maintenance tick: TTL and cap eviction, with bucket purge
/// for every evicted symbol.
async fn run_maintenance(
    buckets: Arc<RwLock<BucketStore>>,
    market: Arc<RwLock<MarketState>>,
    interval: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(interval);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let now_ms = Utc::now().timestamp_millis();
                let mut evicted = Vec::new();
                market
                    .write()
                    .maintenance(now_ms, |symbol| evicted.push(symbol.to_string()));
                if !evicted.is_empty() {
                    let mut buckets = buckets.write();
                    for symbol in &evicted {
                        buckets.cleanup_symbol(symbol);
                    }
                    debug!(evicted = evicted.len(), "symbols evicted");
                }
            }
        }
    }
}

async fn run_health_snapshots(
    providers: Vec<Arc<dyn MarketDataProvider>>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(HEALTH_SNAPSHOT_INTERVAL);
    timer.tick().await;
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                for provider in &providers {
                    let health = provider.health();
                    info!(
                        provider = %health.provider,
                        state = ?health.state,
                        messages = health.messages,
                        parse_errors = health.parse_errors,
                        reconnects = health.reconnects,
                        subscribed = health.subscribed,
                        "provider health"
                    );
                }
            }
        }
    }
}
