//! Hybrid provider composing two venues.
//!
//! Price and signed volume come from the trade venue, open interest (and
//! mark/funding) from the ticker venue. Per-symbol joins tolerate a bounded
//! staleness on the complementary side; a merged update goes out on either
//! input as soon as any fresh component is available.

use crate::error::FeedError;
use crate::event::{MarketUpdate, ProviderId};
use crate::exchange::{MarketDataProvider, ProviderCore, ProviderHealth};
use async_trait::async_trait;
use chrono::Utc;
use fnv::FnvHashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tracing::info;

/// How long a component from one side stays joinable.
pub const JOIN_STALENESS_MS: i64 = 10_000;

/// Per-symbol join state for the two input lanes.
pub(crate) struct SymbolJoiner {
    staleness_ms: i64,
    trade_side: FnvHashMap<String, (MarketUpdate, i64)>,
    ticker_side: FnvHashMap<String, (MarketUpdate, i64)>,
}

impl SymbolJoiner {
    pub(crate) fn new(staleness_ms: i64) -> Self {
        Self {
            staleness_ms,
            trade_side: FnvHashMap::default(),
            ticker_side: FnvHashMap::default(),
        }
    }

    /// Fold a trade-venue update and emit it merged with any fresh open
    /// interest from the ticker side.
    pub(crate) fn on_trade(
        &mut self,
        id: ProviderId,
        update: MarketUpdate,
        now_ms: i64,
    ) -> MarketUpdate {
        self.trade_side
            .insert(update.symbol.clone(), (update.clone(), now_ms));

        let mut merged = update;
        merged.provider = id;
        if let Some((ticker, seen_ms)) = self.ticker_side.get(&merged.symbol) {
            if now_ms - seen_ms <= self.staleness_ms {
                if merged.open_interest.is_none() {
                    merged.open_interest = ticker.open_interest;
                    merged.open_interest_time = ticker.open_interest_time;
                }
                merged.mark_price = merged.mark_price.or(ticker.mark_price);
                merged.funding_rate = merged.funding_rate.or(ticker.funding_rate);
            }
        }
        merged
    }

    /// Fold a ticker-venue update. The ticker venue's own price is replaced
    /// by the trade venue's when fresh, so one venue consistently prices the
    /// merged stream.
    pub(crate) fn on_ticker(
        &mut self,
        id: ProviderId,
        update: MarketUpdate,
        now_ms: i64,
    ) -> MarketUpdate {
        self.ticker_side
            .insert(update.symbol.clone(), (update.clone(), now_ms));

        let mut merged = update;
        merged.provider = id;
        merged.price = None;
        merged.volume = None;
        merged.quote_volume = None;
        if let Some((trade, seen_ms)) = self.trade_side.get(&merged.symbol) {
            if now_ms - seen_ms <= self.staleness_ms {
                merged.price = trade.price;
            }
        }
        merged
    }
}

/// Composition of a trade venue and a ticker venue behind one provider id.
pub struct HybridProvider {
    core: Arc<ProviderCore>,
    trade_source: Arc<dyn MarketDataProvider>,
    ticker_source: Arc<dyn MarketDataProvider>,
}

impl HybridProvider {
    /// The composed provider reports under the trade venue's identity.
    pub fn new(
        trade_source: Arc<dyn MarketDataProvider>,
        ticker_source: Arc<dyn MarketDataProvider>,
    ) -> Self {
        Self {
            core: Arc::new(ProviderCore::new(trade_source.id())),
            trade_source,
            ticker_source,
        }
    }
}

#[async_trait]
impl MarketDataProvider for HybridProvider {
    fn id(&self) -> ProviderId {
        self.core.id
    }

    async fn connect(
        &self,
        updates: mpsc::UnboundedSender<MarketUpdate>,
    ) -> Result<(), FeedError> {
        let (trade_tx, trade_rx) = mpsc::unbounded_channel();
        let (ticker_tx, ticker_rx) = mpsc::unbounded_channel();

        self.trade_source.connect(trade_tx).await?;
        if let Err(e) = self.ticker_source.connect(ticker_tx).await {
            self.trade_source.disconnect().await;
            return Err(e);
        }

        let shutdown = self.core.arm_shutdown();
        tokio::spawn(run_join_loop(
            self.core.clone(),
            trade_rx,
            ticker_rx,
            updates,
            shutdown,
        ));

        info!(provider = %self.core.id, ticker = %self.ticker_source.id(), "hybrid feed joined");
        Ok(())
    }

    async fn disconnect(&self) {
        self.core.trigger_shutdown();
        self.trade_source.disconnect().await;
        self.ticker_source.disconnect().await;
    }

    fn is_connected(&self) -> bool {
        self.trade_source.is_connected() || self.ticker_source.is_connected()
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.trade_source.subscribe(symbols).await?;
        self.ticker_source.subscribe(symbols).await
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.trade_source.unsubscribe(symbols).await?;
        self.ticker_source.unsubscribe(symbols).await
    }

    /// Symbols both venues can serve.
    fn available_symbols(&self) -> Vec<String> {
        let ticker_side: std::collections::BTreeSet<String> =
            self.ticker_source.available_symbols().into_iter().collect();
        self.trade_source
            .available_symbols()
            .into_iter()
            .filter(|s| ticker_side.contains(s))
            .collect()
    }

    fn health(&self) -> ProviderHealth {
        let trade = self.trade_source.health();
        let ticker = self.ticker_source.health();
        ProviderHealth {
            provider: self.core.id,
            state: trade.state,
            messages: trade.messages + ticker.messages,
            parse_errors: trade.parse_errors + ticker.parse_errors,
            reconnects: trade.reconnects + ticker.reconnects,
            last_message_ms: trade.last_message_ms.max(ticker.last_message_ms),
            subscribed: trade.subscribed.max(ticker.subscribed),
        }
    }
}

async fn run_join_loop(
    core: Arc<ProviderCore>,
    mut trade_rx: mpsc::UnboundedReceiver<MarketUpdate>,
    mut ticker_rx: mpsc::UnboundedReceiver<MarketUpdate>,
    updates: mpsc::UnboundedSender<MarketUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut joiner = SymbolJoiner::new(JOIN_STALENESS_MS);

    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            maybe = trade_rx.recv() => match maybe {
                Some(update) => {
                    let now_ms = Utc::now().timestamp_millis();
                    let merged = joiner.on_trade(core.id, update, now_ms);
                    if merged.has_payload() {
                        let _ = updates.send(merged);
                    }
                }
                None => break,
            },
            maybe = ticker_rx.recv() => match maybe {
                Some(update) => {
                    let now_ms = Utc::now().timestamp_millis();
                    let merged = joiner.on_ticker(core.id, update, now_ms);
                    if merged.has_payload() {
                        let _ = updates.send(merged);
                    }
                }
                None => break,
            },
        }
    }
}
