//! Bybit linear perpetuals connector.
//!
//! The v5 `tickers.<SYMBOL>` stream carries last price, open interest, mark
//! price, and funding rate in one payload. Delta frames omit unchanged
//! fields, so every field deserializes as optional.
//!
//! See docs: <https://bybit-exchange.github.io/docs/v5/websocket/public/tickers>

use crate::error::FeedError;
use crate::event::{
    is_valid_symbol, Exchange, MarketType, MarketUpdate, ProviderId, QUOTE_SUFFIX,
};
use crate::exchange::{
    reconnect_backoff, retry_linear, subscription_batches, ConnectionState, MarketDataProvider,
    ProviderCore, ProviderHealth, CATALOG_ATTEMPTS, CATALOG_RETRY_BASE, PING_INTERVAL,
    REST_TIMEOUT, SUBSCRIBE_GAP,
};
use async_trait::async_trait;
use chrono::{TimeZone, Utc};
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_WS_URL: &str = "wss://stream.bybit.com/v5/public/linear";
const DEFAULT_REST_BASE: &str = "https://api.bybit.com";

/// Bybit linear perpetuals provider.
pub struct BybitFuturesProvider {
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    ws_url: String,
    rest_base: String,
    command_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl BybitFuturesProvider {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ProviderCore::new(ProviderId::new(
                Exchange::Bybit,
                MarketType::Futures,
            ))),
            http: reqwest::Client::builder()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_base: DEFAULT_REST_BASE.to_string(),
            command_tx: Mutex::new(None),
        }
    }

    async fn fetch_catalog(&self) -> Result<Vec<String>, FeedError> {
        let url = format!(
            "{}/v5/market/instruments-info?category=linear&limit=1000",
            self.rest_base
        );
        let provider = self.core.id;
        let http = self.http.clone();

        retry_linear(CATALOG_ATTEMPTS, CATALOG_RETRY_BASE, || {
            let url = url.clone();
            let http = http.clone();
            async move {
                let response: InstrumentsResponse = http
                    .get(&url)
                    .send()
                    .await
                    .map_err(|e| FeedError::Catalog {
                        provider,
                        detail: e.to_string(),
                    })?
                    .json()
                    .await
                    .map_err(|e| FeedError::Catalog {
                        provider,
                        detail: e.to_string(),
                    })?;
                Ok(filter_catalog(response))
            }
        })
        .await
    }
}

impl Default for BybitFuturesProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for BybitFuturesProvider {
    fn id(&self) -> ProviderId {
        self.core.id
    }

    async fn connect(
        &self,
        updates: mpsc::UnboundedSender<MarketUpdate>,
    ) -> Result<(), FeedError> {
        self.core.set_state(ConnectionState::Connecting);

        let catalog = self.fetch_catalog().await.inspect_err(|_| {
            self.core.set_state(ConnectionState::Disconnected);
        })?;
        info!(provider = %self.core.id, symbols = catalog.len(), "instrument catalog loaded");
        self.core.set_catalog(catalog.clone());
        self.core.add_subscriptions(&catalog);

        let (ws, _) = connect_async(&self.ws_url).await.map_err(|e| {
            self.core.set_state(ConnectionState::Disconnected);
            FeedError::Socket {
                provider: self.core.id,
                detail: e.to_string(),
            }
        })?;
        self.core.set_state(ConnectionState::Connected);

        let shutdown = self.core.arm_shutdown();
        let (command_tx, command_rx) = mpsc::unbounded_channel();
        *self.command_tx.lock() = Some(command_tx);

        tokio::spawn(run_socket_loop(
            self.core.clone(),
            self.ws_url.clone(),
            Some(ws),
            command_rx,
            updates,
            shutdown,
        ));

        Ok(())
    }

    async fn disconnect(&self) {
        self.core.trigger_shutdown();
        *self.command_tx.lock() = None;
        info!(provider = %self.core.id, "disconnected");
    }

    fn is_connected(&self) -> bool {
        self.core.is_connected()
    }

    async fn subscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        let accepted: Vec<String> = symbols
            .iter()
            .filter(|s| is_valid_symbol(s))
            .cloned()
            .collect();
        for rejected in symbols.iter().filter(|s| !is_valid_symbol(s)) {
            warn!(provider = %self.core.id, symbol = %rejected, "invalid symbol shape, skipping");
        }
        self.core.add_subscriptions(&accepted);

        let command_tx = self.command_tx.lock().clone();
        if let Some(tx) = command_tx {
            for batch in subscription_batches(&accepted) {
                tx.send(subscribe_frame("subscribe", &batch))
                    .map_err(|_| FeedError::NotConnected(self.core.id))?;
                tokio::time::sleep(SUBSCRIBE_GAP).await;
            }
        }
        Ok(())
    }

    async fn unsubscribe(&self, symbols: &[String]) -> Result<(), FeedError> {
        self.core.remove_subscriptions(symbols);
        let command_tx = self.command_tx.lock().clone();
        if let Some(tx) = command_tx {
            for batch in subscription_batches(symbols) {
                tx.send(subscribe_frame("unsubscribe", &batch))
                    .map_err(|_| FeedError::NotConnected(self.core.id))?;
            }
        }
        Ok(())
    }

    fn available_symbols(&self) -> Vec<String> {
        self.core.catalog()
    }

    fn health(&self) -> ProviderHealth {
        self.core.health()
    }
}

async fn run_socket_loop(
    core: Arc<ProviderCore>,
    ws_url: String,
    mut initial: Option<
        tokio_tungstenite::WebSocketStream<
            tokio_tungstenite::MaybeTlsStream<tokio::net::TcpStream>,
        >,
    >,
    mut command_rx: mpsc::UnboundedReceiver<String>,
    updates: mpsc::UnboundedSender<MarketUpdate>,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut attempt = 0u32;

    'reconnect: loop {
        let ws = match initial.take() {
            Some(ws) => ws,
            None => {
                if core.is_intentional_disconnect() {
                    break;
                }
                core.set_state(ConnectionState::Reconnecting);
                core.record_reconnect();
                let delay = reconnect_backoff(attempt);
                debug!(provider = %core.id, ?delay, "reconnecting");
                tokio::select! {
                    _ = tokio::time::sleep(delay) => {}
                    _ = shutdown.changed() => break,
                }
                match connect_async(&ws_url).await {
                    Ok((ws, _)) => {
                        attempt = 0;
                        core.set_state(ConnectionState::Connected);
                        ws
                    }
                    Err(e) => {
                        attempt += 1;
                        error!(provider = %core.id, error = %e, "reconnect failed");
                        continue;
                    }
                }
            }
        };

        let (mut write, mut read) = ws.split();

        let symbols = core.subscriptions();
        for batch in subscription_batches(&symbols) {
            let frame = subscribe_frame("subscribe", &batch);
            if write.send(Message::Text(frame.into())).await.is_err() {
                continue 'reconnect;
            }
            tokio::time::sleep(SUBSCRIBE_GAP).await;
        }

        let mut ping = tokio::time::interval(PING_INTERVAL);
        ping.tick().await;

        loop {
            tokio::select! {
                _ = shutdown.changed() => {
                    let _ = write.send(Message::Close(None)).await;
                    break 'reconnect;
                }
                Some(frame) = command_rx.recv() => {
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                _ = ping.tick() => {
                    // Bybit expects an application-level ping op.
                    let frame = json!({ "op": "ping" }).to_string();
                    if write.send(Message::Text(frame.into())).await.is_err() {
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&core, &text, &updates);
                    }
                    Some(Ok(Message::Ping(payload))) => {
                        let _ = write.send(Message::Pong(payload)).await;
                    }
                    Some(Ok(Message::Close(_))) | None => {
                        warn!(provider = %core.id, "stream closed");
                        break;
                    }
                    Some(Err(e)) => {
                        error!(provider = %core.id, error = %e, "websocket error");
                        break;
                    }
                    _ => {}
                }
            }
        }

        if core.is_intentional_disconnect() {
            break;
        }
    }

    core.set_state(ConnectionState::Disconnected);
}

fn handle_text(core: &ProviderCore, text: &str, updates: &mpsc::UnboundedSender<MarketUpdate>) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            core.record_parse_error();
            return;
        }
    };

    // Control frames: pong / subscription acks / rejections.
    if value.get("topic").is_none() {
        if value.get("success") == Some(&Value::Bool(false)) {
            let detail = value
                .get("ret_msg")
                .and_then(Value::as_str)
                .unwrap_or("unknown");
            warn!(provider = %core.id, detail, "subscription rejected");
        }
        return;
    }

    let Ok(payload) = serde_json::from_value::<TickerPayload>(value) else {
        core.record_parse_error();
        return;
    };

    if let Some(update) = normalize_ticker(&payload) {
        core.record_message(Utc::now().timestamp_millis());
        let _ = updates.send(update);
    }
}

/// Build a normalized update from one tickers frame. Returns `None` for
/// frames without any usable field (delta frames can be empty of data we
/// track).
fn normalize_ticker(payload: &TickerPayload) -> Option<MarketUpdate> {
    let inner = &payload.data;
    let time = Utc
        .timestamp_millis_opt(payload.ts)
        .single()
        .unwrap_or_else(Utc::now);

    let mut update = MarketUpdate::new(
        ProviderId::new(Exchange::Bybit, MarketType::Futures),
        inner.symbol.clone(),
        time,
    );
    update.price = inner.last_price.filter(|p| *p > 0.0);
    update.open_interest = inner.open_interest;
    update.open_interest_time = inner.open_interest.map(|_| time);
    update.mark_price = inner.mark_price;
    update.funding_rate = inner.funding_rate;
    update.volume = inner.volume_24h;
    update.quote_volume = inner.turnover_24h;

    update.has_payload().then_some(update)
}

fn filter_catalog(response: InstrumentsResponse) -> Vec<String> {
    let mut symbols: Vec<String> = response
        .result
        .list
        .into_iter()
        .filter(|i| {
            i.status == "Trading" && i.quote_coin == QUOTE_SUFFIX && is_valid_symbol(&i.symbol)
        })
        .map(|i| i.symbol)
        .collect();
    symbols.sort();
    symbols
}

fn subscribe_frame(op: &str, symbols: &[String]) -> String {
    let args: Vec<String> = symbols.iter().map(|s| format!("tickers.{}", s)).collect();
    json!({ "op": op, "args": args }).to_string()
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    result: InstrumentsResult,
}

#[derive(Debug, Deserialize)]
struct InstrumentsResult {
    list: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    symbol: String,
    status: String,
    #[serde(rename = "quoteCoin")]
    quote_coin: String,
}

/// Envelope of a `tickers.<SYMBOL>` frame.
#[derive(Debug, Deserialize)]
struct TickerPayload {
    #[serde(rename = "ts")]
    ts: i64,
    data: TickerInner,
}

/// Subset of ticker fields the engine consumes. Delta frames omit unchanged
/// fields, hence everything optional.
#[derive(Debug, Deserialize)]
struct TickerInner {
    symbol: String,

    #[serde(default, alias = "lastPrice", deserialize_with = "de_opt_str_f64")]
    last_price: Option<f64>,

    #[serde(default, alias = "openInterest", deserialize_with = "de_opt_str_f64")]
    open_interest: Option<f64>,

    #[serde(default, alias = "markPrice", deserialize_with = "de_opt_str_f64")]
    mark_price: Option<f64>,

    #[serde(default, alias = "fundingRate", deserialize_with = "de_opt_str_f64")]
    funding_rate: Option<f64>,

    #[serde(default, alias = "volume24h", deserialize_with = "de_opt_str_f64")]
    volume_24h: Option<f64>,

    #[serde(default, alias = "turnover24h", deserialize_with = "de_opt_str_f64")]
    turnover_24h: Option<f64>,
}

fn de_opt_str_f64<'de, D>(deserializer: D) -> Result<Option<f64>, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let value: Option<String> = Option::deserialize(deserializer)?;
    match value {
        Some(raw) if raw.trim().is_empty() => Ok(None),
        Some(raw) => raw
            .parse::<f64>()
            .map(Some)
            .map_err(serde::de::Error::custom),
        None => Ok(None),
    }
}
