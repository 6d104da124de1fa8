//! OKX USDT-margined perpetual swaps connector.
//!
//! Subscribes the public `tickers` channel for price and the
//! `open-interest` channel for contract counts, both on
//! `ws/v5/public`. Instrument ids are `BTC-USDT-SWAP`; the engine tracks
//! the compact `BTCUSDT` form, so the connector maps both ways.
//!
//! See docs: <https://www.okx.com/docs-v5/en/#websocket-api-public-channel>

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

const DEFAULT_WS_URL: &str = "wss://ws.okx.com:8443/ws/v5/public";
const DEFAULT_REST_BASE: &str = "https://www.okx.com";

/// OKX perpetual swaps provider.
pub struct OkxFuturesProvider {
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    ws_url: String,
    rest_base: String,
    command_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl OkxFuturesProvider {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ProviderCore::new(ProviderId::new(
                Exchange::Okx,
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
            "{}/api/v5/public/instruments?instType=SWAP",
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

impl Default for OkxFuturesProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for OkxFuturesProvider {
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
                    // OKX keep-alive is a literal "ping" text frame.
                    if write.send(Message::Text("ping".into())).await.is_err() {
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
    if text == "pong" {
        return;
    }

    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            core.record_parse_error();
            return;
        }
    };

    if let Some(event) = value.get("event").and_then(Value::as_str) {
        if event == "error" {
            let detail = value.get("msg").and_then(Value::as_str).unwrap_or("unknown");
            warn!(provider = %core.id, detail, "subscription rejected");
        }
        return;
    }

    let channel = value
        .pointer("/arg/channel")
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string();

    match channel.as_str() {
        "tickers" => {
            let Ok(message) = serde_json::from_value::<DataMessage<OkxTicker>>(value) else {
                core.record_parse_error();
                return;
            };
            let now_ms = Utc::now().timestamp_millis();
            for ticker in message.data {
                if let Some(update) = normalize_ticker(&ticker) {
                    core.record_message(now_ms);
                    let _ = updates.send(update);
                }
            }
        }
        "open-interest" => {
            let Ok(message) = serde_json::from_value::<DataMessage<OkxOpenInterest>>(value)
            else {
                core.record_parse_error();
                return;
            };
            let now_ms = Utc::now().timestamp_millis();
            for oi in message.data {
                if let Some(update) = normalize_open_interest(&oi) {
                    core.record_message(now_ms);
                    let _ = updates.send(update);
                }
            }
        }
        _ => {}
    }
}

fn normalize_ticker(ticker: &OkxTicker) -> Option<MarketUpdate> {
    let symbol = compact_symbol(&ticker.inst_id)?;
    let time = Utc
        .timestamp_millis_opt(ticker.ts)
        .single()
        .unwrap_or_else(Utc::now);

    let mut update = MarketUpdate::new(
        ProviderId::new(Exchange::Okx, MarketType::Futures),
        symbol,
        time,
    );
    update.price = ticker.last.filter(|p| *p > 0.0);
    update.volume = ticker.vol_24h;
    update.quote_volume = ticker.vol_ccy_24h;
    update.has_payload().then_some(update)
}

fn normalize_open_interest(oi: &OkxOpenInterest) -> Option<MarketUpdate> {
    let symbol = compact_symbol(&oi.inst_id)?;
    let time = Utc
        .timestamp_millis_opt(oi.ts)
        .single()
        .unwrap_or_else(Utc::now);

    let mut update = MarketUpdate::new(
        ProviderId::new(Exchange::Okx, MarketType::Futures),
        symbol,
        time,
    );
    update.open_interest = Some(oi.contracts).filter(|v| v.is_finite() && *v >= 0.0);
    update.open_interest_time = update.open_interest.map(|_| time);
    update.has_payload().then_some(update)
}

/// `BTC-USDT-SWAP` -> `BTCUSDT`.
fn compact_symbol(inst_id: &str) -> Option<String> {
    let mut parts = inst_id.split('-');
    let base = parts.next()?;
    let quote = parts.next()?;
    let kind = parts.next()?;
    if quote != QUOTE_SUFFIX || kind != "SWAP" {
        return None;
    }
    let symbol = format!("{}{}", base, quote);
    is_valid_symbol(&symbol).then_some(symbol)
}

/// `BTCUSDT` -> `BTC-USDT-SWAP`.
fn instrument_id(symbol: &str) -> Option<String> {
    let base = symbol.strip_suffix(QUOTE_SUFFIX)?;
    (!base.is_empty()).then(|| format!("{}-{}-SWAP", base, QUOTE_SUFFIX))
}

fn subscribe_frame(op: &str, symbols: &[String]) -> String {
    let args: Vec<Value> = symbols
        .iter()
        .filter_map(|s| instrument_id(s))
        .flat_map(|inst_id| {
            vec![
                json!({ "channel": "tickers", "instId": inst_id }),
                json!({ "channel": "open-interest", "instId": inst_id }),
            ]
        })
        .collect();
    json!({ "op": op, "args": args }).to_string()
}

fn filter_catalog(response: InstrumentsResponse) -> Vec<String> {
    let mut symbols: Vec<String> = response
        .data
        .into_iter()
        .filter(|i| i.state == "live")
        .filter_map(|i| compact_symbol(&i.inst_id))
        .collect();
    symbols.sort();
    symbols
}

#[derive(Debug, Deserialize)]
struct InstrumentsResponse {
    data: Vec<InstrumentInfo>,
}

#[derive(Debug, Deserialize)]
struct InstrumentInfo {
    #[serde(rename = "instId")]
    inst_id: String,
    state: String,
}

/// Envelope shared by the public data channels.
#[derive(Debug, Deserialize)]
struct DataMessage<T> {
    data: Vec<T>,
}

#[derive(Debug, Deserialize)]
struct OkxTicker {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(default, deserialize_with = "de_opt_str_f64")]
    last: Option<f64>,
    #[serde(rename = "vol24h", default, deserialize_with = "de_opt_str_f64")]
    vol_24h: Option<f64>,
    #[serde(rename = "volCcy24h", default, deserialize_with = "de_opt_str_f64")]
    vol_ccy_24h: Option<f64>,
    #[serde(deserialize_with = "de_str_i64")]
    ts: i64,
}

#[derive(Debug, Deserialize)]
struct OkxOpenInterest {
    #[serde(rename = "instId")]
    inst_id: String,
    #[serde(rename = "oi", deserialize_with = "de_str_f64")]
    contracts: f64,
    #[serde(deserialize_with = "de_str_i64")]
    ts: i64,
}

fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let raw: String = Deserialize::deserialize(deserializer)?;
    raw.parse::<f64>().map_err(serde::de::Error::custom)
}

fn de_str_i64<'de, D>(deserializer: D) -> Result<i64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let raw: String = Deserialize::deserialize(deserializer)?;
    raw.parse::<i64>().map_err(serde::de::Error::custom)
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

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_symbol_mapping() {
        assert_eq!(compact_symbol("BTC-USDT-SWAP"), Some("BTCUSDT".to_string()));
        assert_eq!(compact_symbol("BTC-USD-SWAP"), None);
        assert_eq!(compact_symbol("BTC-USDT-230331"), None);
        assert_eq!(instrument_id("BTCUSDT"), Some("BTC-USDT-SWAP".to_string()));
        assert_eq!(instrument_id("BTCUSD"), None);
    }

    #[test]
    fn test_ticker_deserialise() {
        let input = r#"
            {
                "arg": { "channel": "tickers", "instId": "BTC-USDT-SWAP" },
                "data": [
                    {
                        "instType": "SWAP",
                        "instId": "BTC-USDT-SWAP",
                        "last": "16838.75",
                        "lastSz": "0.1",
                        "vol24h": "255502.1",
                        "volCcy24h": "2555.021",
                        "ts": "1597026383085"
                    }
                ]
            }
        "#;
        let message: DataMessage<OkxTicker> = serde_json::from_str(input).unwrap();
        let update = normalize_ticker(&message.data[0]).unwrap();
        assert_eq!(update.symbol, "BTCUSDT");
        assert_eq!(update.price, Some(16838.75));
        assert_eq!(update.timestamp_ms(), 1597026383085);
    }

    #[test]
    fn test_open_interest_deserialise() {
        let input = r#"
            {
                "arg": { "channel": "open-interest", "instId": "BTC-USDT-SWAP" },
                "data": [
                    {
                        "instType": "SWAP",
                        "instId": "BTC-USDT-SWAP",
                        "oi": "5000",
                        "oiCcy": "555.55",
                        "ts": "1597026383085"
                    }
                ]
            }
        "#;
        let message: DataMessage<OkxOpenInterest> = serde_json::from_str(input).unwrap();
        let update = normalize_open_interest(&message.data[0]).unwrap();
        assert_eq!(update.open_interest, Some(5000.0));
        assert!(update.open_interest_time.is_some());
    }

    #[test]
    fn test_subscribe_frame_pairs_channels() {
        let frame = subscribe_frame("subscribe", &["BTCUSDT".to_string()]);
        let value: Value = serde_json::from_str(&frame).unwrap();
        let args = value["args"].as_array().unwrap();
        assert_eq!(args.len(), 2);
        assert_eq!(args[0]["channel"], "tickers");
        assert_eq!(args[0]["instId"], "BTC-USDT-SWAP");
        assert_eq!(args[1]["channel"], "open-interest");
    }

    #[test]
    fn test_catalog_filter() {
        let response = InstrumentsResponse {
            data: vec![
                InstrumentInfo {
                    inst_id: "BTC-USDT-SWAP".into(),
                    state: "live".into(),
                },
                InstrumentInfo {
                    inst_id: "BTC-USD-SWAP".into(),
                    state: "live".into(),
                },
                InstrumentInfo {
                    inst_id: "ETH-USDT-SWAP".into(),
                    state: "suspend".into(),
                },
            ],
        };
        assert_eq!(filter_catalog(response), vec!["BTCUSDT".to_string()]);
    }
}
