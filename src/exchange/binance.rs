//! Binance USD-M futures connector.
//!
//! Price and 24 h volume come from the `!ticker@arr` stream, aggressive
//! volume from per-symbol `@aggTrade` streams, and open interest from a
//! rate-limited `/fapi/v1/openInterest` poller since the venue does not
//! stream it. The instrument catalog is fetched from
//! `/fapi/v1/exchangeInfo` at startup.

use crate::error::FeedError;
use crate::event::{
    is_valid_symbol, Exchange, MarketType, MarketUpdate, ProviderId, Side, QUOTE_SUFFIX,
};
use crate::exchange::flow::{FlowAccumulator, FLOW_FLUSH_MS, MIN_QUOTE_NOTIONAL};
use crate::exchange::{
    reconnect_backoff, retry_linear, subscription_batches, ConnectionState, MarketDataProvider,
    ProviderCore, ProviderHealth, CATALOG_ATTEMPTS, CATALOG_RETRY_BASE, PING_INTERVAL,
    REST_TIMEOUT, SUBSCRIBE_GAP,
};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use fnv::FnvHashMap;
use futures::{SinkExt, StreamExt};
use parking_lot::Mutex;
use serde::Deserialize;
use serde_json::{json, Value};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::{connect_async, tungstenite::Message};
use tracing::{debug, error, info, warn};

const DEFAULT_WS_URL: &str = "wss://fstream.binance.com/ws";
const DEFAULT_REST_BASE: &str = "https://fapi.binance.com";

/// Open-interest poll batching and freshness.
const OI_POLL_BATCH: usize = 25;
const OI_POLL_BATCH_GAP: Duration = Duration::from_millis(60);
const OI_POLL_ROUND: Duration = Duration::from_secs(30);
const OI_STALENESS_MS: i64 = 90_000;

#[derive(Debug, Clone, Copy)]
struct OiEntry {
    value: f64,
    venue_time_ms: i64,
    fetched_ms: i64,
}

type OiCache = Arc<Mutex<FnvHashMap<String, OiEntry>>>;

/// Binance USD-M futures provider.
pub struct BinanceFuturesProvider {
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    ws_url: String,
    rest_base: String,
    oi_cache: OiCache,
    command_tx: Mutex<Option<mpsc::UnboundedSender<String>>>,
}

impl BinanceFuturesProvider {
    pub fn new() -> Self {
        Self {
            core: Arc::new(ProviderCore::new(ProviderId::new(
                Exchange::Binance,
                MarketType::Futures,
            ))),
            http: reqwest::Client::builder()
                .timeout(REST_TIMEOUT)
                .build()
                .expect("reqwest client"),
            ws_url: DEFAULT_WS_URL.to_string(),
            rest_base: DEFAULT_REST_BASE.to_string(),
            oi_cache: Arc::new(Mutex::new(FnvHashMap::default())),
            command_tx: Mutex::new(None),
        }
    }

    async fn fetch_catalog(&self) -> Result<Vec<String>, FeedError> {
        let url = format!("{}/fapi/v1/exchangeInfo", self.rest_base);
        let provider = self.core.id;
        let http = self.http.clone();

        retry_linear(CATALOG_ATTEMPTS, CATALOG_RETRY_BASE, || {
            let url = url.clone();
            let http = http.clone();
            async move {
                let info: ExchangeInfo = http
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
                Ok(filter_catalog(info))
            }
        })
        .await
    }
}

impl Default for BinanceFuturesProvider {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl MarketDataProvider for BinanceFuturesProvider {
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

        let flow = Arc::new(Mutex::new(FlowAccumulator::new()));

        tokio::spawn(run_socket_loop(
            self.core.clone(),
            self.ws_url.clone(),
            Some(ws),
            command_rx,
            updates.clone(),
            flow.clone(),
            self.oi_cache.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_flush_loop(
            self.core.clone(),
            flow,
            updates,
            self.oi_cache.clone(),
            shutdown.clone(),
        ));
        tokio::spawn(run_oi_poll_loop(
            self.core.clone(),
            self.http.clone(),
            self.rest_base.clone(),
            self.oi_cache.clone(),
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
                tx.send(subscribe_frame(&batch, false))
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
                tx.send(unsubscribe_frame(&batch))
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

/// Socket session loop with reconnect.
#[allow(clippy::too_many_arguments)]
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
    flow: Arc<Mutex<FlowAccumulator>>,
    oi_cache: OiCache,
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

        // Subscribe in batches with a gap between frames.
        let symbols = core.subscriptions();
        for (i, batch) in subscription_batches(&symbols).into_iter().enumerate() {
            let frame = subscribe_frame(&batch, i == 0);
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
                    if write.send(Message::Ping(Vec::new().into())).await.is_err() {
                        debug!(provider = %core.id, "ping failed, connection likely dead");
                        break;
                    }
                }
                msg = read.next() => match msg {
                    Some(Ok(Message::Text(text))) => {
                        handle_text(&core, &text, &updates, &flow, &oi_cache);
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

/// Dispatch one text frame.
fn handle_text(
    core: &ProviderCore,
    text: &str,
    updates: &mpsc::UnboundedSender<MarketUpdate>,
    flow: &Mutex<FlowAccumulator>,
    oi_cache: &OiCache,
) {
    let value: Value = match serde_json::from_str(text) {
        Ok(value) => value,
        Err(_) => {
            core.record_parse_error();
            return;
        }
    };

    if value.is_array() {
        // !ticker@arr batch.
        let Ok(tickers) = serde_json::from_value::<Vec<TickerEvent>>(value) else {
            core.record_parse_error();
            return;
        };
        let now_ms = Utc::now().timestamp_millis();
        for ticker in tickers {
            if !core.is_subscribed(&ticker.symbol) {
                continue;
            }
            core.record_message(now_ms);
            let cached = cached_oi(oi_cache, &ticker.symbol, now_ms);
            let _ = updates.send(normalize_ticker(&ticker, cached));
        }
        return;
    }

    match value.get("e").and_then(Value::as_str) {
        Some("aggTrade") => {
            let Ok(trade) = serde_json::from_value::<AggTradeEvent>(value) else {
                core.record_parse_error();
                return;
            };
            core.record_message(Utc::now().timestamp_millis());
            let side = if trade.buyer_is_maker {
                Side::Sell
            } else {
                Side::Buy
            };
            flow.lock().record(
                &trade.symbol,
                side,
                trade.price,
                trade.quantity,
                epoch_ms(trade.trade_time),
            );
        }
        Some(_) => {}
        None => {
            if let Some(error) = value.get("error") {
                warn!(provider = %core.id, %error, "subscription rejected");
            }
            // {"result":null,"id":n} acks land here as well.
        }
    }
}

/// Drain the flow accumulator on a fixed cadence.
async fn run_flush_loop(
    core: Arc<ProviderCore>,
    flow: Arc<Mutex<FlowAccumulator>>,
    updates: mpsc::UnboundedSender<MarketUpdate>,
    oi_cache: OiCache,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut timer = tokio::time::interval(Duration::from_millis(FLOW_FLUSH_MS));
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = timer.tick() => {
                let drained = flow.lock().drain(MIN_QUOTE_NOTIONAL);
                if drained.is_empty() {
                    continue;
                }
                let now_ms = Utc::now().timestamp_millis();
                for (symbol, totals) in drained {
                    let cached = cached_oi(&oi_cache, &symbol, now_ms);
                    let mut update =
                        MarketUpdate::new(core.id, symbol, epoch_ms(totals.last_time_ms));
                    update.price = Some(totals.last_price);
                    update.volume_buy = Some(totals.buy_base);
                    update.volume_sell = Some(totals.sell_base);
                    update.volume_buy_quote = Some(totals.buy_quote);
                    update.volume_sell_quote = Some(totals.sell_quote);
                    if let Some((oi, venue_time)) = cached {
                        update.open_interest = Some(oi);
                        update.open_interest_time = Some(epoch_ms(venue_time));
                    }
                    let _ = updates.send(update);
                }
            }
        }
    }
}

/// Poll `/fapi/v1/openInterest` for subscribed symbols in spaced batches.
async fn run_oi_poll_loop(
    core: Arc<ProviderCore>,
    http: reqwest::Client,
    rest_base: String,
    oi_cache: OiCache,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut round = tokio::time::interval(OI_POLL_ROUND);
    loop {
        tokio::select! {
            _ = shutdown.changed() => break,
            _ = round.tick() => {
                let symbols = core.subscriptions();
                for batch in symbols.chunks(OI_POLL_BATCH) {
                    if *shutdown.borrow() {
                        return;
                    }
                    let fetches = batch.iter().map(|symbol| {
                        let http = http.clone();
                        let url = format!(
                            "{}/fapi/v1/openInterest?symbol={}",
                            rest_base, symbol
                        );
                        async move {
                            let response = http.get(&url).send().await.ok()?;
                            response.json::<OpenInterestResponse>().await.ok()
                        }
                    });
                    let results = futures::future::join_all(fetches).await;

                    let fetched_ms = Utc::now().timestamp_millis();
                    {
                        let mut cache = oi_cache.lock();
                        for entry in results.into_iter().flatten() {
                            if entry.open_interest.is_finite() && entry.open_interest >= 0.0 {
                                cache.insert(
                                    entry.symbol.clone(),
                                    OiEntry {
                                        value: entry.open_interest,
                                        venue_time_ms: entry.time,
                                        fetched_ms,
                                    },
                                );
                            }
                        }
                    }
                    tokio::time::sleep(OI_POLL_BATCH_GAP).await;
                }
            }
        }
    }
}

fn cached_oi(cache: &OiCache, symbol: &str, now_ms: i64) -> Option<(f64, i64)> {
    let cache = cache.lock();
    let entry = cache.get(symbol)?;
    (now_ms - entry.fetched_ms <= OI_STALENESS_MS).then_some((entry.value, entry.venue_time_ms))
}

fn normalize_ticker(ticker: &TickerEvent, cached_oi: Option<(f64, i64)>) -> MarketUpdate {
    let mut update = MarketUpdate::new(
        ProviderId::new(Exchange::Binance, MarketType::Futures),
        ticker.symbol.clone(),
        epoch_ms(ticker.event_time),
    );
    update.price = Some(ticker.last_price);
    update.volume = Some(ticker.volume);
    update.quote_volume = Some(ticker.quote_volume);
    if let Some((oi, venue_time)) = cached_oi {
        update.open_interest = Some(oi);
        update.open_interest_time = Some(epoch_ms(venue_time));
    }
    update
}

fn filter_catalog(info: ExchangeInfo) -> Vec<String> {
    let mut symbols: Vec<String> = info
        .symbols
        .into_iter()
        .filter(|s| {
            s.status == "TRADING"
                && s.quote_asset == QUOTE_SUFFIX
                && s.contract_type == "PERPETUAL"
                && is_valid_symbol(&s.symbol)
        })
        .map(|s| s.symbol)
        .collect();
    symbols.sort();
    symbols
}

fn subscribe_frame(symbols: &[String], include_ticker_arr: bool) -> String {
    let mut params: Vec<String> = Vec::with_capacity(symbols.len() + 1);
    if include_ticker_arr {
        params.push("!ticker@arr".to_string());
    }
    params.extend(
        symbols
            .iter()
            .map(|s| format!("{}@aggTrade", s.to_lowercase())),
    );
    json!({ "method": "SUBSCRIBE", "params": params, "id": 1 }).to_string()
}

fn unsubscribe_frame(symbols: &[String]) -> String {
    let params: Vec<String> = symbols
        .iter()
        .map(|s| format!("{}@aggTrade", s.to_lowercase()))
        .collect();
    json!({ "method": "UNSUBSCRIBE", "params": params, "id": 1 }).to_string()
}

fn epoch_ms(ts_ms: i64) -> DateTime<Utc> {
    Utc.timestamp_millis_opt(ts_ms)
        .single()
        .unwrap_or_else(Utc::now)
}

#[derive(Debug, Deserialize)]
struct ExchangeInfo {
    symbols: Vec<SymbolInfo>,
}

#[derive(Debug, Deserialize)]
struct SymbolInfo {
    symbol: String,
    status: String,
    #[serde(rename = "quoteAsset")]
    quote_asset: String,
    #[serde(rename = "contractType", default)]
    contract_type: String,
}

/// One element of a `!ticker@arr` frame.
#[derive(Debug, Deserialize)]
struct TickerEvent {
    #[serde(rename = "E")]
    event_time: i64,
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "c", deserialize_with = "de_str_f64")]
    last_price: f64,
    #[serde(rename = "v", deserialize_with = "de_str_f64")]
    volume: f64,
    #[serde(rename = "q", deserialize_with = "de_str_f64")]
    quote_volume: f64,
}

/// `@aggTrade` event. `m == true` means the buyer was the maker, i.e. an
/// aggressive sell.
#[derive(Debug, Deserialize)]
struct AggTradeEvent {
    #[serde(rename = "s")]
    symbol: String,
    #[serde(rename = "p", deserialize_with = "de_str_f64")]
    price: f64,
    #[serde(rename = "q", deserialize_with = "de_str_f64")]
    quantity: f64,
    #[serde(rename = "T")]
    trade_time: i64,
    #[serde(rename = "m")]
    buyer_is_maker: bool,
}

#[derive(Debug, Deserialize)]
struct OpenInterestResponse {
    #[serde(rename = "openInterest", deserialize_with = "de_str_f64")]
    open_interest: f64,
    symbol: String,
    time: i64,
}

fn de_str_f64<'de, D>(deserializer: D) -> Result<f64, D::Error>
where
    D: serde::de::Deserializer<'de>,
{
    let raw: String = Deserialize::deserialize(deserializer)?;
    raw.parse::<f64>().map_err(serde::de::Error::custom)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_ticker_event_deserialise() {
        let input = r#"
            {
                "e": "24hrTicker",
                "E": 1672304486865,
                "s": "BTCUSDT",
                "c": "16578.50",
                "v": "123456.7",
                "q": "2046000000.5",
                "o": "16000.00",
                "h": "16700.00",
                "l": "15900.00"
            }
        "#;
        let ticker: TickerEvent = serde_json::from_str(input).unwrap();
        assert_eq!(ticker.symbol, "BTCUSDT");
        assert_eq!(ticker.last_price, 16578.50);
        assert_eq!(ticker.volume, 123456.7);
        assert_eq!(ticker.event_time, 1672304486865);
    }

    #[test]
    fn test_agg_trade_side_mapping() {
        let input = r#"
            {
                "e": "aggTrade",
                "E": 1672304486865,
                "s": "BTCUSDT",
                "a": 5933014,
                "p": "16578.50",
                "q": "0.001",
                "f": 100,
                "l": 105,
                "T": 1672304486860,
                "m": true
            }
        "#;
        let trade: AggTradeEvent = serde_json::from_str(input).unwrap();
        assert!(trade.buyer_is_maker);
        // Buyer-is-maker means the seller was the aggressor.
        let side = if trade.buyer_is_maker {
            Side::Sell
        } else {
            Side::Buy
        };
        assert_eq!(side, Side::Sell);
    }

    #[test]
    fn test_open_interest_response_deserialise() {
        let input = r#"{ "openInterest": "10659.509", "symbol": "BTCUSDT", "time": 1589437530011 }"#;
        let response: OpenInterestResponse = serde_json::from_str(input).unwrap();
        assert_eq!(response.open_interest, 10659.509);
        assert_eq!(response.symbol, "BTCUSDT");
        assert_eq!(response.time, 1589437530011);
    }

    #[test]
    fn test_catalog_filter() {
        let info = ExchangeInfo {
            symbols: vec![
                SymbolInfo {
                    symbol: "BTCUSDT".into(),
                    status: "TRADING".into(),
                    quote_asset: "USDT".into(),
                    contract_type: "PERPETUAL".into(),
                },
                SymbolInfo {
                    symbol: "ETHBUSD".into(),
                    status: "TRADING".into(),
                    quote_asset: "BUSD".into(),
                    contract_type: "PERPETUAL".into(),
                },
                SymbolInfo {
                    symbol: "SOLUSDT".into(),
                    status: "BREAK".into(),
                    quote_asset: "USDT".into(),
                    contract_type: "PERPETUAL".into(),
                },
                SymbolInfo {
                    symbol: "BTCUSDT_230331".into(),
                    status: "TRADING".into(),
                    quote_asset: "USDT".into(),
                    contract_type: "CURRENT_QUARTER".into(),
                },
            ],
        };
        assert_eq!(filter_catalog(info), vec!["BTCUSDT".to_string()]);
    }

    #[test]
    fn test_subscribe_frame_shape() {
        let frame = subscribe_frame(&["BTCUSDT".to_string(), "ETHUSDT".to_string()], true);
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value["method"], "SUBSCRIBE");
        let params: Vec<String> = value["params"]
            .as_array()
            .unwrap()
            .iter()
            .map(|p| p.as_str().unwrap().to_string())
            .collect();
        assert_eq!(
            params,
            vec!["!ticker@arr", "btcusdt@aggTrade", "ethusdt@aggTrade"]
        );
    }

    #[test]
    fn test_oi_cache_staleness() {
        let cache: OiCache = Arc::new(Mutex::new(FnvHashMap::default()));
        cache.lock().insert(
            "BTCUSDT".to_string(),
            OiEntry {
                value: 10_000.0,
                venue_time_ms: 1_000,
                fetched_ms: 1_000,
            },
        );

        assert_eq!(
            cached_oi(&cache, "BTCUSDT", 1_000 + OI_STALENESS_MS),
            Some((10_000.0, 1_000))
        );
        assert_eq!(cached_oi(&cache, "BTCUSDT", 1_001 + OI_STALENESS_MS), None);
        assert_eq!(cached_oi(&cache, "ETHUSDT", 2_000), None);
    }

    #[test]
    fn test_normalize_ticker_attaches_cached_oi() {
        let ticker = TickerEvent {
            event_time: 5_000,
            symbol: "BTCUSDT".into(),
            last_price: 100.0,
            volume: 10.0,
            quote_volume: 1_000.0,
        };
        let update = normalize_ticker(&ticker, Some((42_000.0, 4_000)));
        assert_eq!(update.price, Some(100.0));
        assert_eq!(update.open_interest, Some(42_000.0));
        assert_eq!(update.timestamp_ms(), 5_000);
        assert_eq!(
            update.open_interest_time.map(|t| t.timestamp_millis()),
            Some(4_000)
        );

        let update = normalize_ticker(&ticker, None);
        assert_eq!(update.open_interest, None);
    }
}
