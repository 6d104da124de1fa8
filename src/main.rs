use anyhow::Result;
use async_trait::async_trait;
use oi_sentinel::config::Config;
use oi_sentinel::event::{Exchange, MarketType};
use oi_sentinel::exchange::{
    BinanceFuturesProvider, BybitFuturesProvider, MarketDataProvider, OkxFuturesProvider,
};
use oi_sentinel::gateway::IngestionGateway;
use oi_sentinel::notify::NotificationPipeline;
use oi_sentinel::repository::{ChatSink, MemorySignalRepository, MemoryTriggerRepository};
use oi_sentinel::store::{BucketStore, MarketState, MetricsCalculator};
use oi_sentinel::trigger::evaluator::EvaluatorSettings;
use oi_sentinel::trigger::{TriggerCache, TriggerEvaluator};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::{info, warn};

/// Stand-in chat transport until a real messenger adapter is wired: logs
/// the outbound message and reports success.
struct LogChatSink;

#[async_trait]
impl ChatSink for LogChatSink {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool {
        info!(chat_id, text, "outbound alert");
        true
    }
}

#[tokio::main]
async fn main() -> Result<()> {
    init_logging();

    let config = Config::from_env();
    info!(providers = ?config.providers, "starting oi-sentinel");

    // Aggregation stores and the read-side calculator.
    let buckets = Arc::new(RwLock::new(BucketStore::new(
        config.max_15s_buckets,
        config.max_minute_buckets,
    )));
    let market = Arc::new(RwLock::new(MarketState::new(config.max_tracked_symbols)));
    let calc = MetricsCalculator::new(
        buckets.clone(),
        market.clone(),
        config.fallback_shift_multiplier,
    );

    // External-store ports. In-memory implementations stand in until a
    // durable store is configured.
    let trigger_repo = Arc::new(MemoryTriggerRepository::new());
    let signal_repo = Arc::new(MemorySignalRepository::new());
    let registry = Arc::new(TriggerCache::new(trigger_repo));
    registry.init().await?;

    let pipeline = Arc::new(NotificationPipeline::new(
        Arc::new(LogChatSink),
        signal_repo,
    ));
    pipeline.clone().start();

    let evaluator = Arc::new(TriggerEvaluator::new(
        EvaluatorSettings::from(&config),
        calc,
        registry.clone(),
        pipeline.clone(),
    ));
    evaluator.start();

    let gateway = Arc::new(IngestionGateway::new(
        buckets,
        market,
        evaluator.touch_sender(),
        config.symbol_check_interval_ms,
    ));
    for id in &config.providers {
        match build_provider(id.exchange, id.market_type) {
            Some(provider) => gateway.register_provider(provider),
            None => warn!(provider = %id, "no connector for provider, skipping"),
        }
    }

    match gateway.connect().await {
        Ok(connected) => info!(connected, "ingestion started"),
        Err(e) => warn!(error = %e, "running with zero feeds"),
    }

    tokio::signal::ctrl_c().await?;
    info!("shutting down");

    evaluator.stop();
    pipeline.stop();
    gateway.disconnect().await;

    Ok(())
}

fn build_provider(
    exchange: Exchange,
    market_type: MarketType,
) -> Option<Arc<dyn MarketDataProvider>> {
    // Open interest is a derivatives concept; only futures connectors
    // exist.
    if market_type != MarketType::Futures {
        return None;
    }
    Some(match exchange {
        Exchange::Binance => Arc::new(BinanceFuturesProvider::new()),
        Exchange::Bybit => Arc::new(BybitFuturesProvider::new()),
        Exchange::Okx => Arc::new(OkxFuturesProvider::new()),
    })
}

fn init_logging() {
    let debug = std::env::var("DEBUG")
        .map(|v| v == "1" || v.eq_ignore_ascii_case("true"))
        .unwrap_or(false);
    let default_level = if debug {
        "debug".to_string()
    } else {
        std::env::var("LOG_LEVEL").unwrap_or_else(|_| "info".to_string())
    };
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::try_from_default_env()
                .unwrap_or_else(|_| tracing_subscriber::EnvFilter::new(default_level)),
        )
        .init();
}
