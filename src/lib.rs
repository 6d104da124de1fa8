//! oi-sentinel: real-time derivatives market surveillance.
//!
//! Ingests trade, ticker, and open-interest updates from multiple venues,
//! maintains rolling per-symbol time-series state, and fires user-configured
//! triggers when a symbol's open interest moves by a configured percentage
//! within a configured window. Alerts are delivered through a chat sink
//! behind rate limits, deduplication, and per-user cooldowns.

pub mod config;
pub mod error;
pub mod event;
pub mod exchange;
pub mod gateway;
pub mod notify;
pub mod repository;
pub mod store;
pub mod trigger;

// Re-export the types most consumers wire together.
pub use config::Config;
pub use error::{FeedError, StoreError};
pub use event::{Exchange, MarketType, MarketUpdate, ProviderId, Side};
pub use exchange::{
    BinanceFuturesProvider, BybitFuturesProvider, HybridProvider, MarketDataProvider,
    OkxFuturesProvider, ProviderHealth,
};
pub use gateway::IngestionGateway;
pub use notify::NotificationPipeline;
pub use repository::{
    ChatSink, MemorySignalRepository, MemoryTriggerRepository, RecordingChatSink,
    SignalRepository, TriggerRepository,
};
pub use store::{BucketStore, MarketState, Metrics, MetricsCalculator};
pub use trigger::{
    Direction, Signal, Trigger, TriggerCache, TriggerEvaluator, TriggerSpec,
};
