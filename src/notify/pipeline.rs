//! Outbound message pipeline: priority drain, venue rate budgets, retries,
//! and signal persistence ordering.
//!
//! A message reaches the chat sink only after its signal has been accepted
//! by the signal store.

use crate::notify::limiter::SlidingWindow;
use crate::notify::queue::{
    dedup_key, NotificationQueue, Priority, QueueStats, QueuedMessage, MAX_SEND_ATTEMPTS,
};
use crate::repository::{ChatSink, SignalRepository};
use crate::store::Metrics;
use crate::trigger::{Signal, Trigger};
use chrono::Utc;
use fnv::FnvHashMap;
use parking_lot::Mutex;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tracing::{debug, info, warn};

/// Drain cadence.
pub const DRAIN_TICK: Duration = Duration::from_millis(50);
/// Messages allowed in any trailing second, globally and per chat. Safety
/// margin under the venue's hard cap of 30.
pub const RATE_CAP: usize = 28;
const RATE_WINDOW_MS: i64 = 1_000;

struct PipelineState {
    queue: NotificationQueue,
    global: SlidingWindow,
    per_chat: FnvHashMap<i64, SlidingWindow>,
}

/// Pipeline statistics snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PipelineStats {
    pub queue_depth: usize,
    pub counters: QueueStats,
}

/// Debounced, rate-limited outbound dispatcher.
pub struct NotificationPipeline {
    state: Mutex<PipelineState>,
    sink: Arc<dyn ChatSink>,
    signals: Arc<dyn SignalRepository>,
    shutdown: Mutex<Option<watch::Sender<bool>>>,
}

impl NotificationPipeline {
    pub fn new(sink: Arc<dyn ChatSink>, signals: Arc<dyn SignalRepository>) -> Self {
        Self {
            state: Mutex::new(PipelineState {
                queue: NotificationQueue::new(),
                global: SlidingWindow::new(RATE_CAP, RATE_WINDOW_MS),
                per_chat: FnvHashMap::default(),
            }),
            sink,
            signals,
            shutdown: Mutex::new(None),
        }
    }

    /// Start the drain loop.
    pub fn start(self: Arc<Self>) {
        let (tx, mut rx) = watch::channel(false);
        *self.shutdown.lock() = Some(tx);

        let pipeline = self;
        tokio::spawn(async move {
            let mut tick = tokio::time::interval(DRAIN_TICK);
            loop {
                tokio::select! {
                    _ = rx.changed() => break,
                    _ = tick.tick() => {
                        let now_ms = Utc::now().timestamp_millis();
                        pipeline.process_tick(now_ms).await;
                    }
                }
            }
            debug!("notification drain loop stopped");
        });
    }

    /// Stop the drain loop, dropping everything still queued.
    pub fn stop(&self) {
        if let Some(tx) = self.shutdown.lock().take() {
            let _ = tx.send(true);
        }
        self.state.lock().queue.clear();
        info!("notification pipeline stopped");
    }

    /// Queue a rendered message. Returns false when deduplicated or
    /// displaced. The signal, when present, sets priority and dedup key.
    pub fn enqueue(
        &self,
        chat_id: i64,
        text: impl Into<String>,
        signal: Option<&Signal>,
        _trigger_interval_minutes: Option<u32>,
    ) -> bool {
        self.enqueue_at(chat_id, text, signal, Utc::now().timestamp_millis())
    }

    fn enqueue_at(
        &self,
        chat_id: i64,
        text: impl Into<String>,
        signal: Option<&Signal>,
        now_ms: i64,
    ) -> bool {
        let priority = signal
            .map(|s| Priority::from_oi_change(s.oi_change_percent))
            .unwrap_or(Priority::Normal);
        let dedup = signal.map(|s| dedup_key(chat_id, &s.symbol, s.oi_change_percent));

        let message = QueuedMessage {
            chat_id,
            text: text.into(),
            priority,
            attempts: 0,
            enqueued_ms: now_ms,
        };
        self.state.lock().queue.enqueue(message, dedup, now_ms)
    }

    /// Persist the signal for a fired trigger and queue its chat message.
    ///
    /// Ordering contract: nothing is queued unless the signal store
    /// accepted the record.
    pub async fn dispatch(
        &self,
        trigger: &Trigger,
        symbol: &str,
        metrics: &Metrics,
        now_ms: i64,
    ) -> bool {
        let prior = match self.signals.count_24h(trigger.id, symbol).await {
            Ok(count) => count,
            Err(e) => {
                warn!(error = %e, "signal count failed, defaulting to 0");
                0
            }
        };

        let signal = Signal {
            trigger_id: trigger.id,
            user_id: trigger.user_id,
            symbol: symbol.to_string(),
            signal_number: prior + 1,
            oi_change_percent: metrics.oi_change_percent,
            price_change_percent: metrics.price_change_percent,
            current_price: metrics.current_price,
            created_at: Utc::now(),
        };

        if let Err(e) = self.signals.save(&signal).await {
            warn!(error = %e, trigger = trigger.id, symbol, "signal persist failed, not notifying");
            return false;
        }

        let text = render_alert(symbol, &signal, metrics);
        self.enqueue_at(
            trigger.user_id,
            text,
            Some(&signal),
            now_ms,
        )
    }

    /// One drain pass: deliver in priority order within the global and
    /// per-chat trailing-second budgets.
    pub(crate) async fn process_tick(&self, now_ms: i64) -> usize {
        let mut delivered = 0usize;
        let mut scan_budget = self.state.lock().queue.len();

        while scan_budget > 0 {
            scan_budget -= 1;

            let message = {
                let mut guard = self.state.lock();
                let state = &mut *guard;

                if !state.global.would_allow(now_ms) {
                    break;
                }
                let Some(message) = state.queue.pop_next() else {
                    break;
                };

                let chat = state
                    .per_chat
                    .entry(message.chat_id)
                    .or_insert_with(|| SlidingWindow::new(RATE_CAP, RATE_WINDOW_MS));
                if !chat.try_acquire(now_ms) {
                    // Per-chat budget is the blocker: back to the tail of
                    // its own priority, move on to the next message.
                    state.queue.requeue_tail(message);
                    continue;
                }
                state.global.try_acquire(now_ms);
                message
            };

            let ok = self.sink.send_message(message.chat_id, &message.text).await;

            let mut guard = self.state.lock();
            if ok {
                guard.queue.stats.delivered += 1;
                delivered += 1;
            } else {
                let mut message = message;
                message.attempts += 1;
                if message.attempts >= MAX_SEND_ATTEMPTS {
                    guard.queue.stats.dropped_failed += 1;
                    warn!(chat = message.chat_id, "message dropped after retries");
                } else {
                    guard.queue.requeue_tail(message);
                }
            }
        }

        delivered
    }

    pub fn stats(&self) -> PipelineStats {
        let state = self.state.lock();
        PipelineStats {
            queue_depth: state.queue.len(),
            counters: state.queue.stats,
        }
    }
}

fn render_alert(symbol: &str, signal: &Signal, metrics: &Metrics) -> String {
    let price = metrics
        .current_price
        .map(|p| format!(" @ {}", p))
        .unwrap_or_default();
    format!(
        "{} OI {:+.2}% over {}s{} (#{})",
        symbol,
        signal.oi_change_percent,
        metrics.time_window_seconds,
        price,
        signal.signal_number
    )
}
