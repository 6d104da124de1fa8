//! Ports to the external trigger store, signal store, and chat sink, plus
//! in-memory implementations used by the composition root until a durable
//! store is wired, and by the test suite throughout.

use crate::error::StoreError;
use crate::trigger::{Signal, Trigger, TriggerSpec};
use async_trait::async_trait;
use chrono::{Duration as ChronoDuration, Utc};
use parking_lot::Mutex;
use std::sync::atomic::{AtomicI64, Ordering};

/// Persistent store of trigger configurations.
#[async_trait]
pub trait TriggerRepository: Send + Sync {
    async fn init(&self) -> Result<(), StoreError>;
    async fn all_active(&self) -> Result<Vec<Trigger>, StoreError>;
    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Trigger>, StoreError>;
    async fn save(&self, spec: TriggerSpec) -> Result<Trigger, StoreError>;
    async fn remove(&self, id: i64, user_id: i64) -> Result<bool, StoreError>;
}

/// Persistent store of fired signals.
#[async_trait]
pub trait SignalRepository: Send + Sync {
    async fn save(&self, signal: &Signal) -> Result<(), StoreError>;
    async fn count_24h(&self, trigger_id: i64, symbol: &str) -> Result<u32, StoreError>;
    async fn count_24h_by_user_symbol(
        &self,
        user_id: i64,
        symbol: &str,
    ) -> Result<u32, StoreError>;
    async fn recent_by_symbol(&self, symbol: &str, hours: u32) -> Result<Vec<Signal>, StoreError>;
}

/// Outbound chat transport. Returns true when the message was accepted.
#[async_trait]
pub trait ChatSink: Send + Sync {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool;
}

/// In-memory trigger repository.
#[derive(Default)]
pub struct MemoryTriggerRepository {
    triggers: Mutex<Vec<Trigger>>,
    next_id: AtomicI64,
}

impl MemoryTriggerRepository {
    pub fn new() -> Self {
        Self {
            triggers: Mutex::new(Vec::new()),
            next_id: AtomicI64::new(1),
        }
    }
}

#[async_trait]
impl TriggerRepository for MemoryTriggerRepository {
    async fn init(&self) -> Result<(), StoreError> {
        Ok(())
    }

    async fn all_active(&self) -> Result<Vec<Trigger>, StoreError> {
        Ok(self
            .triggers
            .lock()
            .iter()
            .filter(|t| t.is_active)
            .cloned()
            .collect())
    }

    async fn find_by_user(&self, user_id: i64) -> Result<Vec<Trigger>, StoreError> {
        Ok(self
            .triggers
            .lock()
            .iter()
            .filter(|t| t.user_id == user_id)
            .cloned()
            .collect())
    }

    async fn save(&self, spec: TriggerSpec) -> Result<Trigger, StoreError> {
        spec.validate().map_err(StoreError::InvalidSpec)?;
        let trigger = Trigger {
            id: self.next_id.fetch_add(1, Ordering::SeqCst),
            user_id: spec.user_id,
            direction: spec.direction,
            oi_change_percent: spec.oi_change_percent,
            time_interval_minutes: spec.time_interval_minutes,
            notification_limit_seconds: spec.notification_limit_seconds,
            is_active: true,
        };
        self.triggers.lock().push(trigger.clone());
        Ok(trigger)
    }

    async fn remove(&self, id: i64, user_id: i64) -> Result<bool, StoreError> {
        let mut triggers = self.triggers.lock();
        let before = triggers.len();
        triggers.retain(|t| !(t.id == id && t.user_id == user_id));
        Ok(triggers.len() != before)
    }
}

/// In-memory signal repository.
#[derive(Default)]
pub struct MemorySignalRepository {
    signals: Mutex<Vec<Signal>>,
}

impl MemorySignalRepository {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.signals.lock().len()
    }

    pub fn is_empty(&self) -> bool {
        self.signals.lock().is_empty()
    }

    pub fn all(&self) -> Vec<Signal> {
        self.signals.lock().clone()
    }
}

#[async_trait]
impl SignalRepository for MemorySignalRepository {
    async fn save(&self, signal: &Signal) -> Result<(), StoreError> {
        self.signals.lock().push(signal.clone());
        Ok(())
    }

    async fn count_24h(&self, trigger_id: i64, symbol: &str) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        Ok(self
            .signals
            .lock()
            .iter()
            .filter(|s| s.trigger_id == trigger_id && s.symbol == symbol && s.created_at > cutoff)
            .count() as u32)
    }

    async fn count_24h_by_user_symbol(
        &self,
        user_id: i64,
        symbol: &str,
    ) -> Result<u32, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::hours(24);
        Ok(self
            .signals
            .lock()
            .iter()
            .filter(|s| s.user_id == user_id && s.symbol == symbol && s.created_at > cutoff)
            .count() as u32)
    }

    async fn recent_by_symbol(&self, symbol: &str, hours: u32) -> Result<Vec<Signal>, StoreError> {
        let cutoff = Utc::now() - ChronoDuration::hours(i64::from(hours));
        Ok(self
            .signals
            .lock()
            .iter()
            .filter(|s| s.symbol == symbol && s.created_at > cutoff)
            .cloned()
            .collect())
    }
}

/// Signal repository that fails every save. Test double for persistence
/// outages.
#[derive(Default)]
pub struct FailingSignalRepository;

#[async_trait]
impl SignalRepository for FailingSignalRepository {
    async fn save(&self, _signal: &Signal) -> Result<(), StoreError> {
        Err(StoreError::Unavailable("signal store down".into()))
    }

    async fn count_24h(&self, _trigger_id: i64, _symbol: &str) -> Result<u32, StoreError> {
        Ok(0)
    }

    async fn count_24h_by_user_symbol(
        &self,
        _user_id: i64,
        _symbol: &str,
    ) -> Result<u32, StoreError> {
        Ok(0)
    }

    async fn recent_by_symbol(
        &self,
        _symbol: &str,
        _hours: u32,
    ) -> Result<Vec<Signal>, StoreError> {
        Ok(Vec::new())
    }
}

/// Chat sink that records outbound messages; can be primed to fail the
/// first `fail_first` sends.
#[derive(Default)]
pub struct RecordingChatSink {
    sent: Mutex<Vec<(i64, String)>>,
    fail_first: Mutex<u32>,
}

impl RecordingChatSink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn failing_first(count: u32) -> Self {
        Self {
            sent: Mutex::new(Vec::new()),
            fail_first: Mutex::new(count),
        }
    }

    pub fn sent(&self) -> Vec<(i64, String)> {
        self.sent.lock().clone()
    }

    pub fn sent_count(&self) -> usize {
        self.sent.lock().len()
    }
}

#[async_trait]
impl ChatSink for RecordingChatSink {
    async fn send_message(&self, chat_id: i64, text: &str) -> bool {
        {
            let mut remaining = self.fail_first.lock();
            if *remaining > 0 {
                *remaining -= 1;
                return false;
            }
        }
        self.sent.lock().push((chat_id, text.to_string()));
        true
    }
}
