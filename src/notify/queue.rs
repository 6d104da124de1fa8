//! Bounded three-priority outbound queue with deduplication.

use fnv::FnvHashMap;
use std::collections::VecDeque;

/// Total queue depth across priorities.
pub const QUEUE_CAP: usize = 1_000;
/// Window within which a repeated dedup key is dropped.
pub const DEDUP_WINDOW_MS: i64 = 5_000;
/// Delivery attempts before a message is dropped.
pub const MAX_SEND_ATTEMPTS: u32 = 3;

/// Message priority derived from the absolute OI change.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
pub enum Priority {
    High,
    Normal,
    Low,
}

impl Priority {
    /// HIGH >= 10 %, NORMAL in [5, 10), LOW below 5.
    pub fn from_oi_change(oi_change_percent: f64) -> Self {
        let magnitude = oi_change_percent.abs();
        if magnitude >= 10.0 {
            Priority::High
        } else if magnitude >= 5.0 {
            Priority::Normal
        } else {
            Priority::Low
        }
    }
}

/// Key identifying near-identical alerts: chat, symbol, OI% at one decimal.
pub type DedupKey = (i64, String, i64);

pub fn dedup_key(chat_id: i64, symbol: &str, oi_change_percent: f64) -> DedupKey {
    (chat_id, symbol.to_string(), (oi_change_percent * 10.0).round() as i64)
}

/// One queued outbound message.
#[derive(Debug, Clone)]
pub struct QueuedMessage {
    pub chat_id: i64,
    pub text: String,
    pub priority: Priority,
    pub attempts: u32,
    pub enqueued_ms: i64,
}

/// Counters surfaced by `stats()`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueueStats {
    pub enqueued: u64,
    pub deduplicated: u64,
    pub dropped_overflow: u64,
    pub delivered: u64,
    pub dropped_failed: u64,
}

/// Priority queue with dedup window and overflow policy.
#[derive(Debug, Default)]
pub struct NotificationQueue {
    high: VecDeque<QueuedMessage>,
    normal: VecDeque<QueuedMessage>,
    low: VecDeque<QueuedMessage>,
    dedup: FnvHashMap<DedupKey, i64>,
    pub stats: QueueStats,
}

impl NotificationQueue {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.high.len() + self.normal.len() + self.low.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Enqueue a message. Returns false when deduplicated or displaced by
    /// the overflow policy.
    pub fn enqueue(
        &mut self,
        message: QueuedMessage,
        dedup: Option<DedupKey>,
        now_ms: i64,
    ) -> bool {
        if let Some(key) = dedup {
            self.dedup.retain(|_, seen| now_ms - *seen < DEDUP_WINDOW_MS);
            if let Some(seen) = self.dedup.get(&key) {
                if now_ms - seen < DEDUP_WINDOW_MS {
                    self.stats.deduplicated += 1;
                    return false;
                }
            }
            self.dedup.insert(key, now_ms);
        }

        self.lane_mut(message.priority).push_back(message);
        self.stats.enqueued += 1;

        // Over cap: displace the oldest LOW, then NORMAL. HIGH is never
        // displaced, so an all-HIGH queue may run past the cap.
        while self.len() > QUEUE_CAP {
            if self.low.pop_front().is_some() || self.normal.pop_front().is_some() {
                self.stats.dropped_overflow += 1;
            } else {
                break;
            }
        }
        true
    }

    /// Pop the head of the highest non-empty priority.
    pub fn pop_next(&mut self) -> Option<QueuedMessage> {
        self.high
            .pop_front()
            .or_else(|| self.normal.pop_front())
            .or_else(|| self.low.pop_front())
    }

    /// Return a message to the tail of its own priority (per-chat budget
    /// blocked, or a retryable send failure).
    pub fn requeue_tail(&mut self, message: QueuedMessage) {
        self.lane_mut(message.priority).push_back(message);
    }

    fn lane_mut(&mut self, priority: Priority) -> &mut VecDeque<QueuedMessage> {
        match priority {
            Priority::High => &mut self.high,
            Priority::Normal => &mut self.normal,
            Priority::Low => &mut self.low,
        }
    }

    pub fn lane_len(&self, priority: Priority) -> usize {
        match priority {
            Priority::High => self.high.len(),
            Priority::Normal => self.normal.len(),
            Priority::Low => self.low.len(),
        }
    }

    /// Drop everything queued.
    pub fn clear(&mut self) {
        self.high.clear();
        self.normal.clear();
        self.low.clear();
        self.dedup.clear();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn message(chat_id: i64, priority: Priority) -> QueuedMessage {
        QueuedMessage {
            chat_id,
            text: "alert".into(),
            priority,
            attempts: 0,
            enqueued_ms: 0,
        }
    }

    #[test]
    fn test_priority_thresholds() {
        assert_eq!(Priority::from_oi_change(12.0), Priority::High);
        assert_eq!(Priority::from_oi_change(-12.0), Priority::High);
        assert_eq!(Priority::from_oi_change(10.0), Priority::High);
        assert_eq!(Priority::from_oi_change(7.0), Priority::Normal);
        assert_eq!(Priority::from_oi_change(-5.0), Priority::Normal);
        assert_eq!(Priority::from_oi_change(4.99), Priority::Low);
    }

    #[test]
    fn test_pop_order_by_priority() {
        let mut queue = NotificationQueue::new();
        queue.enqueue(message(1, Priority::Low), None, 0);
        queue.enqueue(message(2, Priority::High), None, 0);
        queue.enqueue(message(3, Priority::Normal), None, 0);

        assert_eq!(queue.pop_next().unwrap().chat_id, 2);
        assert_eq!(queue.pop_next().unwrap().chat_id, 3);
        assert_eq!(queue.pop_next().unwrap().chat_id, 1);
        assert!(queue.pop_next().is_none());
    }

    #[test]
    fn test_dedup_within_window() {
        let mut queue = NotificationQueue::new();
        let key = dedup_key(1, "BTCUSDT", 6.04);

        assert!(queue.enqueue(message(1, Priority::Normal), Some(key.clone()), 0));
        // Same rounded key inside 5 s is dropped.
        assert!(!queue.enqueue(message(1, Priority::Normal), Some(key.clone()), 4_999));
        assert_eq!(queue.stats.deduplicated, 1);
        // Outside the window it goes through again.
        assert!(queue.enqueue(message(1, Priority::Normal), Some(key), 5_000));
    }

    #[test]
    fn test_dedup_key_rounds_to_one_decimal() {
        assert_eq!(dedup_key(1, "BTCUSDT", 6.04), dedup_key(1, "BTCUSDT", 6.04999));
        assert_ne!(dedup_key(1, "BTCUSDT", 6.04), dedup_key(1, "BTCUSDT", 6.15));
        assert_ne!(dedup_key(1, "BTCUSDT", 6.0), dedup_key(2, "BTCUSDT", 6.0));
    }

    #[test]
    fn test_overflow_drops_low_then_normal() {
        let mut queue = NotificationQueue::new();
        for _ in 0..10 {
            queue.enqueue(message(1, Priority::Low), None, 0);
        }
        for _ in 0..(QUEUE_CAP - 10) {
            queue.enqueue(message(1, Priority::Normal), None, 0);
        }
        assert_eq!(queue.len(), QUEUE_CAP);

        // Next enqueue displaces the oldest LOW.
        queue.enqueue(message(1, Priority::High), None, 0);
        assert_eq!(queue.len(), QUEUE_CAP);
        assert_eq!(queue.lane_len(Priority::Low), 9);
        assert_eq!(queue.stats.dropped_overflow, 1);

        // Once LOW is exhausted, NORMAL is displaced.
        for _ in 0..9 {
            queue.enqueue(message(1, Priority::High), None, 0);
        }
        assert_eq!(queue.lane_len(Priority::Low), 0);
        queue.enqueue(message(1, Priority::High), None, 0);
        assert_eq!(queue.lane_len(Priority::Normal), QUEUE_CAP - 10 - 1);
    }

    #[test]
    fn test_clear() {
        let mut queue = NotificationQueue::new();
        queue.enqueue(message(1, Priority::High), None, 0);
        queue.clear();
        assert!(queue.is_empty());
    }
}
