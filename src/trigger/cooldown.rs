//! Per-(user, symbol) notification cooldowns.
//!
//! Two policies exist: the fixed cooldown (default) suppresses fires for the
//! trigger's configured limit, and the exponential variant stretches that
//! limit while fires keep landing back to back. The evaluator's debounce
//! already quenches bursts, so the backoff variant stays off unless
//! explicitly selected.

use fnv::FnvHashMap;

/// Cooldown policy between fires of the same (user, symbol).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum CooldownPolicy {
    #[default]
    Fixed,
    ExponentialBackoff,
}

/// Cap on the backoff multiplier.
const BACKOFF_MULTIPLIER_CAP: f64 = 8.0;

#[derive(Debug, Clone, Copy)]
struct CooldownEntry {
    last_fired_ms: i64,
    consecutive: u32,
}

/// Cooldown bookkeeping keyed by (user, symbol).
#[derive(Debug, Default)]
pub struct NotificationCooldowns {
    policy: CooldownPolicy,
    entries: FnvHashMap<(i64, String), CooldownEntry>,
}

impl NotificationCooldowns {
    pub fn new(policy: CooldownPolicy) -> Self {
        Self {
            policy,
            entries: FnvHashMap::default(),
        }
    }

    /// Returns true and records the fire when the key is out of cooldown.
    pub fn check_and_arm(
        &mut self,
        user_id: i64,
        symbol: &str,
        base_seconds: u32,
        now_ms: i64,
    ) -> bool {
        let base_ms = i64::from(base_seconds) * 1_000;
        let key = (user_id, symbol.to_string());

        match self.entries.get_mut(&key) {
            None => {
                self.entries.insert(
                    key,
                    CooldownEntry {
                        last_fired_ms: now_ms,
                        consecutive: 0,
                    },
                );
                true
            }
            Some(entry) => {
                let cooldown_ms = match self.policy {
                    CooldownPolicy::Fixed => base_ms,
                    CooldownPolicy::ExponentialBackoff => {
                        let multiplier =
                            1.5f64.powi(entry.consecutive as i32).min(BACKOFF_MULTIPLIER_CAP);
                        (base_ms as f64 * multiplier) as i64
                    }
                };

                if now_ms - entry.last_fired_ms < cooldown_ms {
                    return false;
                }

                // Back-to-back fires stretch the backoff; a quiet spell
                // (two cooldown periods) resets it.
                if now_ms - entry.last_fired_ms <= 2 * cooldown_ms {
                    entry.consecutive += 1;
                } else {
                    entry.consecutive = 0;
                }
                entry.last_fired_ms = now_ms;
                true
            }
        }
    }

    /// Drop entries whose last fire predates `cutoff_ms`.
    pub fn purge_older_than(&mut self, cutoff_ms: i64) {
        self.entries
            .retain(|_, entry| entry.last_fired_ms >= cutoff_ms);
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_fixed_cooldown_suppresses_until_elapsed() {
        let mut cooldowns = NotificationCooldowns::new(CooldownPolicy::Fixed);

        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 0));
        // Inside the 60 s limit.
        assert!(!cooldowns.check_and_arm(1, "BTCUSDT", 60, 30_000));
        assert!(!cooldowns.check_and_arm(1, "BTCUSDT", 60, 59_999));
        // At the limit it fires again.
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 60_000));
    }

    #[test]
    fn test_keys_are_independent() {
        let mut cooldowns = NotificationCooldowns::new(CooldownPolicy::Fixed);

        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 0));
        assert!(cooldowns.check_and_arm(1, "ETHUSDT", 60, 1));
        assert!(cooldowns.check_and_arm(2, "BTCUSDT", 60, 2));
        assert!(!cooldowns.check_and_arm(1, "BTCUSDT", 60, 3));
    }

    #[test]
    fn test_backoff_stretches_consecutive_fires() {
        let mut cooldowns = NotificationCooldowns::new(CooldownPolicy::ExponentialBackoff);

        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 0));
        // Second fire right at the base limit: allowed, bumps the streak.
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 60_000));
        // Now the limit is 60 s * 1.5 = 90 s.
        assert!(!cooldowns.check_and_arm(1, "BTCUSDT", 60, 60_000 + 89_999));
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 60_000 + 90_000));
    }

    #[test]
    fn test_backoff_resets_after_quiet_spell() {
        let mut cooldowns = NotificationCooldowns::new(CooldownPolicy::ExponentialBackoff);

        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 0));
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, 60_000));
        // A long quiet period resets the streak to the base limit.
        let later = 60_000 + 10 * 60_000;
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, later));
        assert!(!cooldowns.check_and_arm(1, "BTCUSDT", 60, later + 59_000));
        assert!(cooldowns.check_and_arm(1, "BTCUSDT", 60, later + 60_000));
    }

    #[test]
    fn test_purge() {
        let mut cooldowns = NotificationCooldowns::new(CooldownPolicy::Fixed);
        cooldowns.check_and_arm(1, "BTCUSDT", 60, 0);
        cooldowns.check_and_arm(2, "BTCUSDT", 60, 100_000);
        cooldowns.purge_older_than(50_000);
        assert_eq!(cooldowns.len(), 1);
    }
}
