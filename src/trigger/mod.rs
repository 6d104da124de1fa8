//! Trigger evaluation: user trigger model, registry cache, cooldown
//! policies, and the debounced evaluator.

pub mod cooldown;
pub mod evaluator;
pub mod registry;

pub use cooldown::{CooldownPolicy, NotificationCooldowns};
pub use evaluator::TriggerEvaluator;
pub use registry::TriggerCache;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Direction of the open-interest move a trigger watches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum Direction {
    Up,
    Down,
}

/// A user-configured alert condition, owned by the external store.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Trigger {
    pub id: i64,
    pub user_id: i64,
    pub direction: Direction,
    /// Percent threshold, strictly positive.
    pub oi_change_percent: f64,
    /// Trailing window, 1 to 30 minutes.
    pub time_interval_minutes: u32,
    /// Per-(user, symbol) cooldown, at least 10 seconds.
    pub notification_limit_seconds: u32,
    pub is_active: bool,
}

/// Creation request for a trigger; the repository assigns the id.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct TriggerSpec {
    pub user_id: i64,
    pub direction: Direction,
    pub oi_change_percent: f64,
    pub time_interval_minutes: u32,
    pub notification_limit_seconds: u32,
}

impl TriggerSpec {
    /// Validate the spec ranges.
    pub fn validate(&self) -> Result<(), String> {
        if !(self.oi_change_percent.is_finite() && self.oi_change_percent > 0.0) {
            return Err(format!(
                "oi_change_percent must be positive, got {}",
                self.oi_change_percent
            ));
        }
        if !(1..=30).contains(&self.time_interval_minutes) {
            return Err(format!(
                "time_interval_minutes must be within 1..=30, got {}",
                self.time_interval_minutes
            ));
        }
        if self.notification_limit_seconds < 10 {
            return Err(format!(
                "notification_limit_seconds must be at least 10, got {}",
                self.notification_limit_seconds
            ));
        }
        Ok(())
    }
}

/// One firing of one trigger for one symbol, persisted before delivery.
#[derive(Debug, Clone, PartialEq, Deserialize, Serialize)]
pub struct Signal {
    pub trigger_id: i64,
    pub user_id: i64,
    pub symbol: String,
    /// Rolling per-(trigger, symbol) count over the last 24 h.
    pub signal_number: u32,
    pub oi_change_percent: f64,
    pub price_change_percent: Option<f64>,
    pub current_price: Option<f64>,
    pub created_at: DateTime<Utc>,
}
