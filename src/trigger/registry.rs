//! In-memory cache of active triggers over the external repository.
//!
//! The evaluator reads the cached snapshot once per flush; writes refresh
//! the cache after the repository accepts them.

use crate::error::StoreError;
use crate::repository::TriggerRepository;
use crate::trigger::{Trigger, TriggerSpec};
use parking_lot::RwLock;
use std::sync::Arc;
use tracing::info;

pub struct TriggerCache {
    repository: Arc<dyn TriggerRepository>,
    active: RwLock<Vec<Trigger>>,
}

impl TriggerCache {
    pub fn new(repository: Arc<dyn TriggerRepository>) -> Self {
        Self {
            repository,
            active: RwLock::new(Vec::new()),
        }
    }

    /// Warm the cache from the repository.
    pub async fn init(&self) -> Result<(), StoreError> {
        self.repository.init().await?;
        self.refresh().await?;
        info!(triggers = self.active.read().len(), "trigger cache initialised");
        Ok(())
    }

    async fn refresh(&self) -> Result<(), StoreError> {
        let active = self.repository.all_active().await?;
        *self.active.write() = active;
        Ok(())
    }

    /// Snapshot of all active triggers.
    pub fn all_active(&self) -> Vec<Trigger> {
        self.active.read().clone()
    }

    pub async fn find_by_user(&self, user_id: i64) -> Result<Vec<Trigger>, StoreError> {
        self.repository.find_by_user(user_id).await
    }

    /// Persist a new trigger and refresh the cache.
    pub async fn save(&self, spec: TriggerSpec) -> Result<Trigger, StoreError> {
        let trigger = self.repository.save(spec).await?;
        self.refresh().await?;
        Ok(trigger)
    }

    /// Remove a trigger owned by `user_id` and refresh the cache.
    pub async fn remove(&self, id: i64, user_id: i64) -> Result<bool, StoreError> {
        let removed = self.repository.remove(id, user_id).await?;
        if removed {
            self.refresh().await?;
        }
        Ok(removed)
    }
}
