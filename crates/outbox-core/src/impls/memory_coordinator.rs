//! In-process coordinator.
//!
//! A single `InMemoryCoordinator` can be shared (via `Arc`) between several
//! workers in the same process, which is how the leader election tests run
//! a "fleet" without a database.

use std::collections::HashMap;

use async_trait::async_trait;
use parking_lot::Mutex;

use crate::domain::{StoreError, WorkerHeartbeat};
use crate::ports::Coordinator;

#[derive(Default)]
pub struct InMemoryCoordinator {
    /// lock_key -> holder instance_id
    locks: Mutex<HashMap<i64, String>>,
    heartbeats: Mutex<HashMap<String, WorkerHeartbeat>>,
}

impl InMemoryCoordinator {
    pub fn new() -> Self {
        Self::default()
    }

    /// Current holder of `lock_key`, if any.
    pub fn holder(&self, lock_key: i64) -> Option<String> {
        self.locks.lock().get(&lock_key).cloned()
    }

    /// Drop a holder without its cooperation, as a dead database session would.
    pub fn expire(&self, lock_key: i64) {
        self.locks.lock().remove(&lock_key);
    }
}

#[async_trait]
impl Coordinator for InMemoryCoordinator {
    async fn try_acquire_leadership(
        &self,
        lock_key: i64,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock();
        let holder = locks
            .entry(lock_key)
            .or_insert_with(|| instance_id.to_string());
        Ok(holder == instance_id)
    }

    async fn release_leadership(
        &self,
        lock_key: i64,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let mut locks = self.locks.lock();
        match locks.get(&lock_key) {
            Some(holder) if holder == instance_id => {
                locks.remove(&lock_key);
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), StoreError> {
        self.heartbeats
            .lock()
            .insert(heartbeat.instance_id.clone(), heartbeat);
        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let mut all: Vec<_> = self.heartbeats.lock().values().cloned().collect();
        all.sort_by(|a, b| a.instance_id.cmp(&b.instance_id));
        Ok(all)
    }
}
