//! Coordinator port - leader election and heartbeats.
//!
//! Leadership is a non-blocking, named mutual exclusion lock. Holding it is
//! never assumed to be permanent: the worker calls `try_acquire_leadership`
//! on every tick, and implementations must report `false` once the
//! underlying session is gone.

use async_trait::async_trait;

use crate::domain::{StoreError, WorkerHeartbeat};

#[async_trait]
pub trait Coordinator: Send + Sync {
    /// Take `lock_key` for `instance_id` without waiting.
    /// Idempotent when this instance already holds it.
    async fn try_acquire_leadership(
        &self,
        lock_key: i64,
        instance_id: &str,
    ) -> Result<bool, StoreError>;

    /// Release `lock_key`. Safe to call when not held; returns whether
    /// anything was released.
    async fn release_leadership(&self, lock_key: i64, instance_id: &str)
    -> Result<bool, StoreError>;

    /// Upsert the heartbeat row for `heartbeat.instance_id`.
    async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), StoreError>;

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError>;
}
