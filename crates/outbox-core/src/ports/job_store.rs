//! JobStore port - the durable queue (source of truth).
//!
//! # Contract
//! - Every operation is individually atomic.
//! - `claim_batch` must never hand the same job to two concurrent callers,
//!   even across processes. Leadership reduces contention; this is the real
//!   guarantee.
//! - `complete` / `fail` / `move_to_dlq` return `false` instead of erroring
//!   when the job is gone or already finished, so callers can retry them.
//! - `done` and `error` are terminal: nothing moves a job out of them.

use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use crate::domain::{DeadLetter, Job, JobCounts, JobId, NewJob, Reclaimed, StoreError};

#[async_trait]
pub trait JobStore: Send + Sync {
    /// Insert one pending row.
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError>;

    /// Atomically move up to `limit` due pending jobs to processing,
    /// earliest `next_run_at` first.
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, StoreError>;

    /// Mark done. `false` if missing or already terminal.
    async fn complete(&self, id: JobId) -> Result<bool, StoreError>;

    /// Record a failed run.
    ///
    /// `Some(next_run_at)` reschedules (status back to pending); `None` is
    /// terminal (status error). Both increment `attempts`. Only a job in
    /// processing can fail; anything else returns `false`.
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError>;

    /// Snapshot the job into the dead letter log and mark it error.
    /// At most one dead letter is ever written per job.
    async fn move_to_dlq(&self, id: JobId, source: &str, reason: &str)
    -> Result<bool, StoreError>;

    /// Recover jobs left in processing for longer than `older_than`,
    /// measured against the store's own clock.
    ///
    /// Each counts as an attempt. Jobs with budget left go back to pending;
    /// the rest stay in processing and are reported in
    /// `Reclaimed::exhausted` for the caller to `move_to_dlq`.
    async fn reclaim_stale(&self, older_than: Duration) -> Result<Reclaimed, StoreError>;

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError>;

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError>;

    async fn counts_by_status(&self) -> Result<JobCounts, StoreError>;
}
