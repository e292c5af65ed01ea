//! OutboxWorker - leader-elected polling loop over the job store.
//!
//! # 1 tick の流れ
//! 1. `try_acquire_leadership` (every tick, so a lost session is noticed)
//! 2. heartbeat (leader or not, at most once per heartbeat interval)
//! 3. follower: stop here
//! 4. leader: reclaim stale jobs → `claim_batch` → dispatch under a semaphore
//!
//! # 設計原則
//! - The poll loop never propagates errors. Handler failures become
//!   `fail` / `move_to_dlq`; store failures are logged and counted.
//! - Shutdown is cooperative: no new ticks start, the in-flight tick gets
//!   `drain_timeout` to finish, then remaining handlers are detached (not
//!   aborted). Their jobs come back through `reclaim_stale`.

use std::fmt;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use tokio::sync::{Semaphore, watch};
use tokio::task::JoinHandle;
use tokio::time::MissedTickBehavior;
use tracing::Instrument;

use super::config::WorkerConfig;
use super::stats::{StatsSnapshot, WorkerStats};
use crate::domain::{
    HandlerOutcome, HeartbeatDetails, Job, OutboxError, RECLAIM_ERROR, WorkerHeartbeat,
};
use crate::ports::{Clock, Coordinator, JobStore};
use crate::resilience::RescheduleBackoff;
use crate::typed::HandlerRegistry;

/// `source` recorded on dead letters written by the worker.
pub const DLQ_SOURCE: &str = "outbox_worker";

/// `source` recorded on dead letters for stale jobs that ran out of attempts.
pub const RECLAIM_DLQ_SOURCE: &str = "outbox_reclaim";

/// Failure message used when a handler panics.
pub const HANDLER_PANIC_ERROR: &str = "handler panicked";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerState {
    Stopped,
    Starting,
    Follower,
    Leader,
}

impl fmt::Display for WorkerState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            WorkerState::Stopped => "stopped",
            WorkerState::Starting => "starting",
            WorkerState::Follower => "follower",
            WorkerState::Leader => "leader",
        })
    }
}

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    pub is_leader: bool,
    pub reclaimed: u64,
    pub claimed: usize,
}

/// Everything a dispatched job needs; cloned into each spawned task.
struct Dispatcher {
    store: Arc<dyn JobStore>,
    registry: Arc<HandlerRegistry>,
    clock: Arc<dyn Clock>,
    backoff: RescheduleBackoff,
    stats: Arc<WorkerStats>,
}

pub struct OutboxWorker {
    config: WorkerConfig,
    instance_id: String,
    coordinator: Arc<dyn Coordinator>,
    dispatcher: Arc<Dispatcher>,
    semaphore: Arc<Semaphore>,
    state: Mutex<WorkerState>,
    last_heartbeat: Mutex<Option<DateTime<Utc>>>,
}

impl OutboxWorker {
    /// Use [`crate::app::WorkerBuilder`]; it validates config and handlers.
    pub(crate) fn new(
        config: WorkerConfig,
        instance_id: String,
        store: Arc<dyn JobStore>,
        coordinator: Arc<dyn Coordinator>,
        registry: Arc<HandlerRegistry>,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let backoff = RescheduleBackoff::new(config.retry_base_delay(), config.retry_max_delay());
        let semaphore = Arc::new(Semaphore::new(config.max_concurrent));
        Self {
            instance_id,
            coordinator,
            dispatcher: Arc::new(Dispatcher {
                store,
                registry,
                clock,
                backoff,
                stats: Arc::new(WorkerStats::default()),
            }),
            semaphore,
            state: Mutex::new(WorkerState::Stopped),
            last_heartbeat: Mutex::new(None),
            config,
        }
    }

    pub fn instance_id(&self) -> &str {
        &self.instance_id
    }

    pub fn config(&self) -> &WorkerConfig {
        &self.config
    }

    pub fn state(&self) -> WorkerState {
        *self.state.lock()
    }

    pub fn stats(&self) -> StatsSnapshot {
        self.dispatcher.stats.snapshot()
    }

    fn set_state(&self, next: WorkerState) {
        let prev = std::mem::replace(&mut *self.state.lock(), next);
        if prev == next {
            return;
        }
        match (prev, next) {
            (_, WorkerState::Leader) => {
                tracing::info!(instance_id = %self.instance_id, %prev, "acquired leadership")
            }
            (WorkerState::Leader, _) => {
                tracing::warn!(instance_id = %self.instance_id, %next, "lost leadership")
            }
            _ => tracing::debug!(instance_id = %self.instance_id, %prev, %next, "worker state changed"),
        }
    }

    /// Run until `shutdown` turns `true` (or its sender is dropped).
    pub async fn run(&self, mut shutdown: watch::Receiver<bool>) {
        if !self.config.enabled {
            tracing::info!(instance_id = %self.instance_id, "outbox worker disabled");
            return;
        }
        self.set_state(WorkerState::Starting);
        tracing::info!(
            instance_id = %self.instance_id,
            poll_interval_s = self.config.poll_interval_seconds,
            batch_size = self.config.batch_size,
            max_concurrent = self.config.max_concurrent,
            "outbox worker started"
        );

        let mut interval = tokio::time::interval(self.config.poll_interval());
        interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                biased;
                _ = wait_for_shutdown(&mut shutdown) => break,
                _ = interval.tick() => {}
            }

            let tick = self.tick();
            tokio::pin!(tick);
            tokio::select! {
                _ = &mut tick => {}
                _ = wait_for_shutdown(&mut shutdown) => {
                    let drain = self.config.drain_timeout();
                    if tokio::time::timeout(drain, &mut tick).await.is_err() {
                        tracing::warn!(
                            instance_id = %self.instance_id,
                            drain_timeout_s = drain.as_secs(),
                            "drain timeout reached, detaching in-flight handlers"
                        );
                    }
                    break;
                }
            }
        }

        self.stop().await;
    }

    /// Move into an `Arc` and run on the tokio runtime.
    pub fn spawn(self) -> WorkerHandle {
        let worker = Arc::new(self);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);
        let join = tokio::spawn({
            let worker = Arc::clone(&worker);
            async move { worker.run(shutdown_rx).await }
        });
        WorkerHandle {
            shutdown_tx,
            join,
            worker,
        }
    }

    async fn stop(&self) {
        if self.state() == WorkerState::Leader {
            match self
                .coordinator
                .release_leadership(self.config.lock_key, &self.instance_id)
                .await
            {
                Ok(released) => {
                    tracing::info!(instance_id = %self.instance_id, released, "released leadership")
                }
                Err(err) => {
                    self.dispatcher.stats.record_error();
                    tracing::error!(instance_id = %self.instance_id, error = %err, "failed to release leadership");
                }
            }
        }
        self.set_state(WorkerState::Stopped);
        tracing::info!(instance_id = %self.instance_id, "outbox worker stopped");
    }

    /// One poll cycle. Waits for every job it dispatched.
    pub async fn tick(&self) -> TickReport {
        let stats = &self.dispatcher.stats;
        stats.record_tick();

        let is_leader = match self
            .coordinator
            .try_acquire_leadership(self.config.lock_key, &self.instance_id)
            .await
        {
            Ok(is_leader) => is_leader,
            Err(err) => {
                stats.record_error();
                tracing::error!(instance_id = %self.instance_id, error = %err, "leadership check failed");
                false
            }
        };
        self.set_state(if is_leader {
            WorkerState::Leader
        } else {
            WorkerState::Follower
        });
        self.maybe_heartbeat(is_leader).await;

        let mut report = TickReport {
            is_leader,
            ..TickReport::default()
        };
        if !is_leader {
            return report;
        }

        report.reclaimed = self.reclaim_stale().await;

        let jobs = match self.dispatcher.store.claim_batch(self.config.batch_size).await {
            Ok(jobs) => jobs,
            Err(err) => {
                stats.record_error();
                tracing::error!(error = %err, "claim_batch failed");
                return report;
            }
        };
        report.claimed = jobs.len();
        if jobs.is_empty() {
            return report;
        }
        stats.record_claimed(jobs.len());
        tracing::debug!(claimed = jobs.len(), "claimed jobs");

        let mut in_flight: Vec<JoinHandle<()>> = Vec::with_capacity(jobs.len());
        for job in jobs {
            let Ok(permit) = Arc::clone(&self.semaphore).acquire_owned().await else {
                break;
            };
            let dispatcher = Arc::clone(&self.dispatcher);
            in_flight.push(tokio::spawn(async move {
                let _permit = permit;
                dispatcher.process(job).await;
            }));
        }
        for handle in in_flight {
            if let Err(err) = handle.await {
                tracing::error!(error = %err, "job task failed");
            }
        }
        report
    }

    /// Requeue stale jobs; dead-letter those with no attempts left.
    async fn reclaim_stale(&self) -> u64 {
        let Some(timeout) = self.config.processing_timeout() else {
            return 0;
        };
        let store = &self.dispatcher.store;
        let stats = &self.dispatcher.stats;
        let reclaimed = match store.reclaim_stale(timeout).await {
            Ok(reclaimed) => reclaimed,
            Err(err) => {
                stats.record_error();
                tracing::error!(error = %err, "reclaim_stale failed");
                return 0;
            }
        };
        if reclaimed.is_empty() {
            return 0;
        }
        stats.record_reclaimed(reclaimed.total());
        tracing::warn!(
            requeued = reclaimed.requeued.len(),
            exhausted = reclaimed.exhausted.len(),
            timeout_s = timeout.as_secs(),
            "reclaimed stale processing jobs"
        );

        for id in &reclaimed.exhausted {
            match store.move_to_dlq(*id, RECLAIM_DLQ_SOURCE, RECLAIM_ERROR).await {
                Ok(true) => {
                    stats.record_dead_lettered();
                    tracing::error!(job_id = %id, "stale job out of attempts, moved to dead letter queue");
                }
                Ok(false) => tracing::warn!(job_id = %id, "stale job already dead-lettered or finished"),
                Err(err) => {
                    stats.record_error();
                    tracing::error!(job_id = %id, error = %err, "failed to dead-letter stale job");
                }
            }
        }
        reclaimed.total()
    }

    async fn maybe_heartbeat(&self, is_leader: bool) {
        let now = self.dispatcher.clock.now();
        let due = match *self.last_heartbeat.lock() {
            None => true,
            Some(last) => chrono::Duration::from_std(self.config.heartbeat_interval())
                .map(|interval| now - last >= interval)
                .unwrap_or(true),
        };
        if !due {
            return;
        }

        let heartbeat = WorkerHeartbeat {
            instance_id: self.instance_id.clone(),
            seen_at: now,
            details: HeartbeatDetails {
                is_leader,
                config: serde_json::to_value(&self.config).unwrap_or_default(),
                stats: serde_json::to_value(self.stats()).ok(),
            },
        };
        match self.coordinator.record_heartbeat(heartbeat).await {
            Ok(()) => *self.last_heartbeat.lock() = Some(now),
            Err(err) => {
                self.dispatcher.stats.record_error();
                tracing::warn!(instance_id = %self.instance_id, error = %err, "heartbeat failed");
            }
        }
    }
}

impl Dispatcher {
    async fn process(&self, job: Job) {
        let span = tracing::info_span!(
            "job",
            job_id = %job.id,
            job_type = %job.job_type,
            tenant_id = %job.tenant_id,
            attempts = job.attempts,
        );
        async {
            let outcome = self.invoke(&job).await;
            self.apply(&job, outcome).await;
        }
        .instrument(span)
        .await
    }

    /// Run the handler in its own task so a panic is contained.
    async fn invoke(&self, job: &Job) -> HandlerOutcome {
        let Some(handler) = self.registry.get(&job.job_type) else {
            let err = OutboxError::HandlerNotFound(job.job_type.clone());
            return HandlerOutcome::from_error(&err, self.clock.now());
        };
        let owned = job.clone();
        match tokio::spawn(async move { handler.handle(&owned).await }).await {
            Ok(Ok(outcome)) => outcome,
            Ok(Err(err)) => HandlerOutcome::from_error(&err, self.clock.now()),
            Err(join_err) => {
                tracing::error!(error = %join_err, "handler task did not complete");
                HandlerOutcome::retry(HANDLER_PANIC_ERROR)
            }
        }
    }

    async fn apply(&self, job: &Job, outcome: HandlerOutcome) {
        if outcome.success {
            match self.store.complete(job.id).await {
                Ok(true) => {
                    self.stats.record_processed();
                    tracing::info!("job completed");
                }
                Ok(false) => tracing::warn!("job was already completed or is missing"),
                Err(err) => {
                    self.stats.record_error();
                    tracing::error!(error = %err, "failed to mark job done");
                }
            }
            return;
        }

        let error = outcome.error_message();
        if outcome.should_retry && job.has_retry_budget() {
            let next_run_at = outcome
                .next_run_at_override
                .unwrap_or_else(|| self.backoff.next_run_at(self.clock.now(), job.attempts));
            match self.store.fail(job.id, error, Some(next_run_at)).await {
                Ok(_) => {
                    self.stats.record_retried();
                    tracing::warn!(error, %next_run_at, "job failed, rescheduled");
                }
                Err(err) => {
                    self.stats.record_error();
                    tracing::error!(error = %err, "failed to reschedule job");
                }
            }
            return;
        }

        match self.store.move_to_dlq(job.id, DLQ_SOURCE, error).await {
            Ok(true) => {
                self.stats.record_dead_lettered();
                tracing::error!(
                    error,
                    retryable = outcome.should_retry,
                    max_attempts = job.max_attempts,
                    "job moved to dead letter queue"
                );
            }
            Ok(false) => tracing::warn!("job was already dead-lettered or finished"),
            Err(err) => {
                self.stats.record_error();
                tracing::error!(error = %err, "failed to dead-letter job");
            }
        }
    }
}

/// Wait until `true` is sent, or the sender is gone.
async fn wait_for_shutdown(shutdown: &mut watch::Receiver<bool>) {
    let _ = shutdown.wait_for(|stop| *stop).await;
}

/// Handle to a spawned worker.
/// - `request_shutdown()` stops new ticks
/// - `shutdown_and_join()` also waits for the worker to finish draining
pub struct WorkerHandle {
    shutdown_tx: watch::Sender<bool>,
    join: JoinHandle<()>,
    worker: Arc<OutboxWorker>,
}

impl WorkerHandle {
    pub fn worker(&self) -> &OutboxWorker {
        &self.worker
    }

    pub fn request_shutdown(&self) {
        // receivers may already be gone
        let _ = self.shutdown_tx.send(true);
    }

    pub async fn shutdown_and_join(self) {
        self.request_shutdown();
        if let Err(err) = self.join.await {
            tracing::error!(error = %err, "outbox worker task failed");
        }
    }
}
