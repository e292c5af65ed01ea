//! In-memory job store.
//!
//! All state sits behind one `tokio::sync::Mutex`, so every operation is
//! atomic and `claim_batch` cannot hand out a job twice. Durability is
//! obviously out of reach; this backs tests, demos and single-process setups.

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use tokio::sync::Mutex;

use crate::domain::{
    DeadLetter, Job, JobCounts, JobId, JobStatus, NewJob, Reclaimed, StoreError,
};
use crate::ports::{Clock, IdGenerator, JobStore, SystemClock, UlidGenerator};

/// Pending index entry. Ordering is `(next_run_at, id)`, so iteration yields
/// the earliest-due job first. Ties fall back to id order, which follows
/// creation time only across milliseconds.
type PendingKey = (DateTime<Utc>, JobId);

#[derive(Default)]
struct MemoryState {
    /// All job rows (single source of truth).
    jobs: HashMap<JobId, Job>,

    /// Pending jobs only, ordered by eligibility.
    pending: BTreeSet<PendingKey>,

    dead_letters: Vec<DeadLetter>,

    /// Jobs that already produced a dead letter.
    dead_lettered: HashSet<JobId>,
}

impl MemoryState {
    fn unindex(&mut self, job: &Job) {
        if job.status == JobStatus::Pending {
            self.pending.remove(&(job.next_run_at, job.id));
        }
    }

    fn index(&mut self, job: &Job) {
        if job.status == JobStatus::Pending {
            self.pending.insert((job.next_run_at, job.id));
        }
    }

    /// Apply `f` to a job, keeping the pending index in sync.
    fn update<R>(&mut self, id: JobId, f: impl FnOnce(&mut Job) -> R) -> Option<R> {
        let mut job = self.jobs.remove(&id)?;
        self.unindex(&job);
        let result = f(&mut job);
        self.index(&job);
        self.jobs.insert(id, job);
        Some(result)
    }
}

pub struct InMemoryJobStore {
    state: Mutex<MemoryState>,
    clock: Arc<dyn Clock>,
    ids: UlidGenerator<Arc<dyn Clock>>,
}

impl InMemoryJobStore {
    pub fn new() -> Self {
        Self::with_clock(Arc::new(SystemClock))
    }

    pub fn with_clock(clock: Arc<dyn Clock>) -> Self {
        Self {
            state: Mutex::new(MemoryState::default()),
            ids: UlidGenerator::new(Arc::clone(&clock)),
            clock,
        }
    }
}

impl Default for InMemoryJobStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl JobStore for InMemoryJobStore {
    async fn enqueue(&self, new: NewJob) -> Result<JobId, StoreError> {
        let now = self.clock.now();
        let id = self.ids.generate_job_id();
        let job = Job::from_new(id, new, now);

        let mut state = self.state.lock().await;
        state.index(&job);
        state.jobs.insert(id, job);
        Ok(id)
    }

    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        let due: Vec<PendingKey> = state
            .pending
            .iter()
            .take_while(|(next_run_at, _)| *next_run_at <= now)
            .take(limit)
            .copied()
            .collect();

        let mut claimed = Vec::with_capacity(due.len());
        for (_, id) in due {
            if let Some(job) = state.update(id, |job| {
                job.mark_processing(now);
                job.clone()
            }) {
                claimed.push(job);
            }
        }
        Ok(claimed)
    }

    async fn complete(&self, id: JobId) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let done = state
            .update(id, |job| {
                if job.status.is_terminal() {
                    return false;
                }
                job.mark_done(now);
                true
            })
            .unwrap_or(false);
        Ok(done)
    }

    async fn fail(
        &self,
        id: JobId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;
        let updated = state
            .update(id, |job| {
                if job.status != JobStatus::Processing {
                    return false;
                }
                match next_run_at {
                    Some(at) => job.schedule_retry(error.to_string(), at, now),
                    None => job.mark_error(error.to_string(), now),
                }
                true
            })
            .unwrap_or(false);
        Ok(updated)
    }

    async fn move_to_dlq(
        &self,
        id: JobId,
        source: &str,
        reason: &str,
    ) -> Result<bool, StoreError> {
        let now = self.clock.now();
        let mut state = self.state.lock().await;

        if state.dead_lettered.contains(&id) {
            return Ok(false);
        }
        let Some(job) = state.jobs.get(&id) else {
            return Ok(false);
        };
        if job.status == JobStatus::Done {
            return Ok(false);
        }

        let letter = DeadLetter::from_job(self.ids.generate_dead_letter_id(), job, source, reason, now);
        state.update(id, |job| {
            job.status = JobStatus::Error;
            job.last_error = Some(reason.to_string());
            job.updated_at = now;
        });
        state.dead_letters.push(letter);
        state.dead_lettered.insert(id);
        Ok(true)
    }

    async fn reclaim_stale(&self, older_than: Duration) -> Result<Reclaimed, StoreError> {
        let now = self.clock.now();
        let stale_before = chrono::Duration::from_std(older_than)
            .ok()
            .and_then(|age| now.checked_sub_signed(age))
            .unwrap_or(DateTime::<Utc>::MIN_UTC);
        let mut state = self.state.lock().await;

        let mut stale: Vec<JobId> = state
            .jobs
            .values()
            .filter(|job| job.status == JobStatus::Processing && job.updated_at < stale_before)
            .map(|job| job.id)
            .collect();
        stale.sort();

        let mut reclaimed = Reclaimed::default();
        for id in stale {
            match state.update(id, |job| job.reclaim(now)) {
                Some(true) => reclaimed.requeued.push(id),
                Some(false) => reclaimed.exhausted.push(id),
                None => {}
            }
        }
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.jobs.get(&id).cloned())
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let state = self.state.lock().await;
        Ok(state.dead_letters.clone())
    }

    async fn counts_by_status(&self) -> Result<JobCounts, StoreError> {
        let state = self.state.lock().await;
        let mut counts = JobCounts::default();
        for job in state.jobs.values() {
            counts.record(job.status);
        }
        Ok(counts)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::HashSet;
    use std::time::Duration;

    use super::*;
    use crate::domain::{JobType, RECLAIM_ERROR, TenantId};
    use crate::ports::ManualClock;

    fn new_job(max_attempts: u32) -> NewJob {
        NewJob::new(
            TenantId::new("tenant-1"),
            JobType::new("chat.send_message"),
            &serde_json::json!({"text": "hello"}),
        )
        .unwrap()
        .with_max_attempts(max_attempts)
        .unwrap()
    }

    fn store_with_clock() -> (InMemoryJobStore, Arc<ManualClock>) {
        let clock = Arc::new(ManualClock::default());
        (InMemoryJobStore::with_clock(clock.clone()), clock)
    }

    #[tokio::test]
    async fn enqueue_and_counts() {
        let store = InMemoryJobStore::new();
        store.enqueue(new_job(3)).await.unwrap();

        let counts = store.counts_by_status().await.unwrap();
        assert_eq!(counts.pending, 1);
        assert_eq!(counts.processing, 0);
    }

    #[tokio::test]
    async fn claim_transitions_to_processing() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(new_job(3)).await.unwrap();

        let claimed = store.claim_batch(10).await.unwrap();
        assert_eq!(claimed.len(), 1);
        assert_eq!(claimed[0].id, id);
        assert_eq!(claimed[0].status, JobStatus::Processing);

        // Nothing left to claim.
        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn claim_respects_limit_and_due_order() {
        let (store, clock) = store_with_clock();
        let now = clock.now();

        let late = store
            .enqueue(new_job(3).run_at(now - chrono::Duration::seconds(1)))
            .await
            .unwrap();
        let early = store
            .enqueue(new_job(3).run_at(now - chrono::Duration::seconds(10)))
            .await
            .unwrap();
        let future = store
            .enqueue(new_job(3).run_at(now + chrono::Duration::seconds(10)))
            .await
            .unwrap();

        let first = store.claim_batch(1).await.unwrap();
        assert_eq!(first[0].id, early);

        let rest = store.claim_batch(10).await.unwrap();
        assert_eq!(rest.len(), 1);
        assert_eq!(rest[0].id, late);

        clock.advance(Duration::from_secs(10));
        let later = store.claim_batch(10).await.unwrap();
        assert_eq!(later[0].id, future);
    }

    #[tokio::test]
    async fn concurrent_claimers_get_disjoint_sets() {
        let store = Arc::new(InMemoryJobStore::new());
        let n = 50;
        for _ in 0..n {
            store.enqueue(new_job(3)).await.unwrap();
        }

        let mut handles = Vec::new();
        for _ in 0..4 {
            let store = Arc::clone(&store);
            handles.push(tokio::spawn(async move {
                let mut mine = Vec::new();
                loop {
                    let batch = store.claim_batch(n).await.unwrap();
                    if batch.is_empty() {
                        break;
                    }
                    mine.extend(batch.into_iter().map(|job| job.id));
                    tokio::task::yield_now().await;
                }
                mine
            }));
        }

        let mut seen = HashSet::new();
        let mut total = 0;
        for handle in handles {
            for id in handle.await.unwrap() {
                total += 1;
                assert!(seen.insert(id), "job {id} claimed twice");
            }
        }
        assert_eq!(total, n);
        assert_eq!(seen.len(), n);
    }

    #[tokio::test]
    async fn complete_is_idempotent() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(new_job(3)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        assert!(store.complete(id).await.unwrap());
        assert!(!store.complete(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Done);
    }

    #[tokio::test]
    async fn complete_missing_job_returns_false() {
        let store = InMemoryJobStore::new();
        let ghost = JobId::from_ulid(ulid::Ulid::new());
        assert!(!store.complete(ghost).await.unwrap());
        assert!(!store.fail(ghost, "x", None).await.unwrap());
        assert!(!store.move_to_dlq(ghost, "test", "x").await.unwrap());
    }

    #[tokio::test]
    async fn fail_with_next_run_at_reschedules() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(new_job(3)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        let retry_at = clock.now() + chrono::Duration::seconds(30);
        assert!(store.fail(id, "upstream 503", Some(retry_at)).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("upstream 503"));

        assert!(store.claim_batch(1).await.unwrap().is_empty());
        clock.advance(Duration::from_secs(30));
        assert_eq!(store.claim_batch(1).await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn fail_without_next_run_at_is_terminal() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(new_job(3)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        assert!(store.fail(id, "bad payload", None).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.attempts, 1);
        assert!(store.claim_batch(1).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn move_to_dlq_writes_exactly_one_letter() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(new_job(1)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        assert!(store.move_to_dlq(id, "outbox_worker", "fatal").await.unwrap());
        assert!(!store.move_to_dlq(id, "outbox_worker", "fatal").await.unwrap());

        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].key, id);
        assert_eq!(letters[0].source, "outbox_worker");
        assert_eq!(letters[0].payload.payload["text"], "hello");

        // Job row is retained for audit.
        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
    }

    #[tokio::test]
    async fn done_job_cannot_be_dead_lettered() {
        let store = InMemoryJobStore::new();
        let id = store.enqueue(new_job(1)).await.unwrap();
        store.complete(id).await.unwrap();

        assert!(!store.move_to_dlq(id, "test", "late").await.unwrap());
        assert!(store.dead_letters().await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn reclaim_returns_stuck_jobs_to_pending() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(new_job(3)).await.unwrap();
        store.claim_batch(1).await.unwrap();

        // Not stale yet.
        let timeout = Duration::from_secs(60);
        assert!(store.reclaim_stale(timeout).await.unwrap().is_empty());

        clock.advance(Duration::from_secs(120));
        let reclaimed = store.reclaim_stale(timeout).await.unwrap();
        assert_eq!(reclaimed.requeued, vec![id]);
        assert!(reclaimed.exhausted.is_empty());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some(RECLAIM_ERROR));
        assert_eq!(store.claim_batch(1).await.unwrap()[0].id, id);
    }

    #[tokio::test]
    async fn reclaim_leaves_exhausted_jobs_for_the_dead_letter_queue() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(new_job(1)).await.unwrap();
        store.claim_batch(1).await.unwrap();
        clock.advance(Duration::from_secs(120));

        let reclaimed = store.reclaim_stale(Duration::from_secs(60)).await.unwrap();
        assert!(reclaimed.requeued.is_empty());
        assert_eq!(reclaimed.exhausted, vec![id]);

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 1);

        // Still reported until someone dead-letters it; attempts stay capped.
        let again = store.reclaim_stale(Duration::from_secs(60)).await.unwrap();
        assert_eq!(again.exhausted, vec![id]);
        assert_eq!(store.get(id).await.unwrap().unwrap().attempts, 1);

        assert!(store.move_to_dlq(id, "outbox_reclaim", RECLAIM_ERROR).await.unwrap());
        let letters = store.dead_letters().await.unwrap();
        assert_eq!(letters.len(), 1);
        assert_eq!(letters[0].payload.attempts, 1);
        assert!(store.reclaim_stale(Duration::from_secs(60)).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn terminal_jobs_cannot_be_revived() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(new_job(3)).await.unwrap();
        store.claim_batch(1).await.unwrap();
        assert!(store.move_to_dlq(id, "outbox_worker", "fatal").await.unwrap());

        // A late report from a detached handler.
        let past = clock.now() - chrono::Duration::seconds(1);
        assert!(!store.fail(id, "late failure", Some(past)).await.unwrap());
        assert!(!store.complete(id).await.unwrap());

        let job = store.get(id).await.unwrap().unwrap();
        assert_eq!(job.status, JobStatus::Error);
        assert_eq!(job.last_error.as_deref(), Some("fatal"));
        assert!(store.claim_batch(10).await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn fail_requires_a_running_job() {
        let (store, clock) = store_with_clock();
        let id = store.enqueue(new_job(3)).await.unwrap();
        let retry_at = clock.now() + chrono::Duration::seconds(5);

        // Still pending: nobody is running it.
        assert!(!store.fail(id, "boom", Some(retry_at)).await.unwrap());

        store.claim_batch(1).await.unwrap();
        store.complete(id).await.unwrap();
        assert!(!store.fail(id, "boom", Some(retry_at)).await.unwrap());
        assert!(!store.fail(id, "boom", None).await.unwrap());
        assert_eq!(store.get(id).await.unwrap().unwrap().status, JobStatus::Done);
    }
}
