//! Job record and status management.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::{OutboxError, StoreError};
use super::ids::JobId;

/// Default retry budget for a freshly enqueued job.
pub const DEFAULT_MAX_ATTEMPTS: u32 = 5;

/// Tenant that owns a job. Opaque to the core.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct TenantId(String);

impl TenantId {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for TenantId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job type: the key used to look up a handler.
///
/// # Naming convention
/// - `{domain}.{action}`, e.g. `chat.send_message`, `inventory.release_reservation`
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct JobType(String);

impl JobType {
    pub fn new(s: impl Into<String>) -> Self {
        Self(s.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for JobType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        self.0.fmt(f)
    }
}

/// Job status.
///
/// State transitions:
/// - Pending -> Processing (claim_batch)
/// - Processing -> Done (complete)
/// - Processing -> Pending with a later next_run_at (fail with retry)
/// - Processing -> Error (fail without retry, move_to_dlq)
/// - Processing -> Pending (reclaim after processing timeout)
/// - Processing -> Error via move_to_dlq (reclaim with no attempts left)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum JobStatus {
    Pending,
    Processing,
    Done,
    Error,
}

impl JobStatus {
    pub fn as_str(self) -> &'static str {
        match self {
            JobStatus::Pending => "pending",
            JobStatus::Processing => "processing",
            JobStatus::Done => "done",
            JobStatus::Error => "error",
        }
    }

    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, JobStatus::Done | JobStatus::Error)
    }
}

impl fmt::Display for JobStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for JobStatus {
    type Err = StoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(JobStatus::Pending),
            "processing" => Ok(JobStatus::Processing),
            "done" => Ok(JobStatus::Done),
            "error" => Ok(JobStatus::Error),
            other => Err(StoreError::CorruptRow(format!("unknown job status '{other}'"))),
        }
    }
}

/// Producer-side request to enqueue a job.
///
/// Validation happens here, before anything touches the store: the payload
/// must serialize to JSON and the retry budget must allow at least one run.
#[derive(Debug, Clone, PartialEq)]
pub struct NewJob {
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub max_attempts: u32,
    /// `None` means "run as soon as possible".
    pub run_at: Option<DateTime<Utc>>,
}

impl NewJob {
    pub fn new<P: Serialize + ?Sized>(
        tenant_id: TenantId,
        job_type: JobType,
        payload: &P,
    ) -> Result<Self, OutboxError> {
        let payload = serde_json::to_value(payload)
            .map_err(|e| OutboxError::Validation(format!("payload is not serializable: {e}")))?;
        Ok(Self {
            tenant_id,
            job_type,
            payload,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            run_at: None,
        })
    }

    pub fn with_max_attempts(mut self, max_attempts: u32) -> Result<Self, OutboxError> {
        if max_attempts == 0 {
            return Err(OutboxError::Validation(
                "max_attempts must be at least 1".to_string(),
            ));
        }
        self.max_attempts = max_attempts;
        Ok(self)
    }

    pub fn run_at(mut self, at: DateTime<Utc>) -> Self {
        self.run_at = Some(at);
        self
    }
}

/// A job row: the single source of truth for a unit of async work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Job {
    pub id: JobId,
    pub tenant_id: TenantId,
    pub job_type: JobType,
    pub payload: serde_json::Value,
    pub status: JobStatus,

    /// Number of failed runs recorded so far.
    pub attempts: u32,
    pub max_attempts: u32,

    pub next_run_at: DateTime<Utc>,
    pub last_error: Option<String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

impl Job {
    pub fn from_new(id: JobId, new: NewJob, now: DateTime<Utc>) -> Self {
        Self {
            id,
            tenant_id: new.tenant_id,
            job_type: new.job_type,
            payload: new.payload,
            status: JobStatus::Pending,
            attempts: 0,
            max_attempts: new.max_attempts,
            next_run_at: new.run_at.unwrap_or(now),
            last_error: None,
            created_at: now,
            updated_at: now,
        }
    }

    /// Pending and due.
    pub fn is_claimable(&self, now: DateTime<Utc>) -> bool {
        self.status == JobStatus::Pending && self.next_run_at <= now
    }

    /// May another automatic retry be scheduled after the current failure?
    pub fn has_retry_budget(&self) -> bool {
        self.attempts + 1 < self.max_attempts
    }

    pub fn mark_processing(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Processing;
        self.updated_at = now;
    }

    pub fn mark_done(&mut self, now: DateTime<Utc>) {
        self.status = JobStatus::Done;
        self.updated_at = now;
    }

    /// Retry path: back to pending, eligible again at `next_run_at`.
    pub fn schedule_retry(&mut self, error: String, next_run_at: DateTime<Utc>, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Pending;
        self.last_error = Some(error);
        self.next_run_at = next_run_at;
        self.updated_at = now;
    }

    /// Terminal failure.
    pub fn mark_error(&mut self, error: String, now: DateTime<Utc>) {
        self.attempts += 1;
        self.status = JobStatus::Error;
        self.last_error = Some(error);
        self.updated_at = now;
    }

    /// Recover a job whose worker vanished mid-run.
    ///
    /// The abandoned run counts as an attempt. Returns `true` when the job
    /// went back to pending. `false` means the budget is spent: the job stays
    /// in processing (untouched `updated_at`) until it is dead-lettered, and
    /// reclaiming it again does not push `attempts` past `max_attempts`.
    pub fn reclaim(&mut self, now: DateTime<Utc>) -> bool {
        self.attempts = (self.attempts + 1).min(self.max_attempts);
        self.last_error = Some(RECLAIM_ERROR.to_string());
        if self.attempts >= self.max_attempts {
            return false;
        }
        self.status = JobStatus::Pending;
        self.next_run_at = now;
        self.updated_at = now;
        true
    }
}

/// Outcome of one `reclaim_stale` pass.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Reclaimed {
    /// Back to pending.
    pub requeued: Vec<JobId>,
    /// Out of attempts, still processing; the caller dead-letters these.
    pub exhausted: Vec<JobId>,
}

impl Reclaimed {
    pub fn total(&self) -> u64 {
        (self.requeued.len() + self.exhausted.len()) as u64
    }

    pub fn is_empty(&self) -> bool {
        self.requeued.is_empty() && self.exhausted.is_empty()
    }
}

/// `last_error` recorded by `reclaim`.
pub const RECLAIM_ERROR: &str = "reclaimed after processing timeout";

/// Counts by status, for observability.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct JobCounts {
    pub pending: usize,
    pub processing: usize,
    pub done: usize,
    pub error: usize,
}

impl JobCounts {
    pub fn record(&mut self, status: JobStatus) {
        self.add(status, 1);
    }

    pub fn add(&mut self, status: JobStatus, n: usize) {
        match status {
            JobStatus::Pending => self.pending += n,
            JobStatus::Processing => self.processing += n,
            JobStatus::Done => self.done += n,
            JobStatus::Error => self.error += n,
        }
    }

    pub fn total(&self) -> usize {
        self.pending + self.processing + self.done + self.error
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::{Duration, TimeZone};
    use rstest::rstest;
    use ulid::Ulid;

    fn at(secs: i64) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap() + Duration::seconds(secs)
    }

    fn job(max_attempts: u32) -> Job {
        let new = NewJob::new(
            TenantId::new("t1"),
            JobType::new("chat.send_message"),
            &serde_json::json!({"text": "hi"}),
        )
        .unwrap()
        .with_max_attempts(max_attempts)
        .unwrap();
        Job::from_new(JobId::from_ulid(Ulid::new()), new, at(0))
    }

    #[test]
    fn new_job_is_pending_and_due_immediately() {
        let job = job(3);
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 0);
        assert!(job.is_claimable(at(0)));
    }

    #[test]
    fn future_run_at_is_not_claimable_yet() {
        let new = NewJob::new(TenantId::new("t1"), JobType::new("x"), &1)
            .unwrap()
            .run_at(at(60));
        let job = Job::from_new(JobId::from_ulid(Ulid::new()), new, at(0));

        assert!(!job.is_claimable(at(59)));
        assert!(job.is_claimable(at(60)));
    }

    #[test]
    fn zero_max_attempts_is_rejected() {
        let err = NewJob::new(TenantId::new("t1"), JobType::new("x"), &1)
            .unwrap()
            .with_max_attempts(0)
            .unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
    }

    #[test]
    fn unserializable_payload_is_a_validation_error() {
        use std::collections::HashMap;
        // JSON object keys must be strings.
        let mut bad = HashMap::new();
        bad.insert(vec![1u8], 1);
        let err = NewJob::new(TenantId::new("t1"), JobType::new("x"), &bad).unwrap_err();
        assert!(matches!(err, OutboxError::Validation(_)));
    }

    #[test]
    fn schedule_retry_returns_to_pending() {
        let mut job = job(3);
        job.mark_processing(at(1));
        job.schedule_retry("boom".into(), at(30), at(2));

        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.attempts, 1);
        assert_eq!(job.last_error.as_deref(), Some("boom"));
        assert!(!job.is_claimable(at(29)));
        assert!(job.is_claimable(at(30)));
    }

    #[rstest]
    #[case::first_of_three(3, 0, true)]
    #[case::second_of_three(3, 1, true)]
    #[case::last_of_three(3, 2, false)]
    #[case::single_shot(1, 0, false)]
    fn retry_budget(#[case] max_attempts: u32, #[case] attempts: u32, #[case] expected: bool) {
        let mut job = job(max_attempts);
        job.attempts = attempts;
        assert_eq!(job.has_retry_budget(), expected);
    }

    #[test]
    fn reclaim_requeues_until_budget_is_spent() {
        let mut job = job(2);
        job.mark_processing(at(1));
        assert!(job.reclaim(at(100)));
        assert_eq!(job.status, JobStatus::Pending);
        assert_eq!(job.last_error.as_deref(), Some(RECLAIM_ERROR));

        job.mark_processing(at(101));
        assert!(!job.reclaim(at(200)));
        assert_eq!(job.status, JobStatus::Processing);
        assert_eq!(job.attempts, 2);
        assert_eq!(job.updated_at, at(101));

        // Seen again before it was dead-lettered.
        assert!(!job.reclaim(at(300)));
        assert_eq!(job.attempts, 2);
    }

    #[rstest]
    #[case("pending", JobStatus::Pending)]
    #[case("processing", JobStatus::Processing)]
    #[case("done", JobStatus::Done)]
    #[case("error", JobStatus::Error)]
    fn status_parses_from_storage(#[case] raw: &str, #[case] expected: JobStatus) {
        assert_eq!(raw.parse::<JobStatus>().unwrap(), expected);
        assert_eq!(expected.as_str(), raw);
    }

    #[test]
    fn counts_track_each_status() {
        let mut counts = JobCounts::default();
        counts.record(JobStatus::Pending);
        counts.record(JobStatus::Done);
        counts.record(JobStatus::Done);
        assert_eq!(counts.done, 2);
        assert_eq!(counts.total(), 3);
    }
}
