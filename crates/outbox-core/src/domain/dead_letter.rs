//! Dead letter records: durable trace of permanently failed work.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{DeadLetterId, JobId};
use super::job::{Job, JobType, TenantId};

/// Snapshot of the job at the moment it was dead-lettered.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetterSnapshot {
    pub job_type: JobType,
    pub attempts: u32,
    pub last_error: Option<String>,
    pub payload: serde_json::Value,
}

/// One dead letter per job that exhausted its retries or failed fatally.
///
/// The originating job row stays in the store with status `error`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DeadLetter {
    pub id: DeadLetterId,
    pub tenant_id: Option<TenantId>,
    /// Who dead-lettered it (e.g. `outbox_worker`).
    pub source: String,
    /// Original job id.
    pub key: JobId,
    pub reason: String,
    pub payload: DeadLetterSnapshot,
    pub created_at: DateTime<Utc>,
}

impl DeadLetter {
    pub fn from_job(
        id: DeadLetterId,
        job: &Job,
        source: impl Into<String>,
        reason: impl Into<String>,
        now: DateTime<Utc>,
    ) -> Self {
        Self {
            id,
            tenant_id: Some(job.tenant_id.clone()),
            source: source.into(),
            key: job.id,
            reason: reason.into(),
            payload: DeadLetterSnapshot {
                job_type: job.job_type.clone(),
                attempts: job.attempts,
                last_error: job.last_error.clone(),
                payload: job.payload.clone(),
            },
            created_at: now,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::NewJob;
    use ulid::Ulid;

    #[test]
    fn snapshot_copies_job_state() {
        let now = Utc::now();
        let new = NewJob::new(
            TenantId::new("t1"),
            JobType::new("catalog.sync"),
            &serde_json::json!({"sku": "A-1"}),
        )
        .unwrap();
        let mut job = Job::from_new(JobId::from_ulid(Ulid::new()), new, now);
        job.attempts = 2;
        job.last_error = Some("upstream 503".into());

        let dl = DeadLetter::from_job(
            DeadLetterId::from_ulid(Ulid::new()),
            &job,
            "outbox_worker",
            "retries exhausted",
            now,
        );

        assert_eq!(dl.key, job.id);
        assert_eq!(dl.tenant_id, Some(TenantId::new("t1")));
        assert_eq!(dl.payload.attempts, 2);
        assert_eq!(dl.payload.last_error.as_deref(), Some("upstream 503"));
        assert_eq!(dl.payload.payload["sku"], "A-1");
    }

    #[test]
    fn snapshot_serializes_as_document() {
        let snap = DeadLetterSnapshot {
            job_type: JobType::new("x"),
            attempts: 1,
            last_error: None,
            payload: serde_json::json!({}),
        };
        let v = serde_json::to_value(&snap).unwrap();
        assert_eq!(v["job_type"], "x");
        assert_eq!(v["attempts"], 1);
    }
}
