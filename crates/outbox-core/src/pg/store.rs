//! Postgres-backed job store.
//!
//! ## Claiming
//!
//! `claim_batch` is one statement: a CTE selects due pending rows with
//! `FOR UPDATE SKIP LOCKED` and the outer `UPDATE` flips them to processing.
//! Rows locked by a concurrent claimer are skipped rather than waited on, so
//! two claimers never receive the same job even without leadership.
//!
//! ## Transactional outbox
//!
//! Producers call [`PgJobStore::enqueue_in_tx`] with the transaction that
//! carries their business change. The job row exists iff that change commits.
//!
//! Timestamps written by the store (`updated_at`, claim eligibility, the
//! stale cutoff) use the database clock. Ids are ULIDs stored as bare text.

use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use sqlx::postgres::PgRow;
use sqlx::{PgPool, Postgres, Row, Transaction};
use tracing::instrument;

use crate::domain::{
    DeadLetter, DeadLetterSnapshot, Job, JobCounts, JobId, JobStatus, JobType, NewJob, RECLAIM_ERROR,
    Reclaimed, StoreError, TenantId,
};
use crate::ports::{Clock, IdGenerator, JobStore, SystemClock, UlidGenerator};

const JOB_COLUMNS: &str = "id, tenant_id, job_type, payload, status, attempts, max_attempts, \
                           next_run_at, last_error, created_at, updated_at";

#[derive(Clone)]
pub struct PgJobStore {
    pool: Arc<PgPool>,
    clock: Arc<dyn Clock>,
    ids: Arc<UlidGenerator<Arc<dyn Clock>>>,
}

impl PgJobStore {
    pub fn new(pool: PgPool) -> Self {
        Self::with_clock(pool, Arc::new(SystemClock))
    }

    pub fn with_clock(pool: PgPool, clock: Arc<dyn Clock>) -> Self {
        Self {
            pool: Arc::new(pool),
            ids: Arc::new(UlidGenerator::new(Arc::clone(&clock))),
            clock,
        }
    }

    pub fn pool(&self) -> &PgPool {
        &self.pool
    }

    /// Apply [`crate::pg::SCHEMA`].
    pub async fn ensure_schema(&self) -> Result<(), StoreError> {
        sqlx::raw_sql(super::SCHEMA).execute(&*self.pool).await?;
        Ok(())
    }

    /// Insert a job inside the caller's transaction.
    #[instrument(
        skip(self, tx, job),
        fields(tenant_id = %job.tenant_id, job_type = %job.job_type),
        err
    )]
    pub async fn enqueue_in_tx(
        &self,
        tx: &mut Transaction<'_, Postgres>,
        job: NewJob,
    ) -> Result<JobId, StoreError> {
        let id = self.ids.generate_job_id();
        insert_job(&mut **tx, id, &job).await?;
        Ok(id)
    }
}

async fn insert_job<'e, E>(executor: E, id: JobId, job: &NewJob) -> Result<(), StoreError>
where
    E: sqlx::Executor<'e, Database = Postgres>,
{
    sqlx::query(
        r#"
        INSERT INTO jobs (id, tenant_id, job_type, payload, status, attempts, max_attempts, next_run_at)
        VALUES ($1, $2, $3, $4, 'pending', 0, $5, COALESCE($6, now()))
        "#,
    )
    .bind(id.to_storage())
    .bind(job.tenant_id.as_str())
    .bind(job.job_type.as_str())
    .bind(&job.payload)
    .bind(to_db_count(job.max_attempts)?)
    .bind(job.run_at)
    .execute(executor)
    .await?;
    Ok(())
}

#[async_trait]
impl JobStore for PgJobStore {
    #[instrument(
        skip(self, job),
        fields(tenant_id = %job.tenant_id, job_type = %job.job_type),
        err
    )]
    async fn enqueue(&self, job: NewJob) -> Result<JobId, StoreError> {
        let id = self.ids.generate_job_id();
        insert_job(&*self.pool, id, &job).await?;
        Ok(id)
    }

    #[instrument(skip(self), err)]
    async fn claim_batch(&self, limit: usize) -> Result<Vec<Job>, StoreError> {
        if limit == 0 {
            return Ok(Vec::new());
        }
        let rows = sqlx::query(
            r#"
            WITH due AS (
                SELECT id
                FROM jobs
                WHERE status = 'pending' AND next_run_at <= now()
                ORDER BY next_run_at ASC
                LIMIT $1
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs AS j
            SET status = 'processing', updated_at = now()
            FROM due
            WHERE j.id = due.id
            RETURNING j.id, j.tenant_id, j.job_type, j.payload, j.status, j.attempts,
                      j.max_attempts, j.next_run_at, j.last_error, j.created_at, j.updated_at
            "#,
        )
        .bind(i64::try_from(limit).unwrap_or(i64::MAX))
        .fetch_all(&*self.pool)
        .await?;

        let mut jobs = rows.iter().map(job_from_row).collect::<Result<Vec<_>, _>>()?;
        // RETURNING order is unspecified.
        jobs.sort_by_key(|job| (job.next_run_at, job.id));
        Ok(jobs)
    }

    #[instrument(skip(self, id), fields(job_id = %id), err)]
    async fn complete(&self, id: JobId) -> Result<bool, StoreError> {
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'done', updated_at = now()
            WHERE id = $1 AND status IN ('pending', 'processing')
            "#,
        )
        .bind(id.to_storage())
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, id, error), fields(job_id = %id), err)]
    async fn fail(
        &self,
        id: JobId,
        error: &str,
        next_run_at: Option<DateTime<Utc>>,
    ) -> Result<bool, StoreError> {
        let status = match next_run_at {
            Some(_) => JobStatus::Pending,
            None => JobStatus::Error,
        };
        let result = sqlx::query(
            r#"
            UPDATE jobs
            SET attempts = attempts + 1,
                status = $2,
                last_error = $3,
                next_run_at = COALESCE($4, next_run_at),
                updated_at = now()
            WHERE id = $1 AND status = 'processing'
            "#,
        )
        .bind(id.to_storage())
        .bind(status.as_str())
        .bind(error)
        .bind(next_run_at)
        .execute(&*self.pool)
        .await?;
        Ok(result.rows_affected() > 0)
    }

    #[instrument(skip(self, id, reason), fields(job_id = %id), err)]
    async fn move_to_dlq(&self, id: JobId, source: &str, reason: &str) -> Result<bool, StoreError> {
        let mut tx = self.pool.begin().await?;

        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1 FOR UPDATE"))
            .bind(id.to_storage())
            .fetch_optional(&mut *tx)
            .await?;
        let Some(row) = row else {
            tx.rollback().await?;
            return Ok(false);
        };
        let job = job_from_row(&row)?;
        if job.status == JobStatus::Done {
            tx.rollback().await?;
            return Ok(false);
        }

        let letter = DeadLetter::from_job(
            self.ids.generate_dead_letter_id(),
            &job,
            source,
            reason,
            self.clock.now(),
        );
        let inserted = sqlx::query(
            r#"
            INSERT INTO dead_letters (id, tenant_id, source, key, reason, payload, created_at)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            ON CONFLICT (key) DO NOTHING
            "#,
        )
        .bind(letter.id.to_storage())
        .bind(letter.tenant_id.as_ref().map(TenantId::as_str))
        .bind(&letter.source)
        .bind(letter.key.to_storage())
        .bind(&letter.reason)
        .bind(serde_json::to_value(&letter.payload)?)
        .bind(letter.created_at)
        .execute(&mut *tx)
        .await?;
        if inserted.rows_affected() == 0 {
            tx.rollback().await?;
            return Ok(false);
        }

        sqlx::query(
            r#"
            UPDATE jobs
            SET status = 'error', last_error = $2, updated_at = now()
            WHERE id = $1
            "#,
        )
        .bind(id.to_storage())
        .bind(reason)
        .execute(&mut *tx)
        .await?;

        tx.commit().await?;
        Ok(true)
    }

    #[instrument(skip(self), err)]
    async fn reclaim_stale(&self, older_than: Duration) -> Result<Reclaimed, StoreError> {
        // Exhausted rows keep status and updated_at so the next pass reports
        // them again if dead-lettering does not happen.
        let rows = sqlx::query(
            r#"
            WITH stale AS (
                SELECT id
                FROM jobs
                WHERE status = 'processing'
                  AND updated_at < now() - make_interval(secs => $1)
                FOR UPDATE SKIP LOCKED
            )
            UPDATE jobs AS j
            SET attempts = LEAST(j.attempts + 1, j.max_attempts),
                last_error = $2,
                status = CASE WHEN j.attempts + 1 >= j.max_attempts THEN j.status ELSE 'pending' END,
                next_run_at = CASE WHEN j.attempts + 1 >= j.max_attempts THEN j.next_run_at ELSE now() END,
                updated_at = CASE WHEN j.attempts + 1 >= j.max_attempts THEN j.updated_at ELSE now() END
            FROM stale
            WHERE j.id = stale.id
            RETURNING j.id, j.status
            "#,
        )
        .bind(older_than.as_secs_f64())
        .bind(RECLAIM_ERROR)
        .fetch_all(&*self.pool)
        .await?;

        let mut reclaimed = Reclaimed::default();
        for row in rows {
            let id: JobId = parse_id("jobs.id", &row.try_get::<String, _>("id")?)?;
            let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
            match status {
                JobStatus::Pending => reclaimed.requeued.push(id),
                _ => reclaimed.exhausted.push(id),
            }
        }
        reclaimed.requeued.sort();
        reclaimed.exhausted.sort();
        Ok(reclaimed)
    }

    async fn get(&self, id: JobId) -> Result<Option<Job>, StoreError> {
        let row = sqlx::query(&format!("SELECT {JOB_COLUMNS} FROM jobs WHERE id = $1"))
            .bind(id.to_storage())
            .fetch_optional(&*self.pool)
            .await?;
        row.as_ref().map(job_from_row).transpose()
    }

    async fn dead_letters(&self) -> Result<Vec<DeadLetter>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT id, tenant_id, source, key, reason, payload, created_at
            FROM dead_letters
            ORDER BY created_at ASC, id ASC
            "#,
        )
        .fetch_all(&*self.pool)
        .await?;
        rows.iter().map(dead_letter_from_row).collect()
    }

    async fn counts_by_status(&self) -> Result<JobCounts, StoreError> {
        let rows = sqlx::query("SELECT status, COUNT(*) AS n FROM jobs GROUP BY status")
            .fetch_all(&*self.pool)
            .await?;
        let mut counts = JobCounts::default();
        for row in rows {
            let status: JobStatus = row.try_get::<String, _>("status")?.parse()?;
            let n: i64 = row.try_get("n")?;
            counts.add(status, usize::try_from(n).unwrap_or(0));
        }
        Ok(counts)
    }
}

fn to_db_count(n: u32) -> Result<i32, StoreError> {
    i32::try_from(n).map_err(|_| StoreError::CorruptRow(format!("count {n} does not fit INTEGER")))
}

fn from_db_count(column: &str, n: i32) -> Result<u32, StoreError> {
    u32::try_from(n).map_err(|_| StoreError::CorruptRow(format!("{column} is negative: {n}")))
}

fn parse_id<T: std::str::FromStr>(column: &str, raw: &str) -> Result<T, StoreError>
where
    T::Err: std::fmt::Display,
{
    raw.parse()
        .map_err(|e| StoreError::CorruptRow(format!("{column} '{raw}' is not a valid id: {e}")))
}

fn job_from_row(row: &PgRow) -> Result<Job, StoreError> {
    let id: String = row.try_get("id")?;
    let status: String = row.try_get("status")?;
    Ok(Job {
        id: parse_id("jobs.id", &id)?,
        tenant_id: TenantId::new(row.try_get::<String, _>("tenant_id")?),
        job_type: JobType::new(row.try_get::<String, _>("job_type")?),
        payload: row.try_get("payload")?,
        status: status.parse()?,
        attempts: from_db_count("attempts", row.try_get("attempts")?)?,
        max_attempts: from_db_count("max_attempts", row.try_get("max_attempts")?)?,
        next_run_at: row.try_get("next_run_at")?,
        last_error: row.try_get("last_error")?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

fn dead_letter_from_row(row: &PgRow) -> Result<DeadLetter, StoreError> {
    let id: String = row.try_get("id")?;
    let key: String = row.try_get("key")?;
    let payload: DeadLetterSnapshot = serde_json::from_value(row.try_get("payload")?)?;
    Ok(DeadLetter {
        id: parse_id("dead_letters.id", &id)?,
        tenant_id: row.try_get::<Option<String>, _>("tenant_id")?.map(TenantId::new),
        source: row.try_get("source")?,
        key: parse_id("dead_letters.key", &key)?,
        reason: row.try_get("reason")?,
        payload,
        created_at: row.try_get("created_at")?,
    })
}
