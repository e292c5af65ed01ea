//! Postgres coordinator: session advisory lock + heartbeat upserts.
//!
//! Advisory locks belong to a database session, not to a process. The lock
//! is therefore taken on one dedicated pooled connection that this
//! coordinator keeps for as long as it leads. Every acquisition attempt
//! pings that session first; if the ping fails the connection is dropped
//! and leadership is reported lost (the server frees the lock when the
//! session dies).
//!
//! One `PgCoordinator` per worker instance. `instance_id` is only used for
//! logging here; the session is the real identity.

use async_trait::async_trait;
use sqlx::pool::PoolConnection;
use sqlx::{PgPool, Postgres, Row};
use tokio::sync::Mutex;
use tracing::instrument;

use crate::domain::{HeartbeatDetails, StoreError, WorkerHeartbeat};
use crate::ports::Coordinator;

struct LeaderSession {
    conn: PoolConnection<Postgres>,
    held_key: Option<i64>,
}

pub struct PgCoordinator {
    pool: PgPool,
    session: Mutex<Option<LeaderSession>>,
}

impl PgCoordinator {
    pub fn new(pool: PgPool) -> Self {
        Self {
            pool,
            session: Mutex::new(None),
        }
    }
}

#[async_trait]
impl Coordinator for PgCoordinator {
    #[instrument(skip(self), err)]
    async fn try_acquire_leadership(
        &self,
        lock_key: i64,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let mut slot = self.session.lock().await;

        if let Some(session) = slot.as_mut() {
            if let Err(err) = sqlx::query("SELECT 1").execute(&mut *session.conn).await {
                tracing::warn!(error = %err, "leader session lost");
                if let Some(dead) = slot.take() {
                    drop(dead.conn.detach());
                }
            } else if session.held_key == Some(lock_key) {
                return Ok(true);
            }
        }

        if slot.is_none() {
            *slot = Some(LeaderSession {
                conn: self.pool.acquire().await?,
                held_key: None,
            });
        }
        let Some(session) = slot.as_mut() else {
            return Ok(false);
        };

        let acquired: bool = sqlx::query_scalar("SELECT pg_try_advisory_lock($1)")
            .bind(lock_key)
            .fetch_one(&mut *session.conn)
            .await?;
        if acquired {
            session.held_key = Some(lock_key);
        } else if session.held_key.is_none() {
            // Not leading: give the connection back to the pool.
            *slot = None;
        }
        Ok(acquired)
    }

    #[instrument(skip(self), err)]
    async fn release_leadership(
        &self,
        lock_key: i64,
        instance_id: &str,
    ) -> Result<bool, StoreError> {
        let mut slot = self.session.lock().await;
        let Some(session) = slot.as_mut() else {
            return Ok(false);
        };
        if session.held_key != Some(lock_key) {
            return Ok(false);
        }

        let released = sqlx::query_scalar::<_, bool>("SELECT pg_advisory_unlock($1)")
            .bind(lock_key)
            .fetch_one(&mut *session.conn)
            .await;
        let Some(session) = slot.take() else {
            return Ok(false);
        };
        match released {
            Ok(released) => Ok(released),
            Err(err) => {
                // Closing the session frees the lock server-side.
                drop(session.conn.detach());
                Err(err.into())
            }
        }
    }

    #[instrument(skip(self, heartbeat), fields(instance_id = %heartbeat.instance_id), err)]
    async fn record_heartbeat(&self, heartbeat: WorkerHeartbeat) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO worker_heartbeats (instance_id, seen_at, details)
            VALUES ($1, $2, $3)
            ON CONFLICT (instance_id)
            DO UPDATE SET seen_at = EXCLUDED.seen_at, details = EXCLUDED.details
            "#,
        )
        .bind(&heartbeat.instance_id)
        .bind(heartbeat.seen_at)
        .bind(serde_json::to_value(&heartbeat.details)?)
        .execute(&self.pool)
        .await?;
        Ok(())
    }

    async fn heartbeats(&self) -> Result<Vec<WorkerHeartbeat>, StoreError> {
        let rows = sqlx::query(
            "SELECT instance_id, seen_at, details FROM worker_heartbeats ORDER BY instance_id",
        )
        .fetch_all(&self.pool)
        .await?;
        rows.iter()
            .map(|row| -> Result<WorkerHeartbeat, StoreError> {
                let details: HeartbeatDetails = serde_json::from_value(row.try_get("details")?)?;
                Ok(WorkerHeartbeat {
                    instance_id: row.try_get("instance_id")?,
                    seen_at: row.try_get("seen_at")?,
                    details,
                })
            })
            .collect()
    }
}
