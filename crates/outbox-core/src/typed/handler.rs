//! Handler traits - what the worker calls for each claimed job.
//!
//! # 学習ポイント
//! - ジェネリック trait (`Handler<T>`)
//! - Object-safe trait (`JobHandler`)
//! - Type erasure パターン (`TypedHandler<T, H>` → `JobHandler`)

use std::marker::PhantomData;

use async_trait::async_trait;

use super::payload::JobPayload;
use crate::domain::{HandlerOutcome, Job, OutboxError};

/// Typed handler: receives the decoded payload plus the job it came from.
///
/// # 使用例
/// ```ignore
/// struct SyncContactHandler;
///
/// #[async_trait]
/// impl Handler<SyncContact> for SyncContactHandler {
///     async fn handle(&self, payload: SyncContact, job: &Job) -> Result<HandlerOutcome, OutboxError> {
///         crm.push(&job.tenant_id, payload).await?;
///         Ok(HandlerOutcome::success())
///     }
/// }
/// ```
///
/// An `Err` is mapped onto an outcome with `HandlerOutcome::from_error`, so
/// handlers may simply use `?` on retry, breaker and limiter errors.
#[async_trait]
pub trait Handler<T: JobPayload>: Send + Sync {
    async fn handle(&self, payload: T, job: &Job) -> Result<HandlerOutcome, OutboxError>;
}

/// Object-safe handler, stored as `Arc<dyn JobHandler>` in the registry.
///
/// Implement it directly when the raw JSON payload is all you need.
#[async_trait]
pub trait JobHandler: Send + Sync {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, OutboxError>;
}

/// Erases `Handler<T>` into `JobHandler` by decoding the payload first.
///
/// A payload that does not decode into `T` is a fatal error: retrying the
/// same bytes cannot succeed.
pub struct TypedHandler<T: JobPayload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: JobPayload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: JobPayload, H: Handler<T>> JobHandler for TypedHandler<T, H> {
    async fn handle(&self, job: &Job) -> Result<HandlerOutcome, OutboxError> {
        let payload: T = serde_json::from_value(job.payload.clone()).map_err(|e| {
            OutboxError::Fatal(format!("payload does not decode as {}: {e}", T::TYPE))
        })?;
        self.handler.handle(payload, job).await
    }
}

#[cfg(test)]
pub(crate) mod fixtures {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;
    use crate::typed::payload::fixtures::{SendEmail, SyncContact};

    /// Counts calls; always succeeds.
    #[derive(Default)]
    pub struct CountingEmailHandler {
        pub calls: AtomicUsize,
    }

    #[async_trait]
    impl Handler<SendEmail> for CountingEmailHandler {
        async fn handle(&self, _payload: SendEmail, _job: &Job) -> Result<HandlerOutcome, OutboxError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(HandlerOutcome::success())
        }
    }

    /// Rejects contacts without an id.
    pub struct ContactHandler;

    #[async_trait]
    impl Handler<SyncContact> for ContactHandler {
        async fn handle(&self, payload: SyncContact, _job: &Job) -> Result<HandlerOutcome, OutboxError> {
            if payload.contact_id.is_empty() {
                return Err(OutboxError::Fatal("contact_id is empty".into()));
            }
            Ok(HandlerOutcome::success())
        }
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;
    use serde_json::json;

    use super::fixtures::{ContactHandler, CountingEmailHandler};
    use super::*;
    use crate::domain::{JobId, JobType, NewJob, TenantId};
    use crate::typed::payload::fixtures::{SendEmail, SyncContact};

    fn job(job_type: &str, payload: serde_json::Value) -> Job {
        let new = NewJob::new(TenantId::new("t1"), JobType::new(job_type), &payload).unwrap();
        Job::from_new(JobId::from_ulid(ulid::Ulid::new()), new, Utc::now())
    }

    #[tokio::test]
    async fn decodes_and_delegates() {
        let typed = TypedHandler::<SendEmail, _>::new(CountingEmailHandler::default());
        let outcome = typed
            .handle(&job(SendEmail::TYPE, json!({"to": "a@example.com", "subject": "hi"})))
            .await
            .unwrap();

        assert!(outcome.success);
        assert_eq!(typed.handler.calls.load(std::sync::atomic::Ordering::SeqCst), 1);
    }

    #[tokio::test]
    async fn undecodable_payload_is_fatal() {
        let typed = TypedHandler::<SendEmail, _>::new(CountingEmailHandler::default());
        let err = typed
            .handle(&job(SendEmail::TYPE, json!({"to": 42})))
            .await
            .unwrap_err();

        assert!(err.is_fatal());
        assert_eq!(typed.handler.calls.load(std::sync::atomic::Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn handler_errors_pass_through() {
        let typed = TypedHandler::<SyncContact, _>::new(ContactHandler);
        let err = typed
            .handle(&job(SyncContact::TYPE, json!({"contact_id": ""})))
            .await
            .unwrap_err();
        assert!(matches!(err, OutboxError::Fatal(_)));
    }
}
