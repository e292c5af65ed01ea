//! Errors - error taxonomy shared by handlers, resilience primitives and the worker.
//!
//! # Classification
//! - `Transient`, `Timeout`, `CircuitOpen`, `RateLimited`: retryable
//! - `Fatal`, `Validation`, `HandlerNotFound`: never retried, dead-lettered
//! - `ExhaustedRetries`: retries were consumed without success
//! - `Store`: the queue store itself failed (infrastructure)

use std::time::Duration;

use thiserror::Error;

use super::job::JobType;

/// Top-level error type.
#[derive(Debug, Error)]
pub enum OutboxError {
    /// Network / timeout / 5xx-like failure. Worth retrying.
    #[error("transient error: {0}")]
    Transient(String),

    /// Malformed payload, permanently invalid target. Goes straight to the DLQ.
    #[error("fatal error: {0}")]
    Fatal(String),

    #[error("retries exhausted after {attempts} attempts: {last_error}")]
    ExhaustedRetries { attempts: u32, last_error: String },

    /// Breaker is open; the caller must treat this as transient.
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    CircuitOpen { name: String, retry_in: Duration },

    /// Bucket is empty; the caller must wait `retry_after`.
    #[error("rate limited on '{key}', retry after {retry_after:?}")]
    RateLimited { key: String, retry_after: Duration },

    #[error("operation timed out after {0:?}")]
    Timeout(Duration),

    #[error("validation error: {0}")]
    Validation(String),

    #[error("no handler registered for job_type={0}")]
    HandlerNotFound(JobType),

    #[error(transparent)]
    Store(#[from] StoreError),
}

impl OutboxError {
    /// Should a retry engine spend another attempt on this error?
    pub fn is_retryable(&self) -> bool {
        matches!(
            self,
            OutboxError::Transient(_)
                | OutboxError::Timeout(_)
                | OutboxError::CircuitOpen { .. }
                | OutboxError::RateLimited { .. }
        )
    }

    /// Fatal errors skip the retry path entirely.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            OutboxError::Fatal(_) | OutboxError::Validation(_) | OutboxError::HandlerNotFound(_)
        )
    }

    /// Suggested wait before the next attempt, when the error carries one.
    pub fn retry_after(&self) -> Option<Duration> {
        match self {
            OutboxError::RateLimited { retry_after, .. } => Some(*retry_after),
            OutboxError::CircuitOpen { retry_in, .. } => Some(*retry_in),
            _ => None,
        }
    }
}

/// Errors raised by a `JobStore` / `Coordinator` implementation.
#[derive(Debug, Error)]
pub enum StoreError {
    #[error("payload serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A stored row could not be mapped back into a domain value.
    #[error("corrupt row: {0}")]
    CorruptRow(String),

    #[cfg(feature = "postgres")]
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),
}
