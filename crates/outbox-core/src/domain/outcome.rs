//! Handler outcome: the common result format every job handler returns.
//!
//! The worker only looks at this shape; it never inspects handler internals.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::errors::OutboxError;

/// Result of one handler invocation.
///
/// - `success = true`: the job is completed.
/// - `success = false, should_retry = true`: rescheduled while budget remains.
/// - `success = false, should_retry = false`: dead-lettered right away.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HandlerOutcome {
    pub success: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,

    #[serde(default)]
    pub should_retry: bool,

    /// Handler-chosen retry time; replaces the computed backoff.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub next_run_at_override: Option<DateTime<Utc>>,
}

impl HandlerOutcome {
    pub fn success() -> Self {
        Self {
            success: true,
            error: None,
            should_retry: false,
            next_run_at_override: None,
        }
    }

    /// Retryable failure.
    pub fn retry(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_retry: true,
            next_run_at_override: None,
        }
    }

    /// Permanent failure, no retry.
    pub fn fatal(error: impl Into<String>) -> Self {
        Self {
            success: false,
            error: Some(error.into()),
            should_retry: false,
            next_run_at_override: None,
        }
    }

    pub fn with_next_run_at(mut self, at: DateTime<Utc>) -> Self {
        self.next_run_at_override = Some(at);
        self
    }

    /// Map a handler error onto an outcome.
    ///
    /// Fatal errors are not retried. Everything else is, and errors carrying a
    /// wait hint (rate limited, breaker open) are never retried sooner than
    /// that hint.
    pub fn from_error(err: &OutboxError, now: DateTime<Utc>) -> Self {
        if err.is_fatal() {
            return Self::fatal(err.to_string());
        }
        let outcome = Self::retry(err.to_string());
        match err
            .retry_after()
            .and_then(|d| chrono::Duration::from_std(d).ok())
        {
            Some(wait) => outcome.with_next_run_at(now + wait),
            None => outcome,
        }
    }

    pub fn error_message(&self) -> &str {
        self.error.as_deref().unwrap_or("handler reported failure")
    }
}
