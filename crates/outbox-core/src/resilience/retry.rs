//! Retry policy: backoff delays and the generic retry loop.
//!
//! Two formulas live here:
//! - `RetryPolicy` drives in-process retries of one call (`retry`).
//! - `RescheduleBackoff` decides how far in the future a failed job is
//!   rescheduled by the worker.

use std::future::Future;
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use thiserror::Error;

use crate::domain::OutboxError;

/// Classifies errors that may consume a retry attempt.
///
/// Everything else propagates on first sight.
pub trait Retryable {
    fn is_retryable(&self) -> bool;
}

impl Retryable for OutboxError {
    fn is_retryable(&self) -> bool {
        OutboxError::is_retryable(self)
    }
}

/// In-process retry policy.
#[derive(Debug, Clone, PartialEq)]
pub struct RetryPolicy {
    /// Total invocations, including the first one.
    pub max_attempts: u32,

    pub base_delay: Duration,

    pub max_delay: Duration,

    pub exponential_base: f64,

    /// Widen each delay by uniform jitter in `[0, delay]`.
    pub jitter: bool,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            max_attempts: 3,
            base_delay: Duration::from_secs(1),
            max_delay: Duration::from_secs(60),
            exponential_base: 2.0,
            jitter: true,
        }
    }
}

impl RetryPolicy {
    pub fn without_jitter(mut self) -> Self {
        self.jitter = false;
        self
    }

    /// Delay before attempt `attempt` (1-indexed), jitter excluded.
    ///
    /// Example with base_delay=1s, exponential_base=2.0:
    /// - attempt 1: 0s (first call is immediate)
    /// - attempt 2: 1s
    /// - attempt 3: 2s
    /// - attempt 4: 4s
    pub fn delay_for_attempt(&self, attempt: u32) -> Duration {
        if attempt <= 1 {
            return Duration::ZERO;
        }
        let exponent = (attempt - 2).min(i32::MAX as u32) as i32;
        let secs = self.base_delay.as_secs_f64() * self.exponential_base.powi(exponent);
        cap(secs, self.max_delay)
    }

    /// Delay actually slept before `attempt`.
    pub fn sleep_for_attempt(&self, attempt: u32) -> Duration {
        let delay = self.delay_for_attempt(attempt);
        if !self.jitter || delay.is_zero() {
            return delay;
        }
        let extra = rand::thread_rng().gen_range(0.0..=delay.as_secs_f64());
        delay + Duration::from_secs_f64(extra)
    }
}

/// `min(max, secs)`, tolerant of overflow and NaN.
fn cap(secs: f64, max: Duration) -> Duration {
    if !secs.is_finite() || secs >= max.as_secs_f64() {
        max
    } else {
        Duration::from_secs_f64(secs.max(0.0))
    }
}

#[derive(Debug, Error)]
pub enum RetryError<E: std::fmt::Display + std::fmt::Debug> {
    /// A non-retryable error; returned untouched after the attempt that raised it.
    #[error("{0}")]
    Aborted(E),

    #[error("retries exhausted after {attempts} attempts: {last}")]
    Exhausted { attempts: u32, last: E },
}

impl<E: std::fmt::Display + std::fmt::Debug> RetryError<E> {
    pub fn into_inner(self) -> E {
        match self {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { last, .. } => last,
        }
    }
}

impl From<RetryError<OutboxError>> for OutboxError {
    fn from(err: RetryError<OutboxError>) -> Self {
        match err {
            RetryError::Aborted(e) => e,
            RetryError::Exhausted { attempts, last } => OutboxError::ExhaustedRetries {
                attempts,
                last_error: last.to_string(),
            },
        }
    }
}

/// Invoke `op` until it succeeds, fails with a non-retryable error, or
/// `policy.max_attempts` invocations have been spent.
///
/// `op` receives the 1-indexed attempt number.
pub async fn retry<T, E, F, Fut>(policy: &RetryPolicy, mut op: F) -> Result<T, RetryError<E>>
where
    E: Retryable + std::fmt::Display + std::fmt::Debug,
    F: FnMut(u32) -> Fut,
    Fut: Future<Output = Result<T, E>>,
{
    let max_attempts = policy.max_attempts.max(1);
    let mut attempt = 1;
    loop {
        match op(attempt).await {
            Ok(value) => return Ok(value),
            Err(err) if !err.is_retryable() => return Err(RetryError::Aborted(err)),
            Err(err) if attempt >= max_attempts => {
                return Err(RetryError::Exhausted {
                    attempts: attempt,
                    last: err,
                });
            }
            Err(err) => {
                attempt += 1;
                let delay = policy.sleep_for_attempt(attempt);
                tracing::warn!(
                    error = %err,
                    next_attempt = attempt,
                    max_attempts,
                    delay_ms = delay.as_millis() as u64,
                    "retryable failure, backing off"
                );
                tokio::time::sleep(delay).await;
            }
        }
    }
}

/// The worker's reschedule formula for failed jobs:
/// `min(max_delay, base_delay * 2^attempts)` plus jitter in
/// `[-base_delay, +base_delay]`, never less than one second.
#[derive(Debug, Clone, PartialEq)]
pub struct RescheduleBackoff {
    pub base_delay: Duration,
    pub max_delay: Duration,
}

/// Floor applied after jitter.
pub const MIN_RESCHEDULE_DELAY: Duration = Duration::from_secs(1);

impl RescheduleBackoff {
    pub fn new(base_delay: Duration, max_delay: Duration) -> Self {
        Self {
            base_delay,
            max_delay,
        }
    }

    /// Capped exponential part, before jitter.
    pub fn base_for(&self, attempts: u32) -> Duration {
        let exponent = attempts.min(i32::MAX as u32) as i32;
        cap(self.base_delay.as_secs_f64() * 2f64.powi(exponent), self.max_delay)
    }

    /// `base_for(attempts)` shifted by `jitter_secs`, floored at one second.
    pub fn delay_with(&self, attempts: u32, jitter_secs: f64) -> Duration {
        let secs = self.base_for(attempts).as_secs_f64() + jitter_secs;
        Duration::from_secs_f64(secs.max(MIN_RESCHEDULE_DELAY.as_secs_f64()))
    }

    pub fn delay(&self, attempts: u32) -> Duration {
        let spread = self.base_delay.as_secs_f64();
        let jitter = rand::thread_rng().gen_range(-spread..=spread);
        self.delay_with(attempts, jitter)
    }

    pub fn next_run_at(&self, now: DateTime<Utc>, attempts: u32) -> DateTime<Utc> {
        let delay = chrono::Duration::from_std(self.delay(attempts))
            .unwrap_or(chrono::Duration::MAX);
        now.checked_add_signed(delay).unwrap_or(DateTime::<Utc>::MAX_UTC)
    }
}

impl Default for RescheduleBackoff {
    fn default() -> Self {
        Self::new(Duration::from_secs(2), Duration::from_secs(3600))
    }
}
