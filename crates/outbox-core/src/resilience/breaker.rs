//! Circuit breaker: per-dependency failure tracker that fails fast.
//!
//! # State machine
//! - Closed -> Open: `consecutive_failures >= failure_threshold`, or the
//!   rolling window holds at least `minimum_calls` samples of which
//!   `failure_threshold` or more are failures.
//! - Open -> HalfOpen: lazily, on the first call after `recovery_timeout`
//!   has elapsed since the last failure.
//! - HalfOpen -> Closed: after `success_threshold` consecutive successes.
//! - HalfOpen -> Open: on any failure.
//!
//! State is process-local. Each breaker guards its state with its own lock;
//! the lock is never held while the wrapped operation runs.

use std::collections::{HashMap, VecDeque};
use std::fmt;
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::domain::OutboxError;
use crate::ports::{Clock, SystemClock};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CircuitState {
    Closed,
    Open,
    HalfOpen,
}

impl fmt::Display for CircuitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            CircuitState::Closed => "closed",
            CircuitState::Open => "open",
            CircuitState::HalfOpen => "half_open",
        })
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CircuitBreakerConfig {
    pub failure_threshold: u32,
    pub success_threshold: u32,
    pub recovery_timeout: Duration,
    /// Rolling window length (number of most recent outcomes kept).
    pub window_size: usize,
    /// Samples required before the window rule may trip the breaker.
    pub minimum_calls: usize,
    /// Per-call timeout for `call_async`. Counts as a failure when hit.
    pub call_timeout: Duration,
}

impl Default for CircuitBreakerConfig {
    fn default() -> Self {
        Self {
            failure_threshold: 5,
            success_threshold: 2,
            recovery_timeout: Duration::from_secs(30),
            window_size: 20,
            minimum_calls: 10,
            call_timeout: Duration::from_secs(10),
        }
    }
}

/// Error returned by a guarded call.
#[derive(Debug, Error)]
pub enum BreakerError<E> {
    /// Rejected without running the operation.
    #[error("circuit '{name}' is open, retry in {retry_in:?}")]
    Open { name: String, retry_in: Duration },

    #[error("call through circuit '{name}' timed out after {after:?}")]
    Timeout { name: String, after: Duration },

    /// The operation ran and failed.
    #[error("{0}")]
    Inner(E),
}

impl<E> BreakerError<E> {
    pub fn is_open(&self) -> bool {
        matches!(self, BreakerError::Open { .. })
    }
}

impl<E: Into<OutboxError>> From<BreakerError<E>> for OutboxError {
    fn from(err: BreakerError<E>) -> Self {
        match err {
            BreakerError::Open { name, retry_in } => OutboxError::CircuitOpen { name, retry_in },
            BreakerError::Timeout { after, .. } => OutboxError::Timeout(after),
            BreakerError::Inner(e) => e.into(),
        }
    }
}

/// Point-in-time view, for logs and status endpoints.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BreakerSnapshot {
    pub name: String,
    pub state: CircuitState,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub window_failures: usize,
    pub window_len: usize,
    pub last_failure_at: Option<DateTime<Utc>>,
    pub last_success_at: Option<DateTime<Utc>>,
}

struct BreakerInner {
    state: CircuitState,
    /// `true` = failure.
    window: VecDeque<bool>,
    consecutive_failures: u32,
    consecutive_successes: u32,
    last_failure_at: Option<DateTime<Utc>>,
    last_success_at: Option<DateTime<Utc>>,
}

impl BreakerInner {
    fn new(window_size: usize) -> Self {
        Self {
            state: CircuitState::Closed,
            window: VecDeque::with_capacity(window_size),
            consecutive_failures: 0,
            consecutive_successes: 0,
            last_failure_at: None,
            last_success_at: None,
        }
    }

    fn window_failures(&self) -> usize {
        self.window.iter().filter(|failed| **failed).count()
    }

    fn push_sample(&mut self, failed: bool, window_size: usize) {
        if window_size == 0 {
            return;
        }
        while self.window.len() >= window_size {
            self.window.pop_front();
        }
        self.window.push_back(failed);
    }

    fn reset_counters(&mut self) {
        self.window.clear();
        self.consecutive_failures = 0;
        self.consecutive_successes = 0;
    }
}

pub struct CircuitBreaker {
    name: String,
    config: CircuitBreakerConfig,
    clock: Arc<dyn Clock>,
    inner: Mutex<BreakerInner>,
}

impl CircuitBreaker {
    pub fn new(name: impl Into<String>, config: CircuitBreakerConfig) -> Self {
        Self::with_clock(name, config, Arc::new(SystemClock))
    }

    pub fn with_clock(
        name: impl Into<String>,
        config: CircuitBreakerConfig,
        clock: Arc<dyn Clock>,
    ) -> Self {
        let inner = BreakerInner::new(config.window_size);
        Self {
            name: name.into(),
            config,
            clock,
            inner: Mutex::new(inner),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn config(&self) -> &CircuitBreakerConfig {
        &self.config
    }

    /// Current state, applying the lazy open -> half_open transition.
    pub fn state(&self) -> CircuitState {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, now);
        inner.state
    }

    pub fn snapshot(&self) -> BreakerSnapshot {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, now);
        BreakerSnapshot {
            name: self.name.clone(),
            state: inner.state,
            consecutive_failures: inner.consecutive_failures,
            consecutive_successes: inner.consecutive_successes,
            window_failures: inner.window_failures(),
            window_len: inner.window.len(),
            last_failure_at: inner.last_failure_at,
            last_success_at: inner.last_success_at,
        }
    }

    /// Guard a synchronous operation.
    pub fn call<T, E, F>(&self, op: F) -> Result<T, BreakerError<E>>
    where
        F: FnOnce() -> Result<T, E>,
    {
        self.admit()?;
        match op() {
            Ok(value) => {
                self.record_success();
                Ok(value)
            }
            Err(err) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
        }
    }

    /// Guard an async operation, bounded by `call_timeout`.
    pub async fn call_async<T, E, Fut>(&self, fut: Fut) -> Result<T, BreakerError<E>>
    where
        Fut: Future<Output = Result<T, E>>,
    {
        self.admit()?;
        match tokio::time::timeout(self.config.call_timeout, fut).await {
            Ok(Ok(value)) => {
                self.record_success();
                Ok(value)
            }
            Ok(Err(err)) => {
                self.record_failure();
                Err(BreakerError::Inner(err))
            }
            Err(_elapsed) => {
                self.record_failure();
                Err(BreakerError::Timeout {
                    name: self.name.clone(),
                    after: self.config.call_timeout,
                })
            }
        }
    }

    /// Reject the call when open; otherwise let it through.
    fn admit<E>(&self) -> Result<(), BreakerError<E>> {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        self.maybe_half_open(&mut inner, now);
        if inner.state != CircuitState::Open {
            return Ok(());
        }
        let retry_in = inner
            .last_failure_at
            .and_then(|at| (at + to_chrono(self.config.recovery_timeout) - now).to_std().ok())
            .unwrap_or(Duration::ZERO);
        Err(BreakerError::Open {
            name: self.name.clone(),
            retry_in,
        })
    }

    fn maybe_half_open(&self, inner: &mut BreakerInner, now: DateTime<Utc>) {
        if inner.state != CircuitState::Open {
            return;
        }
        let recovered = match inner.last_failure_at {
            Some(at) => now - at >= to_chrono(self.config.recovery_timeout),
            None => true,
        };
        if recovered {
            self.transition(inner, CircuitState::HalfOpen);
            inner.reset_counters();
        }
    }

    pub fn record_success(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_failures = 0;
        inner.consecutive_successes += 1;
        inner.last_success_at = Some(now);
        inner.push_sample(false, self.config.window_size);

        if inner.state == CircuitState::HalfOpen
            && inner.consecutive_successes >= self.config.success_threshold
        {
            self.transition(&mut inner, CircuitState::Closed);
            inner.reset_counters();
        }
    }

    pub fn record_failure(&self) {
        let now = self.clock.now();
        let mut inner = self.inner.lock();
        inner.consecutive_successes = 0;
        inner.consecutive_failures += 1;
        inner.last_failure_at = Some(now);
        inner.push_sample(true, self.config.window_size);

        let should_open = match inner.state {
            CircuitState::HalfOpen => true,
            CircuitState::Closed => {
                let by_streak = inner.consecutive_failures >= self.config.failure_threshold;
                let by_window = inner.window.len() >= self.config.minimum_calls
                    && inner.window_failures() >= self.config.failure_threshold as usize;
                by_streak || by_window
            }
            CircuitState::Open => false,
        };
        if should_open {
            self.transition(&mut inner, CircuitState::Open);
        }
    }

    fn transition(&self, inner: &mut BreakerInner, to: CircuitState) {
        if inner.state == to {
            return;
        }
        let from = inner.state;
        inner.state = to;
        match to {
            CircuitState::Open => tracing::warn!(
                breaker = %self.name,
                %from,
                consecutive_failures = inner.consecutive_failures,
                "circuit opened"
            ),
            _ => tracing::info!(breaker = %self.name, %from, %to, "circuit state changed"),
        }
    }
}

fn to_chrono(d: Duration) -> chrono::Duration {
    chrono::Duration::from_std(d).unwrap_or(chrono::Duration::MAX)
}

/// Explicit registry of breakers keyed by dependency name.
///
/// Owned by the composition root and handed to whoever calls out; there is
/// no global instance.
pub struct CircuitBreakers {
    clock: Arc<dyn Clock>,
    defaults: CircuitBreakerConfig,
    breakers: Mutex<HashMap<String, Arc<CircuitBreaker>>>,
}

impl CircuitBreakers {
    pub fn new(defaults: CircuitBreakerConfig) -> Self {
        Self::with_clock(defaults, Arc::new(SystemClock))
    }

    pub fn with_clock(defaults: CircuitBreakerConfig, clock: Arc<dyn Clock>) -> Self {
        Self {
            clock,
            defaults,
            breakers: Mutex::new(HashMap::new()),
        }
    }

    /// Breaker for `name` with the registry's default config.
    pub fn get(&self, name: &str) -> Arc<CircuitBreaker> {
        self.get_or_create(name, self.defaults.clone())
    }

    /// Breaker for `name`; `config` only applies when it is created here.
    pub fn get_or_create(&self, name: &str, config: CircuitBreakerConfig) -> Arc<CircuitBreaker> {
        let mut breakers = self.breakers.lock();
        let breaker = breakers.entry(name.to_string()).or_insert_with(|| {
            Arc::new(CircuitBreaker::with_clock(
                name,
                config,
                Arc::clone(&self.clock),
            ))
        });
        Arc::clone(breaker)
    }

    pub fn snapshot(&self) -> Vec<BreakerSnapshot> {
        let breakers: Vec<_> = self.breakers.lock().values().cloned().collect();
        let mut all: Vec<_> = breakers.iter().map(|b| b.snapshot()).collect();
        all.sort_by(|a, b| a.name.cmp(&b.name));
        all
    }
}

impl Default for CircuitBreakers {
    fn default() -> Self {
        Self::new(CircuitBreakerConfig::default())
    }
}
