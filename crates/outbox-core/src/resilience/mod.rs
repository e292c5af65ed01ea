//! Protective primitives for calling flaky dependencies.
//!
//! - `retry`: in-process retry loop and the worker's reschedule backoff
//! - `breaker`: per-dependency circuit breakers
//! - `rate_limiter`: per-key token buckets

pub mod breaker;
pub mod rate_limiter;
pub mod retry;

pub use self::breaker::{
    BreakerError, BreakerSnapshot, CircuitBreaker, CircuitBreakerConfig, CircuitBreakers,
    CircuitState,
};
pub use self::rate_limiter::{RateLimitInfo, TokenBucket, TokenBucketLimiter};
pub use self::retry::{
    MIN_RESCHEDULE_DELAY, RescheduleBackoff, RetryError, RetryPolicy, Retryable, retry,
};
