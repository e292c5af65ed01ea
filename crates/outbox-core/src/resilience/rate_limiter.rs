//! Token-bucket rate limiter keyed by throttling subject (usually a tenant).
//!
//! Refill is lazy: elapsed wall-clock time is converted into tokens on every
//! access, capped at capacity. There is no background timer.

use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::domain::OutboxError;
use crate::impls::InMemoryBucketStore;
use crate::ports::{BucketStore, Clock, SystemClock};

/// Float slack for refill arithmetic (6s at 10/min must yield a whole token).
const TOKEN_EPSILON: f64 = 1e-9;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TokenBucket {
    pub capacity: f64,
    pub tokens: f64,
    pub last_update: DateTime<Utc>,
    pub refill_per_second: f64,
}

impl TokenBucket {
    /// A full bucket.
    pub fn full(capacity: f64, refill_per_second: f64, now: DateTime<Utc>) -> Self {
        Self {
            capacity,
            tokens: capacity,
            last_update: now,
            refill_per_second,
        }
    }

    /// Credit tokens for the time elapsed since `last_update`.
    ///
    /// A clock that moved backwards credits nothing.
    pub fn refill(&mut self, now: DateTime<Utc>) {
        let elapsed = (now - self.last_update).to_std().unwrap_or(Duration::ZERO);
        self.tokens = (self.tokens + elapsed.as_secs_f64() * self.refill_per_second)
            .min(self.capacity);
        if now > self.last_update {
            self.last_update = now;
        }
    }

    /// Take one token if available.
    pub fn try_consume(&mut self) -> bool {
        if self.tokens + TOKEN_EPSILON >= 1.0 {
            self.tokens = (self.tokens - 1.0).max(0.0);
            true
        } else {
            false
        }
    }

    /// Time until one whole token is available.
    pub fn time_until_token(&self) -> Duration {
        self.time_until(1.0)
    }

    /// Time until the bucket is back at capacity.
    pub fn time_until_full(&self) -> Duration {
        self.time_until(self.capacity)
    }

    fn time_until(&self, level: f64) -> Duration {
        let missing = level - self.tokens;
        if missing <= TOKEN_EPSILON {
            return Duration::ZERO;
        }
        if self.refill_per_second <= 0.0 {
            return Duration::MAX;
        }
        Duration::try_from_secs_f64(missing / self.refill_per_second).unwrap_or(Duration::MAX)
    }
}

/// Admission details returned on success.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RateLimitInfo {
    pub limit: u32,
    /// Whole tokens left after this call.
    pub remaining: u32,
    /// When the bucket will be full again.
    pub reset_at: DateTime<Utc>,
}

pub struct TokenBucketLimiter<S: BucketStore = InMemoryBucketStore> {
    store: S,
    clock: Arc<dyn Clock>,
}

impl TokenBucketLimiter<InMemoryBucketStore> {
    pub fn in_memory() -> Self {
        Self::new(InMemoryBucketStore::new(), Arc::new(SystemClock))
    }
}

impl Default for TokenBucketLimiter<InMemoryBucketStore> {
    fn default() -> Self {
        Self::in_memory()
    }
}

impl<S: BucketStore> TokenBucketLimiter<S> {
    pub fn new(store: S, clock: Arc<dyn Clock>) -> Self {
        Self { store, clock }
    }

    pub fn store(&self) -> &S {
        &self.store
    }

    /// Admit one call for `key` or reject it with `OutboxError::RateLimited`.
    ///
    /// `capacity` and `refill_per_minute` are applied on every call, so a
    /// caller can change a tenant's limits without resetting its bucket.
    /// A zero `capacity` can never admit anything and is rejected.
    pub fn check_and_consume(
        &self,
        key: &str,
        capacity: u32,
        refill_per_minute: u32,
    ) -> Result<RateLimitInfo, OutboxError> {
        if capacity == 0 {
            return Err(OutboxError::Validation(format!(
                "rate limit capacity for '{key}' must be at least 1"
            )));
        }
        let now = self.clock.now();
        let capacity_f = f64::from(capacity);
        let refill_per_second = f64::from(refill_per_minute) / 60.0;

        let mut admitted = false;
        let mut after = TokenBucket::full(capacity_f, refill_per_second, now);
        self.store.modify(
            key,
            TokenBucket::full(capacity_f, refill_per_second, now),
            &mut |bucket| {
                bucket.capacity = capacity_f;
                bucket.refill_per_second = refill_per_second;
                bucket.refill(now);
                admitted = bucket.try_consume();
                after = bucket.clone();
            },
        );

        if !admitted {
            let retry_after = after.time_until_token();
            tracing::debug!(
                key,
                tokens = after.tokens,
                retry_after_ms = retry_after.as_millis() as u64,
                "rate limited"
            );
            return Err(OutboxError::RateLimited {
                key: key.to_string(),
                retry_after,
            });
        }

        Ok(info_for(&after, capacity, now))
    }

    /// Current state for `key` after refilling; consumes nothing.
    pub fn peek(&self, key: &str) -> Option<TokenBucket> {
        let mut bucket = self.store.get(key)?;
        bucket.refill(self.clock.now());
        Some(bucket)
    }
}

fn info_for(bucket: &TokenBucket, limit: u32, now: DateTime<Utc>) -> RateLimitInfo {
    let until_full = chrono::Duration::from_std(bucket.time_until_full())
        .unwrap_or(chrono::Duration::MAX);
    RateLimitInfo {
        limit,
        remaining: bucket.tokens.max(0.0).floor() as u32,
        reset_at: now.checked_add_signed(until_full).unwrap_or(DateTime::<Utc>::MAX_UTC),
    }
}
