//! BucketStore port - storage for token buckets.
//!
//! The limiter's correctness is scoped to what the store can make atomic.
//! The in-process default only sees this process; a shared implementation
//! would widen that to the fleet.

use crate::resilience::TokenBucket;

pub trait BucketStore: Send + Sync {
    /// Run `f` on the bucket for `key` while holding that key exclusively.
    /// `init` is stored first when the key has no bucket yet.
    fn modify(&self, key: &str, init: TokenBucket, f: &mut dyn FnMut(&mut TokenBucket));

    fn get(&self, key: &str) -> Option<TokenBucket>;
}
