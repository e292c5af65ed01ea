//! In-process token bucket storage (the limiter's default).
//!
//! The map lock is only held to find or insert a key; each bucket has its own
//! mutex, so calls for different keys never wait on each other.

use std::collections::HashMap;
use std::sync::Arc;

use parking_lot::{Mutex, RwLock};

use crate::ports::BucketStore;
use crate::resilience::TokenBucket;

type Slot = Arc<Mutex<TokenBucket>>;

#[derive(Default)]
pub struct InMemoryBucketStore {
    buckets: RwLock<HashMap<String, Slot>>,
}

impl InMemoryBucketStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.buckets.read().len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.read().is_empty()
    }

    fn slot(&self, key: &str, init: TokenBucket) -> Slot {
        if let Some(slot) = self.buckets.read().get(key) {
            return Arc::clone(slot);
        }
        let mut buckets = self.buckets.write();
        let slot = buckets
            .entry(key.to_string())
            .or_insert_with(move || Arc::new(Mutex::new(init)));
        Arc::clone(slot)
    }
}

impl BucketStore for InMemoryBucketStore {
    fn modify(&self, key: &str, init: TokenBucket, f: &mut dyn FnMut(&mut TokenBucket)) {
        let slot = self.slot(key, init);
        let mut bucket = slot.lock();
        f(&mut bucket);
    }

    fn get(&self, key: &str) -> Option<TokenBucket> {
        let slot = self.buckets.read().get(key).cloned()?;
        let bucket = slot.lock().clone();
        Some(bucket)
    }
}

#[cfg(test)]
mod tests {
    use chrono::Utc;

    use super::*;

    fn bucket(tokens: f64) -> TokenBucket {
        TokenBucket::full(tokens, 1.0, Utc::now())
    }

    #[test]
    fn init_is_used_only_for_new_keys() {
        let store = InMemoryBucketStore::new();
        store.modify("t1", bucket(3.0), &mut |b| b.tokens -= 1.0);
        store.modify("t1", bucket(10.0), &mut |b| b.tokens -= 1.0);

        assert_eq!(store.get("t1").unwrap().tokens, 1.0);
        assert_eq!(store.len(), 1);
        assert!(store.get("t2").is_none());
    }

    #[test]
    fn other_keys_stay_available_while_one_is_held() {
        let store = InMemoryBucketStore::new();
        let mut inner_tokens = None;

        store.modify("t1", bucket(1.0), &mut |outer| {
            outer.tokens = 0.0;
            // Would deadlock if the whole map were locked for the call.
            store.modify("t2", bucket(5.0), &mut |inner| {
                inner.tokens -= 1.0;
                inner_tokens = Some(inner.tokens);
            });
        });

        assert_eq!(inner_tokens, Some(4.0));
        assert_eq!(store.get("t1").unwrap().tokens, 0.0);
    }
}
