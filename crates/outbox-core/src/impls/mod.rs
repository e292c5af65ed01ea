//! Impls - in-process implementations of the ports.
//!
//! # Included
//! - **InMemoryJobStore**: queue store for tests, demos and single-process setups
//! - **InMemoryCoordinator**: leader lock + heartbeats shared within a process
//! - **InMemoryBucketStore**: default rate limiter storage
//!
//! Database-backed implementations live in `crate::pg` (feature `postgres`).

pub mod memory_buckets;
pub mod memory_coordinator;
pub mod memory_store;

pub use self::memory_buckets::InMemoryBucketStore;
pub use self::memory_coordinator::InMemoryCoordinator;
pub use self::memory_store::InMemoryJobStore;
