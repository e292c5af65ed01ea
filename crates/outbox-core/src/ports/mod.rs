//! Ports - abstraction layer.
//!
//! Each trait is the seam to an external system (the database, the clock,
//! a shared rate-limit store). `impls` holds in-process versions; `pg`
//! (feature `postgres`) holds the database-backed ones.

pub mod bucket_store;
pub mod clock;
pub mod coordinator;
pub mod id_generator;
pub mod job_store;

pub use self::bucket_store::BucketStore;
pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::coordinator::Coordinator;
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::job_store::JobStore;
