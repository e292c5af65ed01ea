//! PostgreSQL implementations of the store and coordinator ports.
//!
//! Enabled with the `postgres` feature. Apply [`SCHEMA`] before use.

pub mod coordinator;
pub mod store;

pub use self::coordinator::PgCoordinator;
pub use self::store::PgJobStore;

/// DDL for `jobs`, `dead_letters` and `worker_heartbeats`.
pub const SCHEMA: &str = include_str!("schema.sql");
