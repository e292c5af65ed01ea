//! outbox-core
//!
//! Reliable asynchronous job processing on top of a transactional outbox.
//!
//! # モジュール構成
//! - **domain**: ドメインモデル（ids, job, dead_letter, heartbeat, outcome, errors）
//! - **ports**: 抽象化レイヤー（JobStore, Coordinator, BucketStore, Clock, IdGenerator）
//! - **impls**: in-process 実装（InMemoryJobStore など開発・テスト用）
//! - **pg**: PostgreSQL 実装（feature `postgres`）
//! - **resilience**: retry/backoff, circuit breaker, token-bucket rate limiter
//! - **typed**: 型付き Job API（JobPayload, Handler, HandlerRegistry）
//! - **app**: worker（config, builder, poll loop, stats）
//! - **observability**: tracing subscriber setup
//!
//! # 保証
//! - at-least-once: a job may run more than once (crash after the handler,
//!   before `complete`); handlers must be idempotent
//! - at-most-one active claim per job, enforced by the store
//! - at most one dead letter per job

pub mod app;
pub mod domain;
pub mod impls;
pub mod observability;
pub mod ports;
pub mod resilience;
pub mod typed;

#[cfg(feature = "postgres")]
pub mod pg;

pub use self::app::{OutboxWorker, WorkerBuilder, WorkerConfig, WorkerHandle};
pub use self::domain::{HandlerOutcome, Job, JobId, NewJob, OutboxError, StoreError};
pub use self::typed::{Handler, JobHandler, JobPayload};
