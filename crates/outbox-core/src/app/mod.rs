//! App - アプリケーション層
//!
//! ports を組み合わせて worker を組み立てます。
//!
//! # 主要コンポーネント
//! - **WorkerBuilder**: wiring + 起動時検証
//! - **OutboxWorker**: leader-elected poll loop (claim → handle → complete / reschedule / dead-letter)
//! - **WorkerConfig**: 設定値
//! - **WorkerStats**: counters exported through heartbeats

pub mod builder;
pub mod config;
pub mod stats;
pub mod worker;

pub use self::builder::{BuildError, WorkerBuilder};
pub use self::config::{DEFAULT_LOCK_KEY, WorkerConfig};
pub use self::stats::{StatsSnapshot, WorkerStats};
pub use self::worker::{
    DLQ_SOURCE, HANDLER_PANIC_ERROR, OutboxWorker, RECLAIM_DLQ_SOURCE, TickReport, WorkerHandle,
    WorkerState,
};
