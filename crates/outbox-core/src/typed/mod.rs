//! Typed - 型付き Job API
//!
//! job_type の typo を型で排除し、Handler との対応付けを静的に保証します。
//!
//! # 二層構造
//! - **表層（Typed）**: `JobPayload` trait, `Handler<T>` trait - 型安全
//! - **内部（Dyn）**: `JobHandler` trait - object-safe, type erasure

pub mod handler;
pub mod payload;
pub mod registry;

pub use self::handler::{Handler, JobHandler, TypedHandler};
pub use self::payload::JobPayload;
pub use self::registry::{HandlerRegistry, RegistryError};
