//! Lifecycle - レコードの状態と cache の整合を守る層
//!
//! - **LifecycleController**: status 遷移の唯一の権限者
//! - **IdempotencyGuard**: 配送単位の claim
//! - **CacheAside**: populate-on-read / invalidate-on-write

pub mod cache_aside;
pub mod controller;
pub mod idempotency;

pub use self::cache_aside::CacheAside;
pub use self::controller::{LifecycleController, Transition};
pub use self::idempotency::{ClaimKey, IdempotencyGuard};
