//! App - アプリケーション層
//!
//! ports と lifecycle を組み合わせて producer / consumer の流れを実装する。
//!
//! # 主要コンポーネント
//! - **EngineBuilder**: 構築とワイヤリング
//! - **Dispatcher**: 永続化してから publish
//! - **Processor**: 1 配送の claim → running → handler → 結果の記録
//! - **RetryPolicy / RetryScheduler**: 再試行の判断と遅延再配送
//! - **WorkerGroup**: consumer loop 群
//! - **Reaper**: 取り残された pending の再配送
//! - **TaskService**: HTTP 境界向けの操作

pub mod builder;
pub mod dispatcher;
pub mod handler;
pub mod processor;
pub mod reaper;
pub mod retry;
pub mod scheduler;
pub mod service;
pub mod worker;

pub use self::builder::{BuildError, Engine, EngineBuilder};
pub use self::dispatcher::Dispatcher;
pub use self::handler::{HandlerRegistry, RegistryError, TaskHandler};
pub use self::processor::{ProcessOutcome, Processor};
pub use self::reaper::Reaper;
pub use self::retry::{Backoff, Decision, RetryPolicy};
pub use self::scheduler::RetryScheduler;
pub use self::service::{SubmitTask, TaskService};
pub use self::worker::{WorkerContext, WorkerGroup};
