//! ferry-core
//!
//! Task lifecycle and delivery engine: tasks are persisted, published to a
//! broker, executed by workers with at-least-once delivery, retried with
//! backoff and recorded in a terminal state.
//!
//! # モジュール構成
//! - **domain**: ids, status machine, TaskRecord, TaskUpdate, errors
//! - **ports**: TaskStore, Cache, Broker, Clock, IdGenerator
//! - **lifecycle**: LifecycleController, IdempotencyGuard, CacheAside
//! - **app**: Dispatcher, Processor, retry, workers, reaper, builder
//! - **impls**: in-memory ports（feature で Postgres / Redis / RabbitMQ）
//! - **config**: `FERRY_*` 環境変数からの設定

pub mod app;
pub mod config;
pub mod domain;
pub mod impls;
pub mod lifecycle;
pub mod ports;

pub use crate::app::{
    BuildError, Engine, EngineBuilder, HandlerRegistry, ProcessOutcome, RetryPolicy, SubmitTask,
    TaskHandler, TaskService, WorkerGroup,
};
pub use crate::config::{ConfigError, FerryConfig};
pub use crate::domain::{
    ErrorClass, HandlerError, TaskError, TaskId, TaskKind, TaskRecord, TaskStatus, TaskUpdate,
};
