//! Ports - 抽象化レイヤー
//!
//! 各 trait は外部システム（PostgreSQL, Redis, RabbitMQ）への
//! インターフェースを提供し、実装の詳細を隠蔽します。
//!
//! # 設計原則
//! - TaskStore が source of truth（正本）
//! - Cache は best-effort（正しさには関与しない）
//! - Broker は at-least-once、manual ack

pub mod broker;
pub mod cache;
pub mod clock;
pub mod id_generator;
pub mod task_store;

pub use self::broker::{Broker, BrokerError, Delivery};
pub use self::cache::{Cache, CacheError};
pub use self::clock::{Clock, FixedClock, SystemClock};
pub use self::id_generator::{IdGenerator, UlidGenerator};
pub use self::task_store::{StoreError, TaskStore, UpdateOutcome};
