//! Impls - ports の実装
//!
//! # 含まれる実装
//! - **InMemoryTaskStore / InMemoryCache / InMemoryBroker**: 開発用・テスト用
//!
//! # 本番用実装（feature で有効化）
//! - `postgres`: PgTaskStore
//! - `redis`: RedisCache
//! - `amqp`: AmqpBroker（RabbitMQ）

pub mod memory_broker;
pub mod memory_cache;
pub mod memory_store;

#[cfg(feature = "amqp")]
pub mod amqp_broker;
#[cfg(feature = "postgres")]
pub mod pg_store;
#[cfg(feature = "redis")]
pub mod redis_cache;

pub use self::memory_broker::InMemoryBroker;
pub use self::memory_cache::InMemoryCache;
pub use self::memory_store::InMemoryTaskStore;

#[cfg(feature = "amqp")]
pub use self::amqp_broker::AmqpBroker;
#[cfg(feature = "postgres")]
pub use self::pg_store::PgTaskStore;
#[cfg(feature = "redis")]
pub use self::redis_cache::RedisCache;
