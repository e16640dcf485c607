//! EngineBuilder - エンジンの構築とワイヤリング
//!
//! # 設計原則
//! - ports は `Arc<dyn Port>` で明示的に注入する（グローバル参照なし）
//! - 未指定の port は in-memory 実装で埋める
//! - 起動時検証（Fail-fast）: expect_kinds() の kind が全て登録済みか build() で確認

use std::sync::Arc;

use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use crate::app::dispatcher::Dispatcher;
use crate::app::handler::{HandlerRegistry, RegistryError, TaskHandler};
use crate::app::processor::Processor;
use crate::app::reaper::Reaper;
use crate::app::retry::RetryPolicy;
use crate::app::scheduler::RetryScheduler;
use crate::app::service::TaskService;
use crate::app::worker::{WorkerContext, WorkerGroup};
use crate::config::{ConfigError, FerryConfig};
use crate::domain::TaskKind;
use crate::impls::{InMemoryBroker, InMemoryCache, InMemoryTaskStore};
use crate::lifecycle::{CacheAside, IdempotencyGuard, LifecycleController};
use crate::ports::{Broker, Cache, Clock, IdGenerator, SystemClock, TaskStore, UlidGenerator};

/// # 使用例
/// ```ignore
/// let engine = EngineBuilder::new(FerryConfig::from_env()?)
///     .with_store(store)
///     .register("email", Arc::new(EmailHandler))?
///     .expect_kinds(&["email"])
///     .build()?;
/// let workers = engine.spawn_workers();
/// ```
pub struct EngineBuilder {
    config: FerryConfig,
    store: Option<Arc<dyn TaskStore>>,
    cache: Option<Arc<dyn Cache>>,
    broker: Option<Arc<dyn Broker>>,
    clock: Option<Arc<dyn Clock>>,
    ids: Option<Arc<dyn IdGenerator>>,
    policy: Option<RetryPolicy>,
    registry: HandlerRegistry,
    expected_kinds: Option<Vec<String>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("Missing task kinds: {0:?}. These kinds were expected but not registered.")]
    MissingKinds(Vec<String>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl EngineBuilder {
    pub fn new(config: FerryConfig) -> Self {
        Self {
            config,
            store: None,
            cache: None,
            broker: None,
            clock: None,
            ids: None,
            policy: None,
            registry: HandlerRegistry::new(),
            expected_kinds: None,
        }
    }

    pub fn with_store(mut self, store: Arc<dyn TaskStore>) -> Self {
        self.store = Some(store);
        self
    }

    pub fn with_cache(mut self, cache: Arc<dyn Cache>) -> Self {
        self.cache = Some(cache);
        self
    }

    pub fn with_broker(mut self, broker: Arc<dyn Broker>) -> Self {
        self.broker = Some(broker);
        self
    }

    pub fn with_clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn with_id_generator(mut self, ids: Arc<dyn IdGenerator>) -> Self {
        self.ids = Some(ids);
        self
    }

    /// Overrides the policy derived from `config.retry`.
    pub fn with_retry_policy(mut self, policy: RetryPolicy) -> Self {
        self.policy = Some(policy);
        self
    }

    pub fn register(
        mut self,
        kind: impl Into<String>,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<Self, RegistryError> {
        self.registry.register(TaskKind::new(kind), handler)?;
        Ok(self)
    }

    /// Handler for kinds with no registration.
    pub fn fallback(mut self, handler: Arc<dyn TaskHandler>) -> Self {
        self.registry.set_fallback(handler);
        self
    }

    pub fn expect_kinds(mut self, kinds: &[&str]) -> Self {
        self.expected_kinds = Some(kinds.iter().map(|k| k.to_string()).collect());
        self
    }

    pub fn build(self) -> Result<Engine, BuildError> {
        self.config.validate()?;

        if let Some(expected) = &self.expected_kinds {
            let registered: Vec<String> = self
                .registry
                .kinds()
                .iter()
                .map(|k| k.as_str().to_string())
                .collect();
            let missing: Vec<String> = expected
                .iter()
                .filter(|k| !registered.contains(k))
                .cloned()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingKinds(missing));
            }
        }

        let config = self.config;
        let store = self
            .store
            .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new()));
        let cache = self.cache.unwrap_or_else(|| Arc::new(InMemoryCache::new()));
        let broker = self
            .broker
            .unwrap_or_else(|| Arc::new(InMemoryBroker::new()));
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let ids = self
            .ids
            .unwrap_or_else(|| Arc::new(UlidGenerator::new(clock.clone())));
        let policy = self
            .policy
            .unwrap_or_else(|| RetryPolicy::from(&config.retry));

        let accessor = Arc::new(CacheAside::new(
            cache.clone(),
            store.clone(),
            config.cache.record_ttl(),
        ));
        let controller = Arc::new(LifecycleController::new(
            store.clone(),
            accessor.clone(),
            clock.clone(),
            policy.max_attempts,
        ));
        let guard = Arc::new(IdempotencyGuard::new(cache, config.cache.claim_ttl()));
        let queue = config.worker.queue.clone();
        let scheduler = Arc::new(RetryScheduler::new(broker.clone(), queue.clone()));
        let dispatcher = Arc::new(Dispatcher::new(
            store.clone(),
            accessor.clone(),
            broker.clone(),
            ids,
            clock.clone(),
            queue,
        ));
        let processor = Processor::new(
            controller.clone(),
            guard,
            Arc::new(self.registry),
            policy,
            scheduler.clone(),
        )
        .with_requeue_delay(config.worker.requeue_delay());
        let processor = Arc::new(processor);
        let reaper = Arc::new(Reaper::new(
            store,
            controller.clone(),
            dispatcher.clone(),
            clock,
            config.reaper.stale_after(),
            config.reaper.batch_size,
        ));
        let service = Arc::new(TaskService::new(dispatcher.clone(), accessor.clone()));

        Ok(Engine {
            config,
            broker,
            cache: accessor,
            controller,
            dispatcher,
            processor,
            scheduler,
            reaper,
            service,
        })
    }
}

/// Wired engine. Cheap handles onto the shared components.
pub struct Engine {
    config: FerryConfig,
    broker: Arc<dyn Broker>,
    cache: Arc<CacheAside>,
    controller: Arc<LifecycleController>,
    dispatcher: Arc<Dispatcher>,
    processor: Arc<Processor>,
    scheduler: Arc<RetryScheduler>,
    reaper: Arc<Reaper>,
    service: Arc<TaskService>,
}

impl Engine {
    pub fn config(&self) -> &FerryConfig {
        &self.config
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn service(&self) -> &Arc<TaskService> {
        &self.service
    }

    pub fn processor(&self) -> &Arc<Processor> {
        &self.processor
    }

    pub fn scheduler(&self) -> &Arc<RetryScheduler> {
        &self.scheduler
    }

    pub fn controller(&self) -> &Arc<LifecycleController> {
        &self.controller
    }

    pub fn cache(&self) -> &Arc<CacheAside> {
        &self.cache
    }

    pub fn reaper(&self) -> &Arc<Reaper> {
        &self.reaper
    }

    /// Start the consumer loops configured in `config.worker`.
    pub fn spawn_workers(&self) -> WorkerGroup {
        let w = &self.config.worker;
        WorkerGroup::spawn(
            w.concurrency,
            w.max_in_flight,
            WorkerContext {
                broker: self.broker.clone(),
                processor: self.processor.clone(),
                queue: w.queue.clone(),
                poll_timeout: w.poll_timeout(),
            },
            self.scheduler.clone(),
        )
    }

    /// Run the reaper until `cancel` fires. `None` when the reaper is disabled.
    pub fn spawn_reaper(&self, cancel: CancellationToken) -> Option<JoinHandle<()>> {
        if !self.config.reaper.enabled {
            return None;
        }
        let reaper = self.reaper.clone();
        let interval = self.config.reaper.interval();
        Some(tokio::spawn(async move { reaper.run(interval, cancel).await }))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{HandlerError, TaskRecord};
    use async_trait::async_trait;

    struct Noop;

    #[async_trait]
    impl TaskHandler for Noop {
        async fn handle(&self, _task: &TaskRecord) -> Result<String, HandlerError> {
            Ok(String::new())
        }
    }

    #[test]
    fn build_success() {
        let engine = EngineBuilder::new(FerryConfig::default())
            .register("email", Arc::new(Noop))
            .unwrap()
            .expect_kinds(&["email"])
            .build();
        assert!(engine.is_ok());
    }

    #[test]
    fn build_missing_kinds() {
        let engine = EngineBuilder::new(FerryConfig::default())
            .register("email", Arc::new(Noop))
            .unwrap()
            .expect_kinds(&["email", "data_sync"])
            .build();
        assert!(matches!(
            engine,
            Err(BuildError::MissingKinds(missing)) if missing == vec!["data_sync".to_string()]
        ));
    }

    #[test]
    fn duplicate_registration_fails() {
        let result = EngineBuilder::new(FerryConfig::default())
            .register("email", Arc::new(Noop))
            .unwrap()
            .register("email", Arc::new(Noop));
        assert!(matches!(result, Err(RegistryError::DuplicateHandler(_))));
    }

    #[test]
    fn invalid_config_fails_build() {
        let mut config = FerryConfig::default();
        config.worker.concurrency = 0;
        let engine = EngineBuilder::new(config).build();
        assert!(matches!(engine, Err(BuildError::Config(_))));
    }

    #[tokio::test]
    async fn disabled_reaper_is_not_spawned() {
        let mut config = FerryConfig::default();
        config.reaper.enabled = false;
        let engine = EngineBuilder::new(config).build().unwrap();
        assert!(engine.spawn_reaper(CancellationToken::new()).is_none());
    }
}
