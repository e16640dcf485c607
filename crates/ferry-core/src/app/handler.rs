//! TaskHandler / HandlerRegistry - kind ごとの処理の登録と解決
//!
//! # 設計
//! - 初期化時に組み立て（mutable）、実行時は読み取りのみ（immutable）
//! - 二重登録はエラー
//! - 未登録の kind は fallback handler に回す（あれば）

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::domain::{HandlerError, TaskKind, TaskRecord};

/// A handler for one task kind.
///
/// Returns the result string stored on success. `HandlerError::Transient`
/// feeds the retry policy; `HandlerError::Permanent` fails the task at once.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    async fn handle(&self, task: &TaskRecord) -> Result<String, HandlerError>;
}

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("a handler for task kind '{0}' is already registered")]
    DuplicateHandler(TaskKind),
}

#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskKind, Arc<dyn TaskHandler>>,
    fallback: Option<Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(
        &mut self,
        kind: TaskKind,
        handler: Arc<dyn TaskHandler>,
    ) -> Result<(), RegistryError> {
        if self.handlers.contains_key(&kind) {
            return Err(RegistryError::DuplicateHandler(kind));
        }
        self.handlers.insert(kind, handler);
        Ok(())
    }

    /// Handler used for kinds with no registration. Replaces any previous one.
    pub fn set_fallback(&mut self, handler: Arc<dyn TaskHandler>) {
        self.fallback = Some(handler);
    }

    pub fn get(&self, kind: &TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(kind)
    }

    /// The registered handler for `kind`, else the fallback.
    pub fn resolve(&self, kind: &TaskKind) -> Option<&Arc<dyn TaskHandler>> {
        self.handlers.get(kind).or(self.fallback.as_ref())
    }

    pub fn has_fallback(&self) -> bool {
        self.fallback.is_some()
    }

    pub fn kinds(&self) -> Vec<TaskKind> {
        self.handlers.keys().cloned().collect()
    }

    pub fn len(&self) -> usize {
        self.handlers.len()
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}
