//! HandlerRegistry - Handler の登録と管理
//!
//! `TaskType` ごとに Handler を 1 つだけ持ちます。型付きの `Handler<T>` は
//! 登録時に `TypedHandler` で包まれ、`Arc<dyn TaskHandler>` として格納されます。
//! Orchestrator はポーリング時にこのレジストリを見て、Handler が登録済みの
//! タスクだけを取り出します。

use std::collections::HashMap;
use std::sync::Arc;

use super::handler::{Handler, TaskHandler, TypedHandler};
use super::task::TaskPayload;
use crate::domain::TaskType;

#[derive(Debug, thiserror::Error)]
pub enum RegistryError {
    #[error("handler for task type '{0}' is already registered")]
    AlreadyRegistered(TaskType),
}

/// HandlerRegistry は型付き Handler を登録・管理
///
/// # 使用例
/// ```ignore
/// let mut registry = HandlerRegistry::new();
/// registry.register::<PreprocessTask, _>(PreprocessHandler::new()?)?;
///
/// // 同じ TaskType の二重登録はエラー
/// assert!(registry.register::<PreprocessTask, _>(PreprocessHandler::new()?).is_err());
///
/// let handler = registry.get(TaskType::Preprocess);
/// ```
///
/// # 内部実装
/// - `HashMap<TaskType, Arc<dyn TaskHandler>>` で管理
/// - `register_dyn` は型消去済みの Handler をそのまま受け取る
/// - `Clone` は Arc の複製なので安価
#[derive(Default, Clone)]
pub struct HandlerRegistry {
    handlers: HashMap<TaskType, Arc<dyn TaskHandler>>,
}

impl HandlerRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a typed handler; it is wrapped in `TypedHandler`.
    pub fn register<T: TaskPayload, H: Handler<T> + 'static>(
        &mut self,
        handler: H,
    ) -> Result<(), RegistryError> {
        self.register_dyn(Arc::new(TypedHandler::<T, H>::new(handler)))
    }

    /// Register an already type-erased handler.
    pub fn register_dyn(&mut self, handler: Arc<dyn TaskHandler>) -> Result<(), RegistryError> {
        let task_type = handler.task_type();
        if self.handlers.contains_key(&task_type) {
            return Err(RegistryError::AlreadyRegistered(task_type));
        }
        self.handlers.insert(task_type, handler);
        Ok(())
    }

    pub fn get(&self, task_type: TaskType) -> Option<Arc<dyn TaskHandler>> {
        self.handlers.get(&task_type).cloned()
    }

    pub fn contains(&self, task_type: TaskType) -> bool {
        self.handlers.contains_key(&task_type)
    }

    /// Registered types, in pipeline order.
    pub fn registered_types(&self) -> Vec<TaskType> {
        let mut types: Vec<TaskType> = self.handlers.keys().copied().collect();
        types.sort();
        types
    }

    pub fn is_empty(&self) -> bool {
        self.handlers.is_empty()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::tests::{EchoHandler, EchoTask};

    #[test]
    fn register_and_get() {
        let mut registry = HandlerRegistry::new();
        registry.register::<EchoTask, _>(EchoHandler).unwrap();
        assert!(registry.get(EchoTask::TYPE).is_some());
        assert!(registry.contains(TaskType::Preprocess));
        assert!(registry.get(TaskType::Extract).is_none());
    }

    #[test]
    fn double_registration_is_rejected() {
        let mut registry = HandlerRegistry::new();
        registry.register::<EchoTask, _>(EchoHandler).unwrap();
        let result = registry.register::<EchoTask, _>(EchoHandler);
        assert!(matches!(
            result,
            Err(RegistryError::AlreadyRegistered(TaskType::Preprocess))
        ));
    }

    #[test]
    fn registered_types_lists_what_was_registered() {
        let mut registry = HandlerRegistry::new();
        assert!(registry.is_empty());
        registry.register::<EchoTask, _>(EchoHandler).unwrap();
        assert_eq!(registry.registered_types(), vec![TaskType::Preprocess]);
    }
}
