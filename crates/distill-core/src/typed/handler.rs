//! Handler traits and the execution context handed to them.
//!
//! Two layers, as with any registry of heterogeneous handlers:
//! - `Handler<T>` is what stage code implements; it only ever sees `T`.
//! - `TaskHandler` is object-safe and works on raw JSON so the registry can
//!   hold `Arc<dyn TaskHandler>`. `TypedHandler<T, H>` bridges the two.

use std::marker::PhantomData;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::task::TaskPayload;
use crate::app::event_bus::EventBus;
use crate::domain::{Checkpoint, HandlerError, PipelineEvent, TaskId, TaskPatch, TaskType};
use crate::ports::{Clock, KnowledgeStore, TaskStore};

/// Everything a handler may touch while executing one task.
pub struct TaskContext {
    task_id: TaskId,
    task_type: TaskType,
    attempt: u32,
    checkpoint: Option<Checkpoint>,
    tasks: Arc<dyn TaskStore>,
    knowledge: Arc<dyn KnowledgeStore>,
    bus: EventBus,
    clock: Arc<dyn Clock>,
}

impl TaskContext {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        task_id: TaskId,
        task_type: TaskType,
        attempt: u32,
        checkpoint: Option<Checkpoint>,
        tasks: Arc<dyn TaskStore>,
        knowledge: Arc<dyn KnowledgeStore>,
        bus: EventBus,
        clock: Arc<dyn Clock>,
    ) -> Self {
        Self {
            task_id,
            task_type,
            attempt,
            checkpoint,
            tasks,
            knowledge,
            bus,
            clock,
        }
    }

    pub fn task_id(&self) -> TaskId {
        self.task_id
    }

    pub fn task_type(&self) -> TaskType {
        self.task_type
    }

    /// 1 on the first execution.
    pub fn attempt(&self) -> u32 {
        self.attempt
    }

    /// Progress recorded by an earlier, interrupted execution (or by this one).
    pub fn previous_checkpoint(&self) -> Option<&Checkpoint> {
        self.checkpoint.as_ref()
    }

    pub fn knowledge(&self) -> &dyn KnowledgeStore {
        self.knowledge.as_ref()
    }

    pub fn bus(&self) -> &EventBus {
        &self.bus
    }

    pub fn now(&self) -> DateTime<Utc> {
        self.clock.now()
    }

    pub fn emit(&self, event: PipelineEvent) -> usize {
        self.bus.emit(event)
    }

    /// Persist progress so a re-execution can skip finished steps.
    pub async fn checkpoint(
        &mut self,
        step: &str,
        data: serde_json::Value,
    ) -> Result<(), HandlerError> {
        let next = Checkpoint::advance(self.checkpoint.as_ref(), step, data);
        self.tasks
            .update(self.task_id, TaskPatch::checkpoint(next.clone()))
            .await?;
        self.checkpoint = Some(next);
        Ok(())
    }
}

/// Executes one kind of task.
///
/// ```ignore
/// struct ExtractHandler { model: Arc<dyn ModelClient> }
///
/// #[async_trait]
/// impl Handler<ExtractTask> for ExtractHandler {
///     async fn handle(&self, task: ExtractTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
///         /* ... */
///         Ok(())
///     }
/// }
/// ```
///
/// `Handler<ExtractTask>` can only ever be given an `ExtractTask`; the pairing
/// of task type and handler is checked at compile time.
#[async_trait]
pub trait Handler<T: TaskPayload>: Send + Sync {
    async fn handle(&self, task: T, ctx: &mut TaskContext) -> Result<(), HandlerError>;
}

/// Object-safe handler, keyed by task type in the registry.
#[async_trait]
pub trait TaskHandler: Send + Sync {
    fn task_type(&self) -> TaskType;

    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &mut TaskContext,
    ) -> Result<(), HandlerError>;
}

/// Type erasure: `Handler<T>` -> `TaskHandler`.
pub struct TypedHandler<T: TaskPayload, H: Handler<T>> {
    handler: H,
    _marker: PhantomData<fn() -> T>,
}

impl<T: TaskPayload, H: Handler<T>> TypedHandler<T, H> {
    pub fn new(handler: H) -> Self {
        Self {
            handler,
            _marker: PhantomData,
        }
    }
}

#[async_trait]
impl<T: TaskPayload, H: Handler<T>> TaskHandler for TypedHandler<T, H> {
    fn task_type(&self) -> TaskType {
        T::TYPE
    }

    async fn execute(
        &self,
        payload: serde_json::Value,
        ctx: &mut TaskContext,
    ) -> Result<(), HandlerError> {
        let task: T =
            serde_json::from_value(payload).map_err(|e| HandlerError::InvalidPayload {
                task_id: ctx.task_id(),
                reason: e.to_string(),
            })?;
        self.handler.handle(task, ctx).await
    }
}

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::domain::{BackoffConfig, NewTask, UnitId};
    use crate::impls::{InMemoryKnowledgeStore, InMemoryTaskStore};
    use crate::ports::SystemClock;
    use serde::{Deserialize, Serialize};
    use serde_json::json;

    #[derive(Debug, Clone, Serialize, Deserialize)]
    pub(crate) struct EchoTask {
        pub unit_id: UnitId,
    }

    impl TaskPayload for EchoTask {
        const TYPE: TaskType = TaskType::Preprocess;
    }

    pub(crate) struct EchoHandler;

    #[async_trait]
    impl Handler<EchoTask> for EchoHandler {
        async fn handle(&self, _task: EchoTask, ctx: &mut TaskContext) -> Result<(), HandlerError> {
            ctx.checkpoint("echoed", json!({ "attempt": ctx.attempt() })).await
        }
    }

    async fn context(tasks: Arc<InMemoryTaskStore>) -> TaskContext {
        let record = NewTask::new(TaskType::Preprocess, json!({}))
            .into_record(TaskId::new(), Utc::now(), 3, &BackoffConfig::default());
        let id = tasks.create(record).await.unwrap();
        TaskContext::new(
            id,
            TaskType::Preprocess,
            1,
            None,
            tasks,
            Arc::new(InMemoryKnowledgeStore::new()),
            EventBus::new(),
            Arc::new(SystemClock),
        )
    }

    #[tokio::test]
    async fn typed_handler_decodes_payload_and_checkpoints() {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let mut ctx = context(Arc::clone(&tasks)).await;
        let handler = TypedHandler::<EchoTask, _>::new(EchoHandler);
        assert_eq!(handler.task_type(), TaskType::Preprocess);

        let payload = EchoTask { unit_id: UnitId::new() }.to_payload().unwrap();
        handler.execute(payload, &mut ctx).await.unwrap();

        let stored = tasks.get_by_id(ctx.task_id()).await.unwrap().unwrap();
        let cp = stored.checkpoint.unwrap();
        assert_eq!(cp.step, "echoed");
        assert_eq!(cp.data["attempt"], 1);
        assert_eq!(ctx.previous_checkpoint().map(|c| c.step.as_str()), Some("echoed"));
    }

    #[tokio::test]
    async fn bad_payload_is_invalid_payload_error() {
        let tasks = Arc::new(InMemoryTaskStore::new());
        let mut ctx = context(tasks).await;
        let handler = TypedHandler::<EchoTask, _>::new(EchoHandler);
        let err = handler
            .execute(json!({ "unit_id": 42 }), &mut ctx)
            .await
            .unwrap_err();
        assert!(matches!(err, HandlerError::InvalidPayload { .. }));
    }
}
