//! OrchestratorBuilder - wiring of stores, bus, clock and handlers
//!
//! Startup validation is fail-fast: a config that does not validate, or an
//! expected task type with no handler, is reported by `build()` rather than
//! discovered later as tasks that never run.

use std::sync::Arc;

use super::config::{ConfigError, OrchestratorConfig};
use super::event_bus::EventBus;
use super::orchestrator::Orchestrator;
use crate::domain::TaskType;
use crate::impls::{InMemoryKnowledgeStore, InMemoryTaskStore};
use crate::ports::{Clock, KnowledgeStore, SystemClock, TaskStore};
use crate::typed::{Handler, HandlerRegistry, RegistryError, TaskHandler, TaskPayload};

/// ```ignore
/// let orchestrator = OrchestratorBuilder::new()
///     .config(config.orchestrator)
///     .task_store(tasks)
///     .knowledge_store(knowledge)
///     .handlers(stage_handlers(model, &config.pipeline)?)?
///     .expect_tasks(&TaskType::ALL)
///     .build()?;
/// ```
///
/// Stores default to the in-memory implementations and the clock to
/// `SystemClock`.
pub struct OrchestratorBuilder {
    config: OrchestratorConfig,
    tasks: Option<Arc<dyn TaskStore>>,
    knowledge: Option<Arc<dyn KnowledgeStore>>,
    bus: Option<EventBus>,
    clock: Option<Arc<dyn Clock>>,
    registry: HandlerRegistry,
    expected_tasks: Option<Vec<TaskType>>,
}

#[derive(Debug, thiserror::Error)]
pub enum BuildError {
    #[error("missing task types: {0:?}; these tasks were expected but have no handler")]
    MissingTaskTypes(Vec<TaskType>),

    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl OrchestratorBuilder {
    pub fn new() -> Self {
        Self {
            config: OrchestratorConfig::default(),
            tasks: None,
            knowledge: None,
            bus: None,
            clock: None,
            registry: HandlerRegistry::new(),
            expected_tasks: None,
        }
    }

    pub fn config(mut self, config: OrchestratorConfig) -> Self {
        self.config = config;
        self
    }

    pub fn task_store(mut self, tasks: Arc<dyn TaskStore>) -> Self {
        self.tasks = Some(tasks);
        self
    }

    pub fn knowledge_store(mut self, knowledge: Arc<dyn KnowledgeStore>) -> Self {
        self.knowledge = Some(knowledge);
        self
    }

    pub fn event_bus(mut self, bus: EventBus) -> Self {
        self.bus = Some(bus);
        self
    }

    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    pub fn register<T: TaskPayload, H: Handler<T> + 'static>(
        mut self,
        handler: H,
    ) -> Result<Self, RegistryError> {
        self.registry.register::<T, H>(handler)?;
        Ok(self)
    }

    pub fn register_dyn(mut self, handler: Arc<dyn TaskHandler>) -> Result<Self, RegistryError> {
        self.registry.register_dyn(handler)?;
        Ok(self)
    }

    pub fn handlers(
        mut self,
        handlers: impl IntoIterator<Item = Arc<dyn TaskHandler>>,
    ) -> Result<Self, RegistryError> {
        for handler in handlers {
            self.registry.register_dyn(handler)?;
        }
        Ok(self)
    }

    /// Task types that must have a handler when `build()` runs.
    pub fn expect_tasks(mut self, task_types: &[TaskType]) -> Self {
        self.expected_tasks = Some(task_types.to_vec());
        self
    }

    pub fn build(self) -> Result<Orchestrator, BuildError> {
        self.config.validate()?;
        if let Some(expected) = &self.expected_tasks {
            let missing: Vec<TaskType> = expected
                .iter()
                .filter(|t| !self.registry.contains(**t))
                .copied()
                .collect();
            if !missing.is_empty() {
                return Err(BuildError::MissingTaskTypes(missing));
            }
        }
        Ok(Orchestrator::from_parts(
            self.config,
            self.tasks
                .unwrap_or_else(|| Arc::new(InMemoryTaskStore::new())),
            self.knowledge
                .unwrap_or_else(|| Arc::new(InMemoryKnowledgeStore::new())),
            self.bus.unwrap_or_default(),
            self.clock.unwrap_or_else(|| Arc::new(SystemClock)),
            self.registry,
        ))
    }
}

impl Default for OrchestratorBuilder {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::typed::handler::tests::{EchoHandler, EchoTask};

    #[test]
    fn build_success() {
        let orch = OrchestratorBuilder::new()
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .expect_tasks(&[EchoTask::TYPE])
            .build();
        assert!(orch.is_ok());
    }

    #[test]
    fn build_missing_task_types() {
        let orch = OrchestratorBuilder::new()
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .expect_tasks(&[EchoTask::TYPE, TaskType::Extract])
            .build();
        assert!(matches!(
            orch,
            Err(BuildError::MissingTaskTypes(missing)) if missing == vec![TaskType::Extract]
        ));
    }

    #[test]
    fn build_no_expect_tasks() {
        assert!(OrchestratorBuilder::new().build().is_ok());
    }

    #[test]
    fn build_rejects_invalid_config() {
        let orch = OrchestratorBuilder::new()
            .config(OrchestratorConfig {
                max_concurrent: 0,
                ..OrchestratorConfig::default()
            })
            .build();
        assert!(matches!(orch, Err(BuildError::Config(ConfigError::Invalid(_)))));
    }

    #[test]
    fn duplicate_handler_is_rejected() {
        let result = OrchestratorBuilder::new()
            .register::<EchoTask, _>(EchoHandler)
            .unwrap()
            .register::<EchoTask, _>(EchoHandler);
        assert!(matches!(
            result,
            Err(RegistryError::AlreadyRegistered(TaskType::Preprocess))
        ));
    }
}
