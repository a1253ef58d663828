//! In-process implementations of the ports.

pub mod memory_knowledge_store;
pub mod memory_task_store;
pub mod model;

pub use self::memory_knowledge_store::InMemoryKnowledgeStore;
pub use self::memory_task_store::InMemoryTaskStore;
pub use self::model::{RecordedCall, RuleBasedModelClient, ScriptedModelClient};
