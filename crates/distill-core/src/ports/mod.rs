//! Ports: the contracts external collaborators implement.
//!
//! The orchestrator and handlers depend only on these traits; `impls`
//! provides in-memory versions for development and tests.

pub mod clock;
pub mod knowledge_store;
pub mod model_client;
pub mod task_store;

pub use self::clock::{Clock, ManualClock, SystemClock};
pub use self::knowledge_store::KnowledgeStore;
pub use self::model_client::{CallOptions, ModelClient, ModelResponse, Tier};
pub use self::task_store::TaskStore;
