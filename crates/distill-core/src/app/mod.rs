//! App layer: the orchestrator and what it is built from.
//!
//! # Components
//! - **OrchestratorBuilder**: wiring and fail-fast startup checks
//! - **Orchestrator**: polling loop, execution, retries, recovery
//! - **EventBus**: in-process pub/sub between pipeline stages
//! - **wiring**: which event creates which task

pub mod builder;
pub mod config;
pub mod event_bus;
pub mod orchestrator;
pub mod recovery;
pub mod status;
pub mod wiring;

pub use self::builder::{BuildError, OrchestratorBuilder};
pub use self::config::{ConfigError, DistillConfig, OrchestratorConfig, PipelineConfig};
pub use self::event_bus::{EventBus, Subscription};
pub use self::orchestrator::Orchestrator;
pub use self::recovery::RecoveryReport;
pub use self::status::OrchestratorStatus;
