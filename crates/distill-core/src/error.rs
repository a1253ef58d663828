use thiserror::Error;

use crate::app::builder::BuildError;
use crate::app::config::ConfigError;
use crate::domain::StoreError;
use crate::typed::RegistryError;

/// Errors returned by the orchestrator's public operations.
#[derive(Debug, Error)]
pub enum OrchestratorError {
    #[error("store: {0}")]
    Store(#[from] StoreError),

    #[error("registry: {0}")]
    Registry(#[from] RegistryError),

    #[error("config: {0}")]
    Config(#[from] ConfigError),

    #[error("build: {0}")]
    Build(#[from] BuildError),

    #[error("{0}")]
    Other(String),
}
