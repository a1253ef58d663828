//! distill-core
//!
//! Turns conversational text into structured knowledge through a durable,
//! event-driven task pipeline.
//!
//! # Modules
//! - **domain**: tasks, units, primitives, claims, events, errors
//! - **ports**: TaskStore, KnowledgeStore, ModelClient, Clock
//! - **typed**: typed task API (`TaskPayload`, `Handler<T>`, `HandlerRegistry`)
//! - **app**: orchestrator, event bus, config, recovery
//! - **pipeline**: the four stage handlers and the logic behind them
//! - **impls**: in-memory stores and offline model clients

pub mod app;
pub mod domain;
pub mod error;
pub mod impls;
pub mod pipeline;
pub mod ports;
pub mod typed;

pub use self::app::{DistillConfig, Orchestrator, OrchestratorBuilder};
pub use self::error::OrchestratorError;
