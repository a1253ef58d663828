//! Typed task API.
//!
//! - **Typed surface**: `TaskPayload`, `Handler<T>`; task type and payload
//!   shape are tied together at compile time.
//! - **Dyn layer**: `TaskHandler`, object-safe, what the registry stores.

pub mod handler;
pub mod registry;
pub mod task;

pub use self::handler::{Handler, TaskContext, TaskHandler, TypedHandler};
pub use self::registry::{HandlerRegistry, RegistryError};
pub use self::task::TaskPayload;
