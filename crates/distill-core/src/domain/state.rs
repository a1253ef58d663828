//! Task state machine.

use serde::{Deserialize, Serialize};
use std::fmt;

/// Task status.
///
/// State transitions:
/// - Pending -> Processing -> Completed
/// - Pending -> Processing -> Pending (retry, bounded by max_attempts)
/// - Pending -> Processing -> Failed (max_attempts reached)
/// - Processing -> Pending (stale-task recovery after a crash)
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TaskStatus {
    /// Waiting to be picked up (possibly deferred by execute_at / next_retry_at).
    Pending,

    /// Currently executing in this (or a dead) process.
    Processing,

    /// Finished successfully.
    Completed,

    /// Failed permanently (max_attempts exhausted).
    Failed,
}

impl TaskStatus {
    /// Is this a terminal state (no further transitions)?
    pub fn is_terminal(self) -> bool {
        matches!(self, TaskStatus::Completed | TaskStatus::Failed)
    }

    /// Is the transition `self -> next` allowed?
    pub fn can_transition_to(self, next: TaskStatus) -> bool {
        use TaskStatus::*;
        matches!(
            (self, next),
            (Pending, Processing)
                | (Processing, Completed)
                | (Processing, Pending)
                | (Processing, Failed)
        )
    }

    pub fn as_str(self) -> &'static str {
        match self {
            TaskStatus::Pending => "pending",
            TaskStatus::Processing => "processing",
            TaskStatus::Completed => "completed",
            TaskStatus::Failed => "failed",
        }
    }
}

impl fmt::Display for TaskStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
