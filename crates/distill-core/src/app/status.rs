//! Status snapshot for operators.

use serde::Serialize;

/// Point-in-time view of the orchestrator.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct OrchestratorStatus {
    pub is_running: bool,
    /// Executions currently in flight in this process.
    pub active_tasks: usize,
    /// Tasks in `Pending`, due or not.
    pub pending_tasks: usize,
    pub failed_tasks: usize,
}

impl OrchestratorStatus {
    /// Nothing running and nothing waiting.
    pub fn is_idle(&self) -> bool {
        self.active_tasks == 0 && self.pending_tasks == 0
    }
}
