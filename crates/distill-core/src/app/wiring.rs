//! Fixed event -> task wiring of the pipeline.

use crate::domain::{EventName, Priority, TaskType};

/// `(event, task it creates, priority)`. `UnitCompleted` is terminal and
/// creates nothing.
pub const WIRING: [(EventName, TaskType, Priority); 4] = [
    (EventName::UnitCreated, TaskType::Preprocess, Priority::High),
    (EventName::SpansComputed, TaskType::Extract, Priority::Normal),
    (EventName::PrimitivesExtracted, TaskType::ResolveAndDerive, Priority::Normal),
    (EventName::ClaimsDerived, TaskType::RunObservers, Priority::Low),
];

/// Task created in response to `event`, if any.
pub fn downstream(event: EventName) -> Option<(TaskType, Priority)> {
    WIRING
        .iter()
        .find(|(e, _, _)| *e == event)
        .map(|(_, t, p)| (*t, *p))
}

/// Priority a task of `task_type` gets when the wiring creates it.
pub fn priority_for(task_type: TaskType) -> Priority {
    WIRING
        .iter()
        .find(|(_, t, _)| *t == task_type)
        .map(|(_, _, p)| *p)
        .unwrap_or_default()
}
