//! Pipeline events published on the event bus.

use std::fmt;

use serde::{Deserialize, Serialize};

use super::ids::UnitId;
use super::task::TaskType;

/// Event names, used as subscription keys.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventName {
    UnitCreated,
    SpansComputed,
    PrimitivesExtracted,
    ClaimsDerived,
    UnitCompleted,
}

impl EventName {
    pub fn as_str(self) -> &'static str {
        match self {
            EventName::UnitCreated => "unit_created",
            EventName::SpansComputed => "spans_computed",
            EventName::PrimitivesExtracted => "primitives_extracted",
            EventName::ClaimsDerived => "claims_derived",
            EventName::UnitCompleted => "unit_completed",
        }
    }
}

impl fmt::Display for EventName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Token accounting reported by the model client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct TokenUsage {
    pub prompt: u32,
    pub completion: u32,
    pub total: u32,
}

impl TokenUsage {
    pub fn add(&mut self, other: TokenUsage) {
        self.prompt += other.prompt;
        self.completion += other.completion;
        self.total += other.total;
    }
}

/// Aggregate counts carried by the terminal event.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct UnitSummary {
    pub spans: usize,
    pub propositions: usize,
    pub stances: usize,
    pub relations: usize,
    pub mentions: usize,
    pub entities_created: usize,
    pub entities_merged: usize,
    pub claims: usize,
    pub claims_superseded: usize,
    pub claims_dormant: usize,
}

/// Stage-specific event data.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EventData {
    UnitCreated,
    SpansComputed {
        spans: usize,
    },
    PrimitivesExtracted {
        propositions: usize,
        stances: usize,
        relations: usize,
        mentions: usize,
        tokens: TokenUsage,
        elapsed_ms: u64,
    },
    ClaimsDerived {
        claims: usize,
        entities_created: usize,
        entities_merged: usize,
    },
    UnitCompleted {
        summary: UnitSummary,
        /// Time from unit creation to completion.
        elapsed_ms: u64,
    },
}

/// An event about one unit.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PipelineEvent {
    pub unit_id: UnitId,
    pub session_id: String,
    pub data: EventData,
}

impl PipelineEvent {
    pub fn new(unit_id: UnitId, session_id: impl Into<String>, data: EventData) -> Self {
        Self {
            unit_id,
            session_id: session_id.into(),
            data,
        }
    }

    pub fn unit_created(unit_id: UnitId, session_id: impl Into<String>) -> Self {
        Self::new(unit_id, session_id, EventData::UnitCreated)
    }

    pub fn name(&self) -> EventName {
        match self.data {
            EventData::UnitCreated => EventName::UnitCreated,
            EventData::SpansComputed { .. } => EventName::SpansComputed,
            EventData::PrimitivesExtracted { .. } => EventName::PrimitivesExtracted,
            EventData::ClaimsDerived { .. } => EventName::ClaimsDerived,
            EventData::UnitCompleted { .. } => EventName::UnitCompleted,
        }
    }

    /// Payload for the task this event triggers. The event data rides along
    /// as `trigger` so downstream stages can report upstream counts.
    pub fn task_payload(&self) -> serde_json::Value {
        serde_json::json!({
            "unit_id": self.unit_id,
            "session_id": self.session_id,
            "trigger": self.data,
        })
    }
}

/// Task-level change notification for live dashboards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskChange {
    pub task_id: super::ids::TaskId,
    pub task_type: TaskType,
    pub status: super::state::TaskStatus,
    pub attempts: u32,
}
