//! Domain model: ids, task records, units, primitives, claims, events.

pub mod backoff;
pub mod derived;
pub mod errors;
pub mod events;
pub mod ids;
pub mod primitives;
pub mod state;
pub mod task;
pub mod unit;

pub use backoff::BackoffConfig;
pub use derived::{Claim, ClaimState, Entity, normalize_key};
pub use errors::{HandlerError, ModelError, StoreError};
pub use events::{EventData, EventName, PipelineEvent, TaskChange, TokenUsage, UnitSummary};
pub use ids::{
    ClaimId, EntityId, Id, IdMarker, MentionId, PropositionId, RelationId, SpanId, StanceId,
    TaskId, UnitId,
};
pub use primitives::{
    EntityMention, EntityType, Primitives, Proposition, Relation, Span, SpanKind, Stance,
    StanceKind, Temporality,
};
pub use state::TaskStatus;
pub use task::{Checkpoint, NewTask, Priority, TaskPatch, TaskRecord, TaskType, unit_id_of};
pub use unit::{ConversationalUnit, PipelineStage, resume_task};
