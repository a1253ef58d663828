//! KnowledgeStore port: units, primitives, entities and claims.
//!
//! This is the persistence engine's artifact side. Handlers read and write it
//! through the task context; recovery probes it to find unfinished units.

use async_trait::async_trait;

use crate::domain::{
    Claim, ClaimId, ConversationalUnit, Entity, EntityId, PipelineStage, Primitives, Proposition,
    Span, StoreError, UnitId,
};

#[async_trait]
pub trait KnowledgeStore: Send + Sync {
    // units

    async fn put_unit(&self, unit: ConversationalUnit) -> Result<(), StoreError>;

    async fn get_unit(&self, id: UnitId) -> Result<Option<ConversationalUnit>, StoreError>;

    async fn unprocessed_units(&self) -> Result<Vec<ConversationalUnit>, StoreError>;

    /// Record the last completed stage of a unit.
    async fn set_unit_stage(&self, id: UnitId, stage: PipelineStage) -> Result<(), StoreError>;

    /// Flip `processed`. Returns false if it was already set.
    async fn mark_unit_processed(&self, id: UnitId) -> Result<bool, StoreError>;

    // layer 1

    async fn put_spans(&self, unit: UnitId, spans: Vec<Span>) -> Result<(), StoreError>;

    async fn spans_for_unit(&self, unit: UnitId) -> Result<Vec<Span>, StoreError>;

    /// Whether span computation ran for the unit (it may legitimately find none).
    async fn has_spans(&self, unit: UnitId) -> Result<bool, StoreError>;

    async fn put_primitives(&self, unit: UnitId, primitives: Primitives) -> Result<(), StoreError>;

    async fn primitives_for_unit(&self, unit: UnitId) -> Result<Option<Primitives>, StoreError>;

    async fn recent_propositions(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Proposition>, StoreError>;

    // layer 2

    async fn all_entities(&self) -> Result<Vec<Entity>, StoreError>;

    /// Insert or replace.
    async fn put_entity(&self, entity: Entity) -> Result<(), StoreError>;

    async fn delete_entity(&self, id: EntityId) -> Result<(), StoreError>;

    async fn put_claims(&self, claims: Vec<Claim>) -> Result<(), StoreError>;

    async fn update_claim(&self, claim: Claim) -> Result<(), StoreError>;

    async fn claims_for_unit(&self, unit: UnitId) -> Result<Vec<Claim>, StoreError>;

    async fn active_claims(&self) -> Result<Vec<Claim>, StoreError>;

    async fn recent_claims(&self, session_id: &str, limit: usize) -> Result<Vec<Claim>, StoreError>;

    async fn link_claim_to_unit(&self, claim: ClaimId, unit: UnitId) -> Result<(), StoreError>;

    /// Rolling summary of the session preceding the current unit, if any.
    async fn session_summary(&self, session_id: &str) -> Result<Option<String>, StoreError>;
}
