//! In-memory knowledge store.

use std::cmp::Reverse;
use std::collections::{BTreeSet, HashMap};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

use async_trait::async_trait;
use tokio::sync::Mutex;

use crate::domain::{
    Claim, ClaimId, ClaimState, ConversationalUnit, Entity, EntityId, PipelineStage, Primitives,
    Proposition, Span, StoreError, UnitId,
};
use crate::ports::KnowledgeStore;

#[derive(Default)]
struct State {
    units: HashMap<UnitId, ConversationalUnit>,
    spans: HashMap<UnitId, Vec<Span>>,
    primitives: HashMap<UnitId, Primitives>,
    entities: HashMap<EntityId, Entity>,
    /// Insertion order is kept so listings are stable.
    claims: Vec<Claim>,
    claim_links: HashMap<UnitId, BTreeSet<ClaimId>>,
    summaries: HashMap<String, String>,
}

#[derive(Clone, Default)]
pub struct InMemoryKnowledgeStore {
    state: Arc<Mutex<State>>,
    reject_writes: Arc<AtomicBool>,
}

impl InMemoryKnowledgeStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Make every write fail with `StoreError::Rejected` until turned off.
    pub fn set_reject_writes(&self, reject: bool) {
        self.reject_writes.store(reject, Ordering::SeqCst);
    }

    pub async fn set_session_summary(&self, session_id: impl Into<String>, summary: impl Into<String>) {
        self.state
            .lock()
            .await
            .summaries
            .insert(session_id.into(), summary.into());
    }

    pub async fn all_claims(&self) -> Vec<Claim> {
        self.state.lock().await.claims.clone()
    }

    pub async fn all_units(&self) -> Vec<ConversationalUnit> {
        let mut units: Vec<ConversationalUnit> =
            self.state.lock().await.units.values().cloned().collect();
        units.sort_by_key(|u| (u.timestamp, u.id));
        units
    }

    fn check_writable(&self, what: &str) -> Result<(), StoreError> {
        if self.reject_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Rejected(what.to_string()));
        }
        Ok(())
    }
}

#[async_trait]
impl KnowledgeStore for InMemoryKnowledgeStore {
    async fn put_unit(&self, unit: ConversationalUnit) -> Result<(), StoreError> {
        self.check_writable("put_unit")?;
        self.state.lock().await.units.insert(unit.id, unit);
        Ok(())
    }

    async fn get_unit(&self, id: UnitId) -> Result<Option<ConversationalUnit>, StoreError> {
        Ok(self.state.lock().await.units.get(&id).cloned())
    }

    async fn unprocessed_units(&self) -> Result<Vec<ConversationalUnit>, StoreError> {
        let mut units: Vec<ConversationalUnit> = self
            .state
            .lock()
            .await
            .units
            .values()
            .filter(|u| !u.processed)
            .cloned()
            .collect();
        units.sort_by_key(|u| (u.timestamp, u.id));
        Ok(units)
    }

    async fn set_unit_stage(&self, id: UnitId, stage: PipelineStage) -> Result<(), StoreError> {
        self.check_writable("set_unit_stage")?;
        let mut state = self.state.lock().await;
        let unit = state
            .units
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        // Re-running an earlier stage must not move the marker backwards.
        unit.stage = Some(unit.stage.map_or(stage, |s| s.max(stage)));
        Ok(())
    }

    async fn mark_unit_processed(&self, id: UnitId) -> Result<bool, StoreError> {
        self.check_writable("mark_unit_processed")?;
        let mut state = self.state.lock().await;
        let unit = state
            .units
            .get_mut(&id)
            .ok_or_else(|| StoreError::NotFound(id.to_string()))?;
        if unit.processed {
            return Ok(false);
        }
        unit.processed = true;
        Ok(true)
    }

    async fn put_spans(&self, unit: UnitId, spans: Vec<Span>) -> Result<(), StoreError> {
        self.check_writable("put_spans")?;
        self.state.lock().await.spans.insert(unit, spans);
        Ok(())
    }

    async fn spans_for_unit(&self, unit: UnitId) -> Result<Vec<Span>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .spans
            .get(&unit)
            .cloned()
            .unwrap_or_default())
    }

    async fn has_spans(&self, unit: UnitId) -> Result<bool, StoreError> {
        Ok(self.state.lock().await.spans.contains_key(&unit))
    }

    async fn put_primitives(&self, unit: UnitId, primitives: Primitives) -> Result<(), StoreError> {
        self.check_writable("put_primitives")?;
        self.state.lock().await.primitives.insert(unit, primitives);
        Ok(())
    }

    async fn primitives_for_unit(&self, unit: UnitId) -> Result<Option<Primitives>, StoreError> {
        Ok(self.state.lock().await.primitives.get(&unit).cloned())
    }

    async fn recent_propositions(
        &self,
        session_id: &str,
        limit: usize,
    ) -> Result<Vec<Proposition>, StoreError> {
        let state = self.state.lock().await;
        let mut units: Vec<&ConversationalUnit> = state
            .units
            .values()
            .filter(|u| u.session_id == session_id)
            .collect();
        units.sort_by_key(|u| Reverse((u.timestamp, u.id)));
        Ok(units
            .into_iter()
            .filter_map(|u| state.primitives.get(&u.id))
            .flat_map(|p| p.propositions.iter().rev().cloned())
            .take(limit)
            .collect())
    }

    async fn all_entities(&self) -> Result<Vec<Entity>, StoreError> {
        let mut entities: Vec<Entity> = self.state.lock().await.entities.values().cloned().collect();
        entities.sort_by_key(|e| (e.first_seen_at, e.id));
        Ok(entities)
    }

    async fn put_entity(&self, entity: Entity) -> Result<(), StoreError> {
        self.check_writable("put_entity")?;
        self.state.lock().await.entities.insert(entity.id, entity);
        Ok(())
    }

    async fn delete_entity(&self, id: EntityId) -> Result<(), StoreError> {
        self.check_writable("delete_entity")?;
        self.state
            .lock()
            .await
            .entities
            .remove(&id)
            .map(|_| ())
            .ok_or_else(|| StoreError::NotFound(id.to_string()))
    }

    async fn put_claims(&self, claims: Vec<Claim>) -> Result<(), StoreError> {
        self.check_writable("put_claims")?;
        let mut state = self.state.lock().await;
        for claim in claims {
            match state.claims.iter_mut().find(|c| c.id == claim.id) {
                Some(existing) => *existing = claim,
                None => state.claims.push(claim),
            }
        }
        Ok(())
    }

    async fn update_claim(&self, claim: Claim) -> Result<(), StoreError> {
        self.check_writable("update_claim")?;
        let mut state = self.state.lock().await;
        let existing = state
            .claims
            .iter_mut()
            .find(|c| c.id == claim.id)
            .ok_or_else(|| StoreError::NotFound(claim.id.to_string()))?;
        *existing = claim;
        Ok(())
    }

    async fn claims_for_unit(&self, unit: UnitId) -> Result<Vec<Claim>, StoreError> {
        let state = self.state.lock().await;
        let linked = state.claim_links.get(&unit);
        Ok(state
            .claims
            .iter()
            .filter(|c| c.unit_id == unit || linked.is_some_and(|l| l.contains(&c.id)))
            .cloned()
            .collect())
    }

    async fn active_claims(&self) -> Result<Vec<Claim>, StoreError> {
        Ok(self
            .state
            .lock()
            .await
            .claims
            .iter()
            .filter(|c| c.state == ClaimState::Active)
            .cloned()
            .collect())
    }

    async fn recent_claims(&self, session_id: &str, limit: usize) -> Result<Vec<Claim>, StoreError> {
        let mut claims: Vec<Claim> = self
            .state
            .lock()
            .await
            .claims
            .iter()
            .filter(|c| c.session_id == session_id && c.state == ClaimState::Active)
            .cloned()
            .collect();
        claims.sort_by_key(|c| Reverse((c.created_at, c.id)));
        claims.truncate(limit);
        Ok(claims)
    }

    async fn link_claim_to_unit(&self, claim: ClaimId, unit: UnitId) -> Result<(), StoreError> {
        self.check_writable("link_claim_to_unit")?;
        self.state
            .lock()
            .await
            .claim_links
            .entry(unit)
            .or_default()
            .insert(claim);
        Ok(())
    }

    async fn session_summary(&self, session_id: &str) -> Result<Option<String>, StoreError> {
        Ok(self.state.lock().await.summaries.get(session_id).cloned())
    }
}
