//! Observer passes that run after claims are derived.

use async_trait::async_trait;
use chrono::{DateTime, Duration, Utc};
use tracing::debug;

use crate::domain::{ClaimState, ConversationalUnit, StoreError, normalize_key};
use crate::ports::KnowledgeStore;

#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct ObserverReport {
    pub superseded: usize,
    pub dormant: usize,
}

impl ObserverReport {
    pub fn add(&mut self, other: ObserverReport) {
        self.superseded += other.superseded;
        self.dormant += other.dormant;
    }
}

#[async_trait]
pub trait Observer: Send + Sync {
    fn name(&self) -> &'static str;

    async fn observe(
        &self,
        unit: &ConversationalUnit,
        store: &dyn KnowledgeStore,
        now: DateTime<Utc>,
    ) -> Result<ObserverReport, StoreError>;
}

/// A newer claim with the same subject and statement supersedes an older
/// active one. The older claim is kept and linked, never deleted.
pub struct SupersessionObserver;

#[async_trait]
impl Observer for SupersessionObserver {
    fn name(&self) -> &'static str {
        "supersession"
    }

    async fn observe(
        &self,
        unit: &ConversationalUnit,
        store: &dyn KnowledgeStore,
        _now: DateTime<Utc>,
    ) -> Result<ObserverReport, StoreError> {
        let fresh: Vec<_> = store
            .claims_for_unit(unit.id)
            .await?
            .into_iter()
            .filter(|c| c.unit_id == unit.id && c.state == ClaimState::Active)
            .collect();
        if fresh.is_empty() {
            return Ok(ObserverReport::default());
        }

        let mut report = ObserverReport::default();
        for mut old in store.active_claims().await? {
            if old.unit_id == unit.id {
                continue;
            }
            let key = (normalize_key(&old.subject), old.key());
            let newer = fresh.iter().find(|c| {
                (normalize_key(&c.subject), c.key()) == key && c.created_at >= old.created_at
            });
            if let Some(newer) = newer {
                debug!(old = %old.id, new = %newer.id, "claim superseded");
                old.state = ClaimState::Superseded;
                old.superseded_by = Some(newer.id);
                store.update_claim(old).await?;
                report.superseded += 1;
            }
        }
        Ok(report)
    }
}

/// Active claims not referenced within `window` become dormant.
pub struct DormancyObserver {
    pub window: Duration,
}

#[async_trait]
impl Observer for DormancyObserver {
    fn name(&self) -> &'static str {
        "dormancy"
    }

    async fn observe(
        &self,
        _unit: &ConversationalUnit,
        store: &dyn KnowledgeStore,
        now: DateTime<Utc>,
    ) -> Result<ObserverReport, StoreError> {
        let cutoff = now - self.window;
        let mut report = ObserverReport::default();
        for mut claim in store.active_claims().await? {
            if claim.last_referenced_at < cutoff {
                claim.state = ClaimState::Dormant;
                store.update_claim(claim).await?;
                report.dormant += 1;
            }
        }
        Ok(report)
    }
}
