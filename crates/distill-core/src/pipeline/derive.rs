use chrono::{DateTime, Utc};
use tracing::warn;

use super::dedup::dedup_claims;
use crate::domain::{Claim, ClaimId, ClaimState, ConversationalUnit, Primitives};

/// One claim per proposition that has a stance, deduplicated by statement.
pub fn derive_claims(unit: &ConversationalUnit, primitives: &Primitives, now: DateTime<Utc>) -> Vec<Claim> {
    let mut claims = Vec::with_capacity(primitives.propositions.len());
    for p in &primitives.propositions {
        let Some(stance) = primitives.stance_for(p.id) else {
            warn!(unit_id = %unit.id, proposition = %p.local_id, "proposition has no stance; no claim derived");
            continue;
        };
        let subject = if p.subject.is_empty() {
            unit.speaker.clone().unwrap_or_else(|| "unknown".to_string())
        } else {
            p.subject.clone()
        };
        claims.push(Claim {
            id: ClaimId::new(),
            unit_id: unit.id,
            session_id: unit.session_id.clone(),
            subject,
            statement: p.statement.clone(),
            stance: stance.kind,
            confidence: stance.confidence,
            temporality: p.temporality,
            state: ClaimState::Active,
            superseded_by: None,
            source_proposition: p.id,
            created_at: now,
            last_referenced_at: now,
        });
    }
    dedup_claims(claims)
}
