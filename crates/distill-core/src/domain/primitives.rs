//! Layer 1 primitives, produced per unit and immutable once stored.

use serde::{Deserialize, Serialize};

use super::ids::{MentionId, PropositionId, RelationId, SpanId, StanceId, UnitId};

/// Kind of a deterministic pattern match.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SpanKind {
    Deadline,
    Commitment,
    Question,
    Negation,
    Temporal,
    Money,
    Emotion,
    Uncertainty,
}

/// Character range matched by a pattern rule. `start`/`end` count chars, not bytes.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Span {
    pub id: SpanId,
    pub unit_id: UnitId,
    pub kind: SpanKind,
    pub start: usize,
    pub end: usize,
    pub text: String,
}

/// How a statement relates to time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Temporality {
    Timeless,
    #[default]
    Current,
    Past,
    Future,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Proposition {
    pub id: PropositionId,
    pub unit_id: UnitId,
    /// Key the model used to refer to this proposition inside one extraction.
    pub local_id: String,
    pub subject: String,
    pub statement: String,
    #[serde(default)]
    pub temporality: Temporality,
}

/// Epistemic/affective posture of the speaker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum StanceKind {
    Assertion,
    Belief,
    Commitment,
    Desire,
    Doubt,
    Preference,
    Question,
    Emotion,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Stance {
    pub id: StanceId,
    pub unit_id: UnitId,
    pub proposition_id: PropositionId,
    pub kind: StanceKind,
    pub confidence: f32,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relation {
    pub id: RelationId,
    pub unit_id: UnitId,
    pub from: PropositionId,
    pub to: PropositionId,
    pub kind: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntityType {
    Person,
    Organization,
    Place,
    Project,
    Artifact,
    Event,
    #[default]
    #[serde(other)]
    Other,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityMention {
    pub id: MentionId,
    pub unit_id: UnitId,
    pub text: String,
    pub entity_type: EntityType,
}

/// Everything one extraction call produced for a unit.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct Primitives {
    pub propositions: Vec<Proposition>,
    pub stances: Vec<Stance>,
    pub relations: Vec<Relation>,
    pub mentions: Vec<EntityMention>,
}

impl Primitives {
    pub fn is_empty(&self) -> bool {
        self.propositions.is_empty()
            && self.stances.is_empty()
            && self.relations.is_empty()
            && self.mentions.is_empty()
    }

    /// First stance attached to `proposition`.
    pub fn stance_for(&self, proposition: PropositionId) -> Option<&Stance> {
        self.stances.iter().find(|s| s.proposition_id == proposition)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unknown_entity_type_falls_back_to_other() {
        let t: EntityType = serde_json::from_str("\"spaceship\"").unwrap();
        assert_eq!(t, EntityType::Other);
        let t: EntityType = serde_json::from_str("\"person\"").unwrap();
        assert_eq!(t, EntityType::Person);
    }

    #[test]
    fn stance_lookup_by_proposition() {
        let unit = UnitId::new();
        let p = PropositionId::new();
        let prims = Primitives {
            stances: vec![Stance {
                id: StanceId::new(),
                unit_id: unit,
                proposition_id: p,
                kind: StanceKind::Commitment,
                confidence: 0.8,
            }],
            ..Primitives::default()
        };
        assert_eq!(prims.stance_for(p).map(|s| s.kind), Some(StanceKind::Commitment));
        assert!(prims.stance_for(PropositionId::new()).is_none());
        assert!(!prims.is_empty());
    }
}
