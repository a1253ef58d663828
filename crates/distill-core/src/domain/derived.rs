//! Layer 2 objects derived from primitives.

use std::collections::BTreeSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::ids::{ClaimId, EntityId, PropositionId, UnitId};
use super::primitives::{EntityType, StanceKind, Temporality};

/// Canonical referent resolved from one or more mentions.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub canonical_name: String,
    pub entity_type: EntityType,
    pub aliases: BTreeSet<String>,
    pub mention_count: u32,
    pub first_seen_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
}

impl Entity {
    pub fn new(canonical_name: impl Into<String>, entity_type: EntityType, now: DateTime<Utc>) -> Self {
        Self {
            id: EntityId::new(),
            canonical_name: canonical_name.into(),
            entity_type,
            aliases: BTreeSet::new(),
            mention_count: 0,
            first_seen_at: now,
            last_referenced_at: now,
        }
    }

    /// Does `name` refer to this entity (canonical name or alias, case-insensitive)?
    pub fn answers_to(&self, name: &str) -> bool {
        let key = normalize_key(name);
        normalize_key(&self.canonical_name) == key
            || self.aliases.iter().any(|a| normalize_key(a) == key)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ClaimState {
    #[default]
    Active,
    Stale,
    Dormant,
    Superseded,
}

/// One claim per Proposition+Stance pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Claim {
    pub id: ClaimId,
    pub unit_id: UnitId,
    pub session_id: String,
    pub subject: String,
    pub statement: String,
    pub stance: StanceKind,
    pub confidence: f32,
    pub temporality: Temporality,
    pub state: ClaimState,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub superseded_by: Option<ClaimId>,
    pub source_proposition: PropositionId,
    pub created_at: DateTime<Utc>,
    pub last_referenced_at: DateTime<Utc>,
}

impl Claim {
    /// Dedup key: lower-cased, trimmed statement.
    pub fn key(&self) -> String {
        normalize_key(&self.statement)
    }
}

/// Lower-case, trim, and collapse inner whitespace.
pub fn normalize_key(s: &str) -> String {
    s.split_whitespace()
        .collect::<Vec<_>>()
        .join(" ")
        .to_lowercase()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn normalize_key_is_case_and_space_insensitive() {
        assert_eq!(normalize_key("  Finish   the Report "), "finish the report");
    }

    #[test]
    fn entity_answers_to_aliases() {
        let mut e = Entity::new("Robert", EntityType::Person, Utc::now());
        e.aliases.insert("Bob".into());
        assert!(e.answers_to("robert"));
        assert!(e.answers_to("BOB"));
        assert!(!e.answers_to("Rob"));
    }
}
