//! Deduplication of claims and entity mentions, and entity merging.

use std::collections::{BTreeSet, HashMap};

use crate::domain::{Claim, Entity, EntityMention, EntityType, StoreError, normalize_key};
use crate::ports::KnowledgeStore;

/// One claim per normalized statement, keeping the most confident variant.
/// Output order follows the first occurrence of each key.
pub fn dedup_claims(claims: Vec<Claim>) -> Vec<Claim> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut out: Vec<Claim> = Vec::with_capacity(claims.len());
    for claim in claims {
        match index.get(&claim.key()) {
            Some(&i) => {
                if claim.confidence > out[i].confidence {
                    out[i] = claim;
                }
            }
            None => {
                index.insert(claim.key(), out.len());
                out.push(claim);
            }
        }
    }
    out
}

/// Mentions of one referent within a unit.
#[derive(Debug, Clone, PartialEq)]
pub struct MentionGroup {
    /// First surface form seen.
    pub name: String,
    pub entity_type: EntityType,
    /// Other surface forms that normalized to the same key.
    pub aliases: BTreeSet<String>,
    pub count: u32,
}

impl MentionGroup {
    pub fn surface_forms(&self) -> impl Iterator<Item = &str> {
        std::iter::once(self.name.as_str()).chain(self.aliases.iter().map(String::as_str))
    }
}

/// Group mentions by normalized name. A typed mention wins over `Other`.
pub fn dedup_mentions(mentions: &[EntityMention]) -> Vec<MentionGroup> {
    let mut index: HashMap<String, usize> = HashMap::new();
    let mut groups: Vec<MentionGroup> = Vec::new();
    for m in mentions {
        let key = normalize_key(&m.text);
        if key.is_empty() {
            continue;
        }
        match index.get(&key) {
            Some(&i) => {
                let g = &mut groups[i];
                g.count += 1;
                if m.text != g.name {
                    g.aliases.insert(m.text.clone());
                }
                if g.entity_type == EntityType::Other {
                    g.entity_type = m.entity_type;
                }
            }
            None => {
                index.insert(key, groups.len());
                groups.push(MentionGroup {
                    name: m.text.clone(),
                    entity_type: m.entity_type,
                    aliases: BTreeSet::new(),
                    count: 1,
                });
            }
        }
    }
    groups
}

/// Fold `absorb` into `keep`: aliases are unioned (absorb's canonical name
/// becomes an alias), mention counts summed, time bounds widened.
pub fn merge_entities(mut keep: Entity, absorb: Entity) -> Entity {
    keep.aliases.extend(absorb.aliases);
    keep.aliases.insert(absorb.canonical_name);
    keep.aliases.remove(&keep.canonical_name);
    keep.mention_count += absorb.mention_count;
    keep.first_seen_at = keep.first_seen_at.min(absorb.first_seen_at);
    keep.last_referenced_at = keep.last_referenced_at.max(absorb.last_referenced_at);
    if keep.entity_type == EntityType::Other {
        keep.entity_type = absorb.entity_type;
    }
    keep
}

/// `merge_entities` plus persistence: the merged entity is written and the
/// absorbed one deleted.
pub async fn merge_entities_in_store(
    store: &dyn KnowledgeStore,
    keep: Entity,
    absorb: Entity,
) -> Result<Entity, StoreError> {
    let absorbed_id = absorb.id;
    let merged = merge_entities(keep, absorb);
    store.put_entity(merged.clone()).await?;
    store.delete_entity(absorbed_id).await?;
    Ok(merged)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::domain::{
        ClaimId, ClaimState, MentionId, PropositionId, StanceKind, Temporality, UnitId,
    };
    use crate::impls::InMemoryKnowledgeStore;
    use chrono::{Duration, Utc};

    fn claim(statement: &str, confidence: f32) -> Claim {
        let now = Utc::now();
        Claim {
            id: ClaimId::new(),
            unit_id: UnitId::new(),
            session_id: "s1".into(),
            subject: "user".into(),
            statement: statement.into(),
            stance: StanceKind::Assertion,
            confidence,
            temporality: Temporality::Current,
            state: ClaimState::Active,
            superseded_by: None,
            source_proposition: PropositionId::new(),
            created_at: now,
            last_referenced_at: now,
        }
    }

    fn mention(text: &str, entity_type: EntityType) -> EntityMention {
        EntityMention {
            id: MentionId::new(),
            unit_id: UnitId::new(),
            text: text.into(),
            entity_type,
        }
    }

    #[test]
    fn claim_dedup_keeps_highest_confidence() {
        let out = dedup_claims(vec![claim("A", 0.6), claim("a", 0.9)]);
        assert_eq!(out.len(), 1);
        assert_eq!(out[0].confidence, 0.9);
        assert_eq!(out[0].statement, "a");
    }

    #[test]
    fn claim_dedup_preserves_first_seen_order() {
        let out = dedup_claims(vec![
            claim("x", 0.5),
            claim("y", 0.5),
            claim(" X ", 0.7),
        ]);
        let statements: Vec<&str> = out.iter().map(|c| c.statement.as_str()).collect();
        assert_eq!(statements, vec![" X ", "y"]);
    }

    #[test]
    fn mention_dedup_unions_surface_forms() {
        let groups = dedup_mentions(&[
            mention("sarah", EntityType::Other),
            mention("Sarah", EntityType::Person),
            mention("Acme", EntityType::Organization),
            mention("  ", EntityType::Other),
        ]);
        assert_eq!(groups.len(), 2);
        assert_eq!(groups[0].name, "sarah");
        assert_eq!(groups[0].count, 2);
        assert_eq!(groups[0].entity_type, EntityType::Person);
        assert!(groups[0].aliases.contains("Sarah"));
        assert_eq!(groups[1].surface_forms().collect::<Vec<_>>(), vec!["Acme"]);
    }

    fn entity(name: &str, aliases: &[&str], count: u32) -> Entity {
        let mut e = Entity::new(name, EntityType::Person, Utc::now());
        e.aliases = aliases.iter().map(|a| a.to_string()).collect();
        e.mention_count = count;
        e
    }

    #[test]
    fn merge_unions_aliases_and_sums_counts() {
        let x = entity("Bobby", &["Bob"], 2);
        let y = entity("Rob", &["Robert"], 3);
        let merged = merge_entities(y.clone(), x);
        assert_eq!(merged.id, y.id);
        let aliases: Vec<&str> = merged.aliases.iter().map(String::as_str).collect();
        assert_eq!(aliases, vec!["Bob", "Bobby", "Robert"]);
        assert_eq!(merged.mention_count, 5);
    }

    #[test]
    fn merge_keeps_absorbed_name_differing_only_in_case() {
        let keep = entity("Robert", &[], 1);
        let absorb = entity("robert", &[], 1);
        let merged = merge_entities(keep, absorb);
        assert!(merged.aliases.contains("robert"));
        assert!(!merged.aliases.contains("Robert"));
        assert_eq!(merged.mention_count, 2);
    }

    #[test]
    fn merge_widens_time_bounds() {
        let mut x = entity("X", &[], 1);
        x.first_seen_at -= Duration::days(3);
        let y = entity("Y", &[], 1);
        let merged = merge_entities(y.clone(), x.clone());
        assert_eq!(merged.first_seen_at, x.first_seen_at);
        assert_eq!(merged.last_referenced_at, y.last_referenced_at.max(x.last_referenced_at));
    }

    #[tokio::test]
    async fn merge_in_store_deletes_absorbed() {
        let store = InMemoryKnowledgeStore::new();
        let x = entity("Bobby", &["Bob"], 2);
        let y = entity("Rob", &["Robert"], 3);
        store.put_entity(x.clone()).await.unwrap();
        store.put_entity(y.clone()).await.unwrap();

        let merged = merge_entities_in_store(&store, y.clone(), x.clone()).await.unwrap();
        let all = store.all_entities().await.unwrap();
        assert_eq!(all, vec![merged]);
        assert!(all.iter().all(|e| e.id != x.id));
    }
}
