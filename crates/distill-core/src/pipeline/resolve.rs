//! Entity resolution: mention groups -> canonical entities.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use tracing::{debug, info};

use super::dedup::{MentionGroup, merge_entities_in_store};
use crate::domain::{Entity, EntityId, EntityType, StoreError};
use crate::ports::KnowledgeStore;

#[derive(Debug, Default)]
pub struct Resolution {
    /// Entities to write, new and updated alike.
    pub upserts: Vec<Entity>,
    /// `(keep, absorb)` pairs: one group answered to both entities, so they
    /// name the same referent. Applied in order after the upserts.
    pub merges: Vec<(EntityId, EntityId)>,
    pub created: usize,
    pub merged: usize,
}

/// Resolve each group against `known`. A group matches an entity when any of
/// its surface forms equals the entity's canonical name or an alias
/// (case-insensitive). Matches bump the mention count and reference time;
/// the rest become new entities. When a group matches several entities, the
/// first one keeps the mention and the others are queued to be merged into it.
pub fn resolve_mentions(groups: &[MentionGroup], known: &[Entity], now: DateTime<Utc>) -> Resolution {
    let mut working: Vec<Entity> = known.to_vec();
    let mut touched: Vec<usize> = Vec::new();
    let mut absorbed: HashSet<usize> = HashSet::new();
    let mut resolution = Resolution::default();

    for group in groups {
        let hits: Vec<usize> = working
            .iter()
            .enumerate()
            .filter(|(i, e)| {
                !absorbed.contains(i) && group.surface_forms().any(|form| e.answers_to(form))
            })
            .map(|(i, _)| i)
            .collect();
        match hits.split_first() {
            Some((&i, rest)) => {
                let entity = &mut working[i];
                entity.mention_count += group.count;
                entity.last_referenced_at = now;
                for form in group.surface_forms() {
                    if !entity.answers_to(form) {
                        entity.aliases.insert(form.to_string());
                    }
                }
                if entity.entity_type == EntityType::Other {
                    entity.entity_type = group.entity_type;
                }
                debug!(entity = %entity.canonical_name, mentions = group.count, "mention resolved to known entity");
                if i < known.len() {
                    resolution.merged += 1;
                }
                if !touched.contains(&i) {
                    touched.push(i);
                }
                let keep = entity.id;
                for &j in rest {
                    absorbed.insert(j);
                    resolution.merges.push((keep, working[j].id));
                }
            }
            None => {
                let mut entity = Entity::new(group.name.clone(), group.entity_type, now);
                entity.aliases = group.aliases.clone();
                entity.mention_count = group.count;
                debug!(entity = %entity.canonical_name, "new entity");
                touched.push(working.len());
                working.push(entity);
                resolution.created += 1;
            }
        }
    }

    resolution.upserts = touched.into_iter().map(|i| working[i].clone()).collect();
    resolution
}

/// Write a resolution to the store: upserts first, then merges.
pub async fn apply_resolution(store: &dyn KnowledgeStore, resolution: Resolution) -> Result<(), StoreError> {
    for entity in resolution.upserts {
        store.put_entity(entity).await?;
    }
    for (keep, absorb) in resolution.merges {
        let entities = store.all_entities().await?;
        let find = |id: EntityId| entities.iter().find(|e| e.id == id).cloned();
        let (Some(keep), Some(absorb)) = (find(keep), find(absorb)) else {
            continue;
        };
        let merged = merge_entities_in_store(store, keep, absorb).await?;
        info!(entity = %merged.canonical_name, aliases = merged.aliases.len(), "entities merged");
    }
    Ok(())
}
