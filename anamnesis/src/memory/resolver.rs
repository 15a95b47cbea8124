//! Entity resolution: decide, for every entity declared in a unit, whether it
//! denotes an entity already in the graph or one that must be created.
//!
//! Matching is exact on `(type, properties)`. Declarations with the same key
//! inside one unit collapse to a single distinct entity before the backend is
//! consulted, so each distinct key is looked up once.

use std::collections::HashMap;
use std::sync::Arc;
use tracing::debug;

use super::types::{Entity, EntityDraft, EntityKey};
use crate::Result;
use crate::storage::traits::GraphBackend;

/// Outcome for one distinct entity of a unit
#[derive(Debug, Clone, PartialEq)]
pub enum Resolution {
    /// Matches an entity already committed to the graph
    Existing(Entity),
    /// No match; phase 1 of the write creates it
    PendingCreate(EntityDraft),
}

/// Resolution of a whole unit
#[derive(Debug, Clone, Default)]
pub struct ResolvedUnit {
    /// For each declared entity (by local index), its distinct slot
    local_to_distinct: Vec<usize>,
    distinct: Vec<Resolution>,
}

impl ResolvedUnit {
    pub fn distinct(&self) -> &[Resolution] {
        &self.distinct
    }

    /// Distinct slot a declared entity collapsed into
    pub fn slot_of(&self, local_index: usize) -> Option<usize> {
        self.local_to_distinct.get(local_index).copied()
    }

    pub fn local_count(&self) -> usize {
        self.local_to_distinct.len()
    }

    pub fn pending_creates(&self) -> usize {
        self.distinct
            .iter()
            .filter(|r| matches!(r, Resolution::PendingCreate(_)))
            .count()
    }

    pub fn reused(&self) -> usize {
        self.distinct.len() - self.pending_creates()
    }
}

/// Intra-unit deduplication: maps each declaration to the first declaration
/// with the same key and returns the distinct drafts in first-seen order.
pub fn dedup_drafts(drafts: &[EntityDraft]) -> (Vec<usize>, Vec<EntityDraft>) {
    let mut by_key: HashMap<EntityKey, usize> = HashMap::new();
    let mut local_to_distinct = Vec::with_capacity(drafts.len());
    let mut distinct = Vec::new();

    for draft in drafts {
        let slot = *by_key.entry(draft.key()).or_insert_with(|| {
            distinct.push(draft.clone());
            distinct.len() - 1
        });
        local_to_distinct.push(slot);
    }

    (local_to_distinct, distinct)
}

#[derive(Debug, Clone)]
pub struct EntityResolver {
    backend: Arc<dyn GraphBackend>,
}

impl EntityResolver {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self { backend }
    }

    /// Resolve every declaration of a unit against the committed graph
    pub async fn resolve(&self, drafts: &[EntityDraft]) -> Result<ResolvedUnit> {
        let (local_to_distinct, distinct_drafts) = dedup_drafts(drafts);

        let mut distinct = Vec::with_capacity(distinct_drafts.len());
        for draft in distinct_drafts {
            match self.backend.find_entity(&draft).await? {
                Some(entity) => distinct.push(Resolution::Existing(entity)),
                None => distinct.push(Resolution::PendingCreate(draft)),
            }
        }

        let resolved = ResolvedUnit {
            local_to_distinct,
            distinct,
        };
        debug!(
            declared = resolved.local_count(),
            distinct = resolved.distinct.len(),
            reused = resolved.reused(),
            pending = resolved.pending_creates(),
            "Resolved unit entities"
        );
        Ok(resolved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::{Properties, properties_from_value};
    use crate::storage::memory_graph::InMemoryGraphBackend;
    use serde_json::json;

    fn draft(entity_type: &str, properties: serde_json::Value) -> EntityDraft {
        EntityDraft {
            entity_type: entity_type.to_string(),
            properties: properties_from_value(properties).unwrap(),
        }
    }

    #[test]
    fn test_dedup_collapses_equal_keys() {
        let drafts = vec![
            draft("Person", json!({"name": "John Smith"})),
            draft("Organization", json!({"name": "Acme"})),
            draft("Person", json!({"name": "John Smith"})),
            draft("Person", json!({"name": "Jane"})),
        ];
        let (mapping, distinct) = dedup_drafts(&drafts);
        assert_eq!(mapping, vec![0, 1, 0, 2]);
        assert_eq!(distinct.len(), 3);
    }

    #[test]
    fn test_dedup_is_exact_not_partial() {
        let drafts = vec![
            draft("Person", json!({"name": "John Smith"})),
            draft("Person", json!({"name": "John Smith", "age": 42})),
        ];
        let (mapping, _) = dedup_drafts(&drafts);
        assert_eq!(mapping, vec![0, 1]);
    }

    #[tokio::test]
    async fn test_resolve_reuses_committed_entities() {
        let backend = Arc::new(InMemoryGraphBackend::new());
        let mut tx = backend.begin().await.unwrap();
        let existing = tx
            .create_entity(draft("Person", json!({"name": "John Smith"})))
            .await
            .unwrap();
        tx.commit().await.unwrap();

        let resolver = EntityResolver::new(backend);
        let resolved = resolver
            .resolve(&[
                draft("Person", json!({"name": "John Smith"})),
                draft("Organization", json!({"name": "Acme"})),
                EntityDraft {
                    entity_type: "Person".to_string(),
                    properties: Properties::from_iter([(
                        "name".to_string(),
                        json!("John Smith"),
                    )]),
                },
            ])
            .await
            .unwrap();

        assert_eq!(resolved.distinct().len(), 2);
        assert_eq!(resolved.slot_of(2), Some(0));
        assert_eq!(resolved.distinct()[0], Resolution::Existing(existing));
        assert_eq!(resolved.reused(), 1);
        assert_eq!(resolved.pending_creates(), 1);
    }
}
