//! In-memory graph backend.
//!
//! Committed state lives in an immutable [`GraphSnapshot`] behind an `Arc`.
//! Readers clone the `Arc` and never block writers; a commit builds the next
//! snapshot and swaps it in under the write lock, so queries always observe
//! either all or none of a unit's writes.

use async_trait::async_trait;
use chrono::Utc;
use futures::{StreamExt, stream};
use std::collections::HashMap;
use std::sync::{Arc, RwLock};
use tracing::debug;
use uuid::Uuid;

use crate::memory::query::FactQuery;
use crate::memory::types::{
    Entity, EntityDraft, EntityId, FactRecord, Relationship, RelationshipDraft, RelationshipId,
};
use crate::storage::errors::StorageError;
use crate::storage::traits::{
    CommitSummary, FactStream, GraphBackend, GraphStats, GraphTransaction,
};

#[derive(Debug, Clone, Default)]
struct GraphSnapshot {
    entities: HashMap<EntityId, Entity>,
    /// Insertion order
    relationships: Vec<Relationship>,
}

impl GraphSnapshot {
    fn record(&self, relationship: &Relationship) -> Result<FactRecord, StorageError> {
        let endpoint = |id: &EntityId| {
            self.entities.get(id).cloned().ok_or_else(|| {
                StorageError::Internal(format!(
                    "relationship {} references missing entity {}",
                    relationship.id, id
                ))
            })
        };
        Ok(FactRecord {
            subject: endpoint(&relationship.subject_id)?,
            relationship: relationship.clone(),
            target: endpoint(&relationship.target_id)?,
        })
    }
}

type SharedSnapshot = Arc<RwLock<Arc<GraphSnapshot>>>;

fn current(state: &SharedSnapshot) -> Result<Arc<GraphSnapshot>, StorageError> {
    state
        .read()
        .map(|guard| Arc::clone(&guard))
        .map_err(|_| StorageError::Internal("graph state lock poisoned".to_string()))
}

fn entity_id_for(draft: &EntityDraft) -> EntityId {
    EntityId::new(draft.key().as_str())
}

/// Graph backend keeping everything in process memory
#[derive(Debug, Clone, Default)]
pub struct InMemoryGraphBackend {
    state: SharedSnapshot,
}

impl InMemoryGraphBackend {
    pub fn new() -> Self {
        Self::default()
    }
}

#[async_trait]
impl GraphBackend for InMemoryGraphBackend {
    async fn health_check(&self) -> Result<bool, StorageError> {
        current(&self.state).map(|_| true)
    }

    async fn find_entity(&self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError> {
        let snapshot = current(&self.state)?;
        Ok(snapshot.entities.get(&entity_id_for(draft)).cloned())
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        let snapshot = current(&self.state)?;
        Ok(snapshot.entities.get(id).cloned())
    }

    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError> {
        Ok(Box::new(InMemoryTransaction {
            id: Uuid::new_v4(),
            state: Arc::clone(&self.state),
            entities: HashMap::new(),
            entity_order: Vec::new(),
            relationships: Vec::new(),
        }))
    }

    async fn query(&self, query: &FactQuery) -> Result<FactStream, StorageError> {
        let snapshot = current(&self.state)?;

        if query.order.is_some() {
            let mut records = Vec::new();
            for relationship in &snapshot.relationships {
                let record = snapshot.record(relationship)?;
                if query.matches(&record) {
                    records.push(record);
                }
            }
            query.sort(&mut records);
            if let Some(limit) = query.limit {
                records.truncate(limit);
            }
            return Ok(Box::pin(stream::iter(records.into_iter().map(Ok))));
        }

        let limit = query.limit.unwrap_or(usize::MAX);
        let query = Arc::new(query.clone());
        let records = stream::unfold((snapshot, query, 0usize), |(snapshot, query, mut index)| async move {
            while index < snapshot.relationships.len() {
                let relationship = &snapshot.relationships[index];
                index += 1;
                match snapshot.record(relationship) {
                    Ok(record) if query.matches(&record) => {
                        return Some((Ok(record), (snapshot, query, index)));
                    }
                    Ok(_) => continue,
                    Err(e) => {
                        // Surface the error once, then end the stream
                        let end = snapshot.relationships.len();
                        return Some((Err(e), (snapshot, query, end)));
                    }
                }
            }
            None
        });

        Ok(Box::pin(records.take(limit)))
    }

    async fn stats(&self) -> Result<GraphStats, StorageError> {
        let snapshot = current(&self.state)?;
        Ok(GraphStats {
            entity_count: snapshot.entities.len(),
            relationship_count: snapshot.relationships.len(),
        })
    }
}

/// Write transaction staging entities and relationships until commit
struct InMemoryTransaction {
    id: Uuid,
    state: SharedSnapshot,
    entities: HashMap<EntityId, Entity>,
    entity_order: Vec<EntityId>,
    relationships: Vec<Relationship>,
}

impl InMemoryTransaction {
    fn lookup(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        if let Some(entity) = self.entities.get(id) {
            return Ok(Some(entity.clone()));
        }
        Ok(current(&self.state)?.entities.get(id).cloned())
    }
}

#[async_trait]
impl GraphTransaction for InMemoryTransaction {
    async fn find_entity(&mut self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError> {
        self.lookup(&entity_id_for(draft))
    }

    async fn get_entity(&mut self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        self.lookup(id)
    }

    async fn create_entity(&mut self, draft: EntityDraft) -> Result<Entity, StorageError> {
        let id = entity_id_for(&draft);
        if let Some(existing) = self.lookup(&id)? {
            return Ok(existing);
        }

        let entity = Entity {
            id: id.clone(),
            entity_type: draft.entity_type,
            properties: draft.properties,
            created_at: Utc::now(),
        };
        self.entities.insert(id.clone(), entity.clone());
        self.entity_order.push(id);
        Ok(entity)
    }

    async fn create_relationship(
        &mut self,
        draft: RelationshipDraft,
    ) -> Result<Relationship, StorageError> {
        for id in [&draft.subject_id, &draft.target_id] {
            if self.lookup(id)?.is_none() {
                return Err(StorageError::NotFound(format!("entity {}", id)));
            }
        }

        let relationship = Relationship {
            id: RelationshipId::new(Uuid::new_v4().to_string()),
            subject_id: draft.subject_id,
            predicate: draft.predicate,
            target_id: draft.target_id,
            confidence: draft.confidence,
            source: draft.source,
            properties: draft.properties,
            created_at: Utc::now(),
        };
        self.relationships.push(relationship.clone());
        Ok(relationship)
    }

    async fn commit(self: Box<Self>) -> Result<CommitSummary, StorageError> {
        let this = *self;
        let mut guard = this
            .state
            .write()
            .map_err(|_| StorageError::Internal("graph state lock poisoned".to_string()))?;

        let mut next = GraphSnapshot::clone(&guard);
        let mut entities = this.entities;
        let mut created = 0;
        for id in this.entity_order {
            if let Some(entity) = entities.remove(&id)
                && !next.entities.contains_key(&id)
            {
                next.entities.insert(id, entity);
                created += 1;
            }
        }
        let relationship_count = this.relationships.len();
        next.relationships.extend(this.relationships);

        *guard = Arc::new(next);
        debug!(
            transaction = %this.id,
            entities_created = created,
            relationships_created = relationship_count,
            "Committed graph transaction"
        );
        Ok(CommitSummary {
            entities_created: created,
            relationships_created: relationship_count,
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        debug!(
            transaction = %self.id,
            staged_entities = self.entities.len(),
            staged_relationships = self.relationships.len(),
            "Rolled back graph transaction"
        );
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::memory::types::Properties;
    use futures::TryStreamExt;
    use serde_json::json;

    fn draft(entity_type: &str, name: &str) -> EntityDraft {
        let mut properties = Properties::new();
        properties.insert("name".to_string(), json!(name));
        EntityDraft {
            entity_type: entity_type.to_string(),
            properties,
        }
    }

    fn fact(subject: &Entity, predicate: &str, target: &Entity) -> RelationshipDraft {
        RelationshipDraft {
            subject_id: subject.id.clone(),
            predicate: predicate.to_string(),
            target_id: target.id.clone(),
            confidence: 1.0,
            source: "test".to_string(),
            properties: Properties::new(),
        }
    }

    #[tokio::test]
    async fn test_staged_writes_invisible_until_commit() {
        let backend = InMemoryGraphBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let john = tx.create_entity(draft("Person", "John")).await.unwrap();
        let acme = tx.create_entity(draft("Organization", "Acme")).await.unwrap();
        tx.create_relationship(fact(&john, "worksAt", &acme)).await.unwrap();

        assert_eq!(backend.stats().await.unwrap(), GraphStats::default());
        assert!(backend.get_entity(&john.id).await.unwrap().is_none());

        tx.commit().await.unwrap();
        let stats = backend.stats().await.unwrap();
        assert_eq!(stats.entity_count, 2);
        assert_eq!(stats.relationship_count, 1);
    }

    #[tokio::test]
    async fn test_rollback_and_drop_discard_writes() {
        let backend = InMemoryGraphBackend::new();

        let mut tx = backend.begin().await.unwrap();
        tx.create_entity(draft("Person", "John")).await.unwrap();
        tx.rollback().await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.create_entity(draft("Person", "Jane")).await.unwrap();
        drop(tx);

        assert_eq!(backend.stats().await.unwrap().entity_count, 0);
    }

    #[tokio::test]
    async fn test_concurrent_creations_converge() {
        let backend = InMemoryGraphBackend::new();
        let mut first = backend.begin().await.unwrap();
        let mut second = backend.begin().await.unwrap();

        let a = first.create_entity(draft("Person", "John")).await.unwrap();
        let b = second.create_entity(draft("Person", "John")).await.unwrap();
        assert_eq!(a.id, b.id);

        assert_eq!(first.commit().await.unwrap().entities_created, 1);
        assert_eq!(second.commit().await.unwrap().entities_created, 0);
        assert_eq!(backend.stats().await.unwrap().entity_count, 1);
    }

    #[tokio::test]
    async fn test_relationship_requires_known_endpoints() {
        let backend = InMemoryGraphBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let john = tx.create_entity(draft("Person", "John")).await.unwrap();
        let ghost = Entity {
            id: EntityId::new("ghost"),
            ..john.clone()
        };

        let err = tx
            .create_relationship(fact(&john, "knows", &ghost))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::NotFound(_)));
    }

    #[tokio::test]
    async fn test_query_sees_snapshot_taken_at_call() {
        let backend = InMemoryGraphBackend::new();
        let mut tx = backend.begin().await.unwrap();
        let john = tx.create_entity(draft("Person", "John")).await.unwrap();
        let acme = tx.create_entity(draft("Organization", "Acme")).await.unwrap();
        tx.create_relationship(fact(&john, "worksAt", &acme)).await.unwrap();
        tx.commit().await.unwrap();

        let stream = backend.query(&FactQuery::new()).await.unwrap();

        let mut tx = backend.begin().await.unwrap();
        tx.create_relationship(fact(&john, "likes", &acme)).await.unwrap();
        tx.commit().await.unwrap();

        let records: Vec<FactRecord> = stream.try_collect().await.unwrap();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].relationship.predicate, "worksAt");
        assert_eq!(records[0].subject.id, john.id);
    }
}
