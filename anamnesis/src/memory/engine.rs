//! The memory engine: atomic remember-units and snapshot-isolated queries.

use futures::StreamExt;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tracing::{debug, info, warn};
use uuid::Uuid;

use super::builder::{DeclaredRelationship, FactHandle, MemoryBuilder, UnitLimits};
use super::query::FactQuery;
use super::resolver::{EntityResolver, Resolution, ResolvedUnit};
use super::types::{
    Entity, EntityId, EntityRef, FactRecord, LocalId, RelationshipDraft, RelationshipId,
};
use crate::config::MemoryConfig;
use crate::storage::errors::StorageError;
use crate::storage::traits::{FactStream, GraphBackend, GraphStats, GraphTransaction};
use crate::{AnamnesisError, Result};

/// What a committed unit wrote
#[derive(Debug, Clone, Default, PartialEq)]
pub struct UnitReceipt {
    pub unit_id: Uuid,
    /// Backend identity of every declared entity
    pub entities: HashMap<LocalId, EntityId>,
    /// Created relationships, in declaration order
    pub relationships: Vec<RelationshipId>,
    /// Distinct entities this unit's commit inserted
    pub created: usize,
    /// Distinct entities that already existed, including ones a concurrent
    /// unit committed between resolution and commit
    pub reused: usize,
}

impl UnitReceipt {
    pub fn entity_id(&self, local: LocalId) -> Option<&EntityId> {
        self.entities.get(&local)
    }

    pub fn relationship_id(&self, fact: FactHandle) -> Option<&RelationshipId> {
        self.relationships.get(fact.index())
    }
}

/// Value returned by a remember block together with the unit's receipt
#[derive(Debug, Clone, PartialEq)]
pub struct Remembered<T> {
    pub value: T,
    pub receipt: UnitReceipt,
}

/// Entry point for writing and reading facts
#[derive(Debug, Clone)]
pub struct MemoryEngine {
    backend: Arc<dyn GraphBackend>,
    resolver: EntityResolver,
    limits: UnitLimits,
    default_query_limit: Option<usize>,
}

impl MemoryEngine {
    pub fn new(backend: Arc<dyn GraphBackend>) -> Self {
        Self::with_config(backend, &MemoryConfig::default())
    }

    pub fn with_config(backend: Arc<dyn GraphBackend>, config: &MemoryConfig) -> Self {
        Self {
            resolver: EntityResolver::new(Arc::clone(&backend)),
            backend,
            limits: UnitLimits {
                max_entities: config.max_entities_per_unit,
                max_relationships: config.max_relationships_per_unit,
            },
            default_query_limit: config.default_query_limit,
        }
    }

    pub fn backend(&self) -> &Arc<dyn GraphBackend> {
        &self.backend
    }

    /// Open a new unit. Nothing is written until [`MemoryEngine::commit_unit`].
    pub fn begin(&self) -> MemoryBuilder {
        MemoryBuilder::new(self.limits)
    }

    /// Run `block` against a fresh unit and commit it atomically.
    ///
    /// If the block returns an error nothing is written and the error is
    /// returned unchanged.
    pub async fn remember<T, F>(&self, block: F) -> Result<Remembered<T>>
    where
        F: FnOnce(&mut MemoryBuilder) -> Result<T>,
    {
        let mut unit = self.begin();
        let value = block(&mut unit)?;
        let receipt = self.commit_unit(unit).await?;
        Ok(Remembered { value, receipt })
    }

    /// Resolve and write a unit: entities first, then relationships, all in
    /// one backend transaction.
    pub async fn commit_unit(&self, unit: MemoryBuilder) -> Result<UnitReceipt> {
        unit.check_committable()?;
        let (unit_id, drafts, relationships) = unit.into_parts();
        if drafts.is_empty() && relationships.is_empty() {
            debug!(unit = %unit_id, "Empty unit, nothing to commit");
            return Ok(UnitReceipt {
                unit_id,
                ..UnitReceipt::default()
            });
        }

        debug!(
            unit = %unit_id,
            entities = drafts.len(),
            relationships = relationships.len(),
            "Committing unit"
        );
        let resolved = self.resolver.resolve(&drafts).await?;

        let mut tx = self.backend.begin().await?;
        let written = match write_unit(&mut tx, &resolved, relationships).await {
            Ok(written) => written,
            Err(err) => {
                warn!(unit = %unit_id, error = %err, "Unit write failed, rolling back");
                return Err(match tx.rollback().await {
                    Ok(()) => err.into(),
                    Err(rollback_err) => StorageError::aggregate(err, rollback_err).into(),
                });
            }
        };
        let summary = match tx.commit().await {
            Ok(summary) => summary,
            Err(err) => {
                warn!(unit = %unit_id, error = %err, "Unit commit failed");
                return Err(err.into());
            }
        };

        let (distinct_ids, relationship_ids) = written;
        let mut entities = HashMap::with_capacity(resolved.local_count());
        for index in 0..resolved.local_count() {
            if let Some(id) = resolved.slot_of(index).and_then(|slot| distinct_ids.get(slot)) {
                entities.insert(
                    LocalId {
                        unit: unit_id,
                        index,
                    },
                    id.clone(),
                );
            }
        }

        let receipt = UnitReceipt {
            unit_id,
            entities,
            relationships: relationship_ids,
            created: summary.entities_created,
            reused: resolved
                .distinct()
                .len()
                .saturating_sub(summary.entities_created),
        };
        info!(
            unit = %unit_id,
            created = receipt.created,
            reused = receipt.reused,
            relationships = receipt.relationships.len(),
            "Committed unit"
        );
        Ok(receipt)
    }

    /// Parse `expression` and invoke `handler` once per matching record.
    /// Returns the number of records handled.
    pub async fn query<F>(&self, expression: &str, handler: F) -> Result<usize>
    where
        F: FnMut(FactRecord),
    {
        let query = FactQuery::parse(expression)?;
        self.query_with(&query, handler).await
    }

    pub async fn query_with<F>(&self, query: &FactQuery, mut handler: F) -> Result<usize>
    where
        F: FnMut(FactRecord),
    {
        let mut records = self.query_stream(query).await?;
        let mut count = 0;
        while let Some(record) = records.next().await {
            handler(record?);
            count += 1;
        }
        Ok(count)
    }

    /// Collect every record matching `expression`
    pub async fn query_all(&self, expression: &str) -> Result<Vec<FactRecord>> {
        let mut records = Vec::new();
        self.query(expression, |record| records.push(record)).await?;
        Ok(records)
    }

    /// Lazily stream the records matching `query` from the latest committed snapshot
    pub async fn query_stream(&self, query: &FactQuery) -> Result<FactStream> {
        query.validate().map_err(AnamnesisError::Validation)?;
        for id in query.pinned_ids() {
            if self.backend.get_entity(id).await?.is_none() {
                return Err(AnamnesisError::NotFound(format!("entity {}", id)));
            }
        }

        if query.limit.is_none() && self.default_query_limit.is_some() {
            let mut limited = query.clone();
            limited.limit = self.default_query_limit;
            return Ok(self.backend.query(&limited).await?);
        }
        Ok(self.backend.query(query).await?)
    }

    /// Fetch a committed entity
    pub async fn entity(&self, id: &EntityId) -> Result<Entity> {
        self.backend
            .get_entity(id)
            .await?
            .ok_or_else(|| AnamnesisError::NotFound(format!("entity {}", id)))
    }

    pub async fn stats(&self) -> Result<GraphStats> {
        Ok(self.backend.stats().await?)
    }
}

/// Phase 1 creates the unit's new entities, phase 2 its relationships.
/// Returns the backend id of each distinct entity and of each relationship.
async fn write_unit(
    tx: &mut Box<dyn GraphTransaction>,
    resolved: &ResolvedUnit,
    relationships: Vec<DeclaredRelationship>,
) -> std::result::Result<(Vec<EntityId>, Vec<RelationshipId>), StorageError> {
    let mut distinct_ids = Vec::with_capacity(resolved.distinct().len());
    for resolution in resolved.distinct() {
        let id = match resolution {
            Resolution::Existing(entity) => entity.id.clone(),
            Resolution::PendingCreate(draft) => tx.create_entity(draft.clone()).await?.id,
        };
        distinct_ids.push(id);
    }

    let mut verified: HashSet<EntityId> = HashSet::new();
    let mut relationship_ids = Vec::with_capacity(relationships.len());
    for declared in relationships {
        let subject_id =
            endpoint_id(tx, resolved, &distinct_ids, &mut verified, &declared.subject).await?;
        let target_id =
            endpoint_id(tx, resolved, &distinct_ids, &mut verified, &declared.target).await?;

        let relationship = tx
            .create_relationship(RelationshipDraft {
                subject_id,
                predicate: declared.predicate,
                target_id,
                confidence: declared.confidence,
                source: declared.source,
                properties: declared.properties,
            })
            .await?;
        relationship_ids.push(relationship.id);
    }

    Ok((distinct_ids, relationship_ids))
}

async fn endpoint_id(
    tx: &mut Box<dyn GraphTransaction>,
    resolved: &ResolvedUnit,
    distinct_ids: &[EntityId],
    verified: &mut HashSet<EntityId>,
    reference: &EntityRef,
) -> std::result::Result<EntityId, StorageError> {
    match reference {
        EntityRef::Local(local) => resolved
            .slot_of(local.index)
            .and_then(|slot| distinct_ids.get(slot))
            .cloned()
            .ok_or_else(|| StorageError::Internal(format!("unresolved local entity {}", local))),
        EntityRef::Existing(id) => {
            if !verified.contains(id) {
                if tx.get_entity(id).await?.is_none() {
                    return Err(StorageError::NotFound(format!("entity {}", id)));
                }
                verified.insert(id.clone());
            }
            Ok(id.clone())
        }
    }
}
