//! Integration tests for remember-units and fact queries
//!
//! Covers round-trips through the query language, entity deduplication within
//! and across units, validation before any write, and all-or-nothing commits
//! when the backend fails halfway through a unit.

use anamnesis::memory::{EntityDraft, FactOrderField, SortDirection};
use anamnesis::prelude::*;
use anamnesis::storage::{
    CommitSummary, FactStream, GraphStats, GraphTransaction, InMemoryGraphBackend, StorageError,
};
use async_trait::async_trait;
use serde_json::json;
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

fn engine() -> (MemoryEngine, Arc<InMemoryGraphBackend>) {
    let backend = Arc::new(InMemoryGraphBackend::new());
    (MemoryEngine::new(backend.clone()), backend)
}

async fn remember_employment(engine: &MemoryEngine) -> UnitReceipt {
    engine
        .remember(|unit| {
            let john = unit.entity("Person", json!({"name": "John Smith"}))?;
            let acme = unit.entity("Organization", json!({"name": "Acme"}))?;
            unit.relationship(john, "worksAt", acme)
                .confidence(1.0)
                .source("hr-import")
                .declare()?;
            Ok(())
        })
        .await
        .expect("Failed to remember unit")
        .receipt
}

#[tokio::test]
async fn test_round_trip() {
    let (engine, _) = engine();
    remember_employment(&engine).await;

    let records = engine
        .query_all(r#"(Person {name: "John Smith"})-[worksAt]->(Organization {name: "Acme"})"#)
        .await
        .expect("Query failed");

    assert_eq!(records.len(), 1);
    let record = &records[0];
    assert_eq!(record.relationship.confidence, 1.0);
    assert_eq!(record.relationship.source, "hr-import");
    assert_eq!(record.subject.properties["name"], "John Smith");
    assert_eq!(record.target.entity_type, "Organization");
}

#[tokio::test]
async fn test_intra_unit_dedup() {
    let (engine, _) = engine();
    let receipt = engine
        .remember(|unit| {
            let first = unit.entity("Person", json!({"name": "John Smith"}))?;
            let again = unit.entity("Person", json!({"name": "John Smith"}))?;
            let acme = unit.entity("Organization", json!({"name": "Acme"}))?;
            unit.relationship(first, "worksAt", acme)
                .source("profile")
                .declare()?;
            unit.relationship(again, "founded", acme)
                .confidence(0.4)
                .source("rumour")
                .declare()?;
            Ok((first, again))
        })
        .await
        .expect("Failed to remember unit");

    let (first, again) = receipt.value;
    assert_eq!(
        receipt.receipt.entity_id(first),
        receipt.receipt.entity_id(again)
    );
    assert_eq!(receipt.receipt.created, 2);

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.entity_count, 2);
    assert_eq!(stats.relationship_count, 2);

    let records = engine.query_all("(Person)-[*]->(Organization)").await.unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[0].subject.id, records[1].subject.id);
}

#[tokio::test]
async fn test_cross_unit_dedup() {
    let (engine, _) = engine();
    for _ in 0..2 {
        engine
            .remember(|unit| unit.entity("Person", json!({"name": "John Smith"})))
            .await
            .unwrap();
    }

    assert_eq!(engine.stats().await.unwrap().entity_count, 1);

    let second = remember_employment(&engine).await;
    assert_eq!(second.created, 1);
    assert_eq!(second.reused, 1);
    assert_eq!(engine.stats().await.unwrap().entity_count, 2);
}

#[tokio::test]
async fn test_validation_boundary_writes_nothing() {
    let (engine, _) = engine();

    for confidence in [1.5, -0.1, f64::NAN] {
        let result = engine
            .remember(|unit| {
                let a = unit.entity("Person", json!({"name": "A"}))?;
                let b = unit.entity("Person", json!({"name": "B"}))?;
                unit.relationship(a, "knows", b)
                    .confidence(confidence)
                    .source("test")
                    .declare()?;
                Ok(())
            })
            .await;
        assert!(matches!(result, Err(AnamnesisError::Validation(_))));
    }

    // Ignoring the error does not make the unit committable
    let mut unit = engine.begin();
    let a = unit.entity("Person", json!({"name": "A"})).unwrap();
    let _ = unit.relationship(a, "", a).source("test").declare();
    let result = engine.commit_unit(unit).await;
    assert!(matches!(result, Err(AnamnesisError::Validation(_))));

    let mut unit = engine.begin();
    let nested = unit.entity("Person", json!({"name": {"first": "A"}}));
    assert!(matches!(nested, Err(AnamnesisError::Validation(_))));

    assert_eq!(engine.stats().await.unwrap(), GraphStats::default());
}

#[tokio::test]
async fn test_relationship_declared_before_its_entities_is_written_after_them() {
    let (engine, _) = engine();
    let mut unit = engine.begin();
    let first = unit.entity("City", json!({"name": "Lisbon"})).unwrap();
    let second = unit.entity("Country", json!({"name": "Portugal"})).unwrap();
    unit.relationship(first, "capitalOf", second)
        .source("atlas")
        .declare()
        .unwrap();
    // A later entity may still be referenced by an earlier one's relationship
    let third = unit.entity("Continent", json!({"name": "Europe"})).unwrap();
    unit.relationship(second, "partOf", third)
        .source("atlas")
        .declare()
        .unwrap();

    let receipt = engine.commit_unit(unit).await.unwrap();
    assert_eq!(receipt.relationships.len(), 2);
    assert_eq!(engine.stats().await.unwrap().entity_count, 3);
}

#[tokio::test]
async fn test_existing_entity_reference() {
    let (engine, _) = engine();
    remember_employment(&engine).await;
    let records = engine.query_all("(Person)-[worksAt]->()").await.unwrap();
    let john = engine.entity(&records[0].subject.id).await.unwrap();
    assert_eq!(john.properties["name"], "John Smith");

    engine
        .remember(|unit| {
            let city = unit.entity("City", json!({"name": "Springfield"}))?;
            unit.relationship(john.id.clone(), "livesIn", city)
                .source("address-book")
                .declare()?;
            Ok(())
        })
        .await
        .unwrap();
    assert_eq!(engine.stats().await.unwrap().relationship_count, 2);

    let missing = EntityId::new("no-such-entity");
    let result = engine
        .remember(|unit| {
            let city = unit.entity("City", json!({"name": "Shelbyville"}))?;
            unit.relationship(missing.clone(), "livesIn", city)
                .source("address-book")
                .declare()?;
            Ok(())
        })
        .await;
    assert!(matches!(result, Err(AnamnesisError::NotFound(_))));

    // The city from the failed unit was rolled back with it
    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.entity_count, 3);
    assert_eq!(stats.relationship_count, 2);
}

#[tokio::test]
async fn test_queries_by_id_confidence_order_and_limit() {
    let (engine, _) = engine();
    let receipt = engine
        .remember(|unit| {
            let ada = unit.entity("Person", json!({"name": "Ada"}))?;
            for (i, topic) in ["maths", "engines", "poetry"].iter().enumerate() {
                let t = unit.entity("Topic", json!({"name": topic}))?;
                unit.relationship(ada, "studies", t)
                    .confidence(0.3 * (i as f64 + 1.0))
                    .source(if i == 0 { "letters" } else { "notes" })
                    .declare()?;
            }
            Ok(ada)
        })
        .await
        .unwrap();
    let ada = receipt.receipt.entity_id(receipt.value).cloned().unwrap();

    let query = FactQuery::new()
        .subject(EntityPattern::with_id(ada.clone()))
        .predicate("studies")
        .order_by(FactOrderField::Confidence, SortDirection::Descending)
        .limit(2);
    let mut seen = Vec::new();
    let count = engine
        .query_with(&query, |record| seen.push(record.relationship.confidence))
        .await
        .unwrap();
    assert_eq!(count, 2);
    assert!(seen[0] > seen[1]);

    let strong = engine
        .query_all("(Person)-[studies]->(Topic) WHERE confidence >= 0.5")
        .await
        .unwrap();
    assert_eq!(strong.len(), 2);

    let from_letters = engine
        .query_all(r#"()-[studies]->() WHERE source = "letters""#)
        .await
        .unwrap();
    assert_eq!(from_letters.len(), 1);
    assert_eq!(from_letters[0].target.properties["name"], "maths");

    let unknown = FactQuery::new().target(EntityPattern::with_id("missing"));
    assert!(matches!(
        engine.query_stream(&unknown).await,
        Err(AnamnesisError::NotFound(_))
    ));
}

#[tokio::test]
async fn test_malformed_query_is_a_validation_error() {
    let (engine, _) = engine();
    remember_employment(&engine).await;

    for expression in ["(Person", "(Person)-[worksAt]->(Org) LIMIT many", "SELECT *"] {
        let result = engine.query_all(expression).await;
        assert!(
            matches!(result, Err(AnamnesisError::Validation(_))),
            "expected validation error for {expression:?}"
        );
    }
    assert_eq!(engine.stats().await.unwrap().relationship_count, 1);
}

#[tokio::test]
async fn test_concurrent_units_create_one_entity_per_key() {
    let (engine, _) = engine();
    let mut handles = Vec::new();
    for i in 0..16 {
        let engine = engine.clone();
        handles.push(tokio::spawn(async move {
            engine
                .remember(|unit| {
                    let john = unit.entity("Person", json!({"name": "John Smith"}))?;
                    let place = unit.entity("Place", json!({"visit": i}))?;
                    unit.relationship(john, "visited", place)
                        .source("travel-log")
                        .declare()?;
                    Ok(())
                })
                .await
        }));
    }
    let mut created = 0;
    for handle in handles {
        created += handle.await.unwrap().unwrap().receipt.created;
    }
    // One John plus one place per unit, however the units interleaved
    assert_eq!(created, 17);

    let records = engine
        .query_all(r#"(Person {name: "John Smith"})-[visited]->(Place)"#)
        .await
        .unwrap();
    assert_eq!(records.len(), 16);
    assert!(records.iter().all(|r| r.subject.id == records[0].subject.id));

    let stats = engine.stats().await.unwrap();
    assert_eq!(stats.entity_count, 17);
}

#[tokio::test]
async fn test_query_snapshot_is_not_affected_by_later_commits() {
    let (engine, _) = engine();
    remember_employment(&engine).await;

    let mut stream = engine.query_stream(&FactQuery::new()).await.unwrap();
    engine
        .remember(|unit| {
            let a = unit.entity("Person", json!({"name": "Late"}))?;
            unit.relationship(a, "knows", a).source("test").declare()?;
            Ok(())
        })
        .await
        .unwrap();

    use futures::StreamExt;
    let mut count = 0;
    while let Some(record) = stream.next().await {
        record.unwrap();
        count += 1;
    }
    assert_eq!(count, 1);
    assert_eq!(engine.query_all("()-[]->()").await.unwrap().len(), 2);
}

/// Backend whose transactions fail relationship creation after `fail_after`
/// successes, and optionally fail their rollback too
#[derive(Debug)]
struct FlakyBackend {
    inner: InMemoryGraphBackend,
    fail_after: usize,
    fail_rollback: bool,
    rollbacks: Arc<AtomicUsize>,
}

struct FlakyTransaction {
    inner: Box<dyn GraphTransaction>,
    remaining: usize,
    fail_rollback: bool,
    rollbacks: Arc<AtomicUsize>,
}

#[async_trait]
impl GraphBackend for FlakyBackend {
    async fn health_check(&self) -> std::result::Result<bool, StorageError> {
        self.inner.health_check().await
    }

    async fn find_entity(&self, draft: &EntityDraft) -> std::result::Result<Option<Entity>, StorageError> {
        self.inner.find_entity(draft).await
    }

    async fn get_entity(&self, id: &EntityId) -> std::result::Result<Option<Entity>, StorageError> {
        self.inner.get_entity(id).await
    }

    async fn begin(&self) -> std::result::Result<Box<dyn GraphTransaction>, StorageError> {
        Ok(Box::new(FlakyTransaction {
            inner: self.inner.begin().await?,
            remaining: self.fail_after,
            fail_rollback: self.fail_rollback,
            rollbacks: self.rollbacks.clone(),
        }))
    }

    async fn query(&self, query: &FactQuery) -> std::result::Result<FactStream, StorageError> {
        self.inner.query(query).await
    }

    async fn stats(&self) -> std::result::Result<GraphStats, StorageError> {
        self.inner.stats().await
    }
}

#[async_trait]
impl GraphTransaction for FlakyTransaction {
    async fn find_entity(&mut self, draft: &EntityDraft) -> std::result::Result<Option<Entity>, StorageError> {
        self.inner.find_entity(draft).await
    }

    async fn get_entity(&mut self, id: &EntityId) -> std::result::Result<Option<Entity>, StorageError> {
        self.inner.get_entity(id).await
    }

    async fn create_entity(&mut self, draft: EntityDraft) -> std::result::Result<Entity, StorageError> {
        self.inner.create_entity(draft).await
    }

    async fn create_relationship(
        &mut self,
        draft: anamnesis::memory::RelationshipDraft,
    ) -> std::result::Result<Relationship, StorageError> {
        if self.remaining == 0 {
            return Err(StorageError::Query("relationship insert failed".to_string()));
        }
        self.remaining -= 1;
        self.inner.create_relationship(draft).await
    }

    async fn commit(self: Box<Self>) -> std::result::Result<CommitSummary, StorageError> {
        self.inner.commit().await
    }

    async fn rollback(self: Box<Self>) -> std::result::Result<(), StorageError> {
        self.rollbacks.fetch_add(1, Ordering::SeqCst);
        let result = self.inner.rollback().await;
        if self.fail_rollback {
            return Err(StorageError::Transaction("rollback failed".to_string()));
        }
        result
    }
}

fn flaky(fail_after: usize, fail_rollback: bool) -> (MemoryEngine, Arc<AtomicUsize>) {
    let rollbacks = Arc::new(AtomicUsize::new(0));
    let backend = Arc::new(FlakyBackend {
        inner: InMemoryGraphBackend::new(),
        fail_after,
        fail_rollback,
        rollbacks: rollbacks.clone(),
    });
    (MemoryEngine::new(backend), rollbacks)
}

async fn remember_two_facts(engine: &MemoryEngine) -> Result<Remembered<()>> {
    engine
        .remember(|unit| {
            let john = unit.entity("Person", json!({"name": "John Smith"}))?;
            let acme = unit.entity("Organization", json!({"name": "Acme"}))?;
            let city = unit.entity("City", json!({"name": "Springfield"}))?;
            unit.relationship(john, "worksAt", acme).source("hr").declare()?;
            unit.relationship(acme, "locatedIn", city).source("hr").declare()?;
            Ok(())
        })
        .await
}

#[tokio::test]
async fn test_atomicity_under_phase_two_failure() {
    let (engine, rollbacks) = flaky(1, false);

    let result = remember_two_facts(&engine).await;
    assert!(matches!(result, Err(AnamnesisError::Storage(_))));
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);

    assert_eq!(engine.stats().await.unwrap(), GraphStats::default());
    assert!(engine.query_all("()-[]->()").await.unwrap().is_empty());
    assert!(
        engine
            .query_all(r#"(Person {name: "John Smith"})-[*]->()"#)
            .await
            .unwrap()
            .is_empty()
    );
}

#[tokio::test]
async fn test_failed_rollback_is_reported_with_the_original_error() {
    let (engine, rollbacks) = flaky(0, true);

    let err = remember_two_facts(&engine).await.unwrap_err();
    assert_eq!(rollbacks.load(Ordering::SeqCst), 1);
    match err {
        AnamnesisError::Storage(message) => {
            assert!(message.contains("relationship insert failed"), "{message}");
            assert!(message.contains("rollback failed"), "{message}");
        }
        other => panic!("expected storage error, got {other:?}"),
    }
    assert_eq!(engine.stats().await.unwrap(), GraphStats::default());
}

#[tokio::test]
async fn test_cancelled_unit_leaves_nothing_visible() {
    let (engine, _) = engine();
    let task = {
        let engine = engine.clone();
        tokio::spawn(async move { remember_two_facts(&engine).await })
    };
    task.abort();
    let _ = task.await;

    // Either the unit committed completely or not at all
    let stats = engine.stats().await.unwrap();
    assert!(
        stats == GraphStats::default()
            || (stats.entity_count == 3 && stats.relationship_count == 2),
        "partial unit visible: {stats:?}"
    );
}
