//! SurrealDB graph backend
//!
//! Entities live in the `entity` table under record ids derived from their
//! matching key; facts live in the `fact` table and link to their endpoints.
//! A transaction buffers its writes client-side and sends them as a single
//! `BEGIN TRANSACTION … COMMIT TRANSACTION` query on commit, so an uncommitted
//! or dropped transaction never touches the database.

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use futures::stream;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::HashMap;
use surrealdb::engine::local::{Db, Mem, RocksDb};
use surrealdb::{Connection, RecordId, Surreal};
use tracing::{debug, info};
use uuid::Uuid;

use crate::memory::query::{FactOrderField, FactQuery, SortDirection};
use crate::memory::types::{
    Entity, EntityDraft, EntityId, FactRecord, Properties, Relationship, RelationshipDraft,
    RelationshipId,
};
use crate::storage::errors::StorageError;
use crate::storage::traits::{
    CommitSummary, FactStream, GraphBackend, GraphStats, GraphTransaction,
};

pub mod schema;

const ENTITY_TABLE: &str = "entity";
const FACT_TABLE: &str = "fact";

/// Embedded SurrealDB backend
pub type EmbeddedGraphBackend = SurrealGraphBackend<Db>;

/// Internal representation of an entity record
#[derive(Debug, Clone, Serialize, Deserialize)]
struct SurrealEntity {
    id: RecordId,
    entity_type: String,
    properties: Value,
    created_at: String,
}

impl SurrealEntity {
    fn from_entity(entity: &Entity) -> Self {
        Self {
            id: RecordId::from((ENTITY_TABLE, entity.id.as_str())),
            entity_type: entity.entity_type.clone(),
            properties: Value::Object(entity.properties.clone()),
            created_at: timestamp(&entity.created_at),
        }
    }

    fn into_entity(self) -> Result<Entity, StorageError> {
        Ok(Entity {
            id: EntityId::new(record_key(&self.id)),
            entity_type: self.entity_type,
            properties: properties_of(self.properties)?,
            created_at: parse_timestamp(&self.created_at)?,
        })
    }
}

/// Fact record as written
#[derive(Debug, Clone, Serialize)]
struct FactContent {
    subject: RecordId,
    predicate: String,
    target: RecordId,
    confidence: f64,
    source: String,
    properties: Value,
    created_at: String,
}

/// Fact record as read, with both endpoints fetched
#[derive(Debug, Clone, Deserialize)]
struct FetchedFact {
    id: RecordId,
    subject: SurrealEntity,
    predicate: String,
    target: SurrealEntity,
    confidence: f64,
    source: String,
    properties: Value,
    created_at: String,
}

impl FetchedFact {
    fn into_record(self) -> Result<FactRecord, StorageError> {
        let subject = self.subject.into_entity()?;
        let target = self.target.into_entity()?;
        Ok(FactRecord {
            relationship: Relationship {
                id: RelationshipId::new(record_key(&self.id)),
                subject_id: subject.id.clone(),
                predicate: self.predicate,
                target_id: target.id.clone(),
                confidence: self.confidence,
                source: self.source,
                properties: properties_of(self.properties)?,
                created_at: parse_timestamp(&self.created_at)?,
            },
            subject,
            target,
        })
    }
}

/// Stored creation time of an entity, used to tell which staged entities a
/// commit inserted
#[derive(Debug, Deserialize)]
struct EntityStamp {
    id: RecordId,
    created_at: String,
}

#[derive(Debug, Deserialize)]
struct CountRow {
    count: usize,
}

/// Extract the key string from a RecordId; `to_string` wraps some keys in ⟨⟩
fn record_key(id: &RecordId) -> String {
    let key = id.key().to_string();
    key.strip_prefix('⟨')
        .and_then(|s| s.strip_suffix('⟩'))
        .map(str::to_string)
        .unwrap_or(key)
}

/// Fixed-width RFC 3339 so that lexical order matches time order
fn timestamp(time: &DateTime<Utc>) -> String {
    time.to_rfc3339_opts(SecondsFormat::Nanos, true)
}

fn parse_timestamp(value: &str) -> Result<DateTime<Utc>, StorageError> {
    DateTime::parse_from_rfc3339(value)
        .map(|t| t.with_timezone(&Utc))
        .map_err(|e| StorageError::Serialization(format!("invalid timestamp '{}': {}", value, e)))
}

fn properties_of(value: Value) -> Result<Properties, StorageError> {
    match value {
        Value::Object(map) => Ok(map),
        Value::Null => Ok(Properties::new()),
        other => Err(StorageError::Serialization(format!(
            "expected a properties object, got {}",
            other
        ))),
    }
}

fn query_error(context: &str) -> impl Fn(surrealdb::Error) -> StorageError + '_ {
    move |e| StorageError::Query(format!("{}: {}", context, e))
}

/// Graph backend over a SurrealDB connection
#[derive(Debug, Clone)]
pub struct SurrealGraphBackend<C>
where
    C: Connection + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    client: Surreal<C>,
}

impl SurrealGraphBackend<Db> {
    /// In-memory embedded database
    pub async fn memory(namespace: &str, database: &str) -> Result<Self, StorageError> {
        let client = Surreal::new::<Mem>(()).await.map_err(|e| {
            StorageError::Connection(format!("Failed to create memory client: {}", e))
        })?;
        info!("Created in-memory SurrealDB graph backend");
        Self::new(client, namespace, database).await
    }

    /// RocksDB-backed embedded database at `path`
    pub async fn rocksdb(path: &str, namespace: &str, database: &str) -> Result<Self, StorageError> {
        let client = Surreal::new::<RocksDb>(path).await.map_err(|e| {
            StorageError::Connection(format!("Failed to create RocksDB client: {}", e))
        })?;
        info!(path, "Created RocksDB SurrealDB graph backend");
        Self::new(client, namespace, database).await
    }
}

impl<C> SurrealGraphBackend<C>
where
    C: Connection + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    pub async fn new(
        client: Surreal<C>,
        namespace: &str,
        database: &str,
    ) -> Result<Self, StorageError> {
        client
            .use_ns(namespace)
            .use_db(database)
            .await
            .map_err(|e| {
                StorageError::Connection(format!("Failed to set namespace/database: {}", e))
            })?;
        schema::initialize_schema(&client).await?;
        Ok(Self { client })
    }

    async fn select_entity(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        select_entity(&self.client, id).await
    }
}

async fn select_entity<C: Connection>(
    client: &Surreal<C>,
    id: &EntityId,
) -> Result<Option<Entity>, StorageError> {
    let entity: Option<SurrealEntity> = client
        .select((ENTITY_TABLE, id.as_str()))
        .await
        .map_err(query_error("Failed to get entity"))?;
    entity.map(SurrealEntity::into_entity).transpose()
}

fn entity_id_for(draft: &EntityDraft) -> EntityId {
    EntityId::new(draft.key().as_str())
}

/// Build the SELECT for a fact query. Property patterns are not expressible
/// with bound parameters and are checked client-side, in which case the
/// limit is applied client-side too.
fn build_select(query: &FactQuery) -> (String, Vec<(String, Value)>, Vec<(String, RecordId)>, bool) {
    let mut conditions = Vec::new();
    let mut values: Vec<(String, Value)> = Vec::new();
    let mut records: Vec<(String, RecordId)> = Vec::new();

    if let Some(predicate) = &query.predicate {
        conditions.push("predicate = $predicate");
        values.push(("predicate".to_string(), Value::String(predicate.clone())));
    }
    if let Some(min) = query.min_confidence {
        conditions.push("confidence >= $min_confidence");
        values.push(("min_confidence".to_string(), Value::from(min)));
    }
    if let Some(source) = &query.source {
        conditions.push("source = $source");
        values.push(("source".to_string(), Value::String(source.clone())));
    }
    if let Some(id) = &query.subject.id {
        conditions.push("subject = $subject_id");
        records.push((
            "subject_id".to_string(),
            RecordId::from((ENTITY_TABLE, id.as_str())),
        ));
    }
    if let Some(id) = &query.target.id {
        conditions.push("target = $target_id");
        records.push((
            "target_id".to_string(),
            RecordId::from((ENTITY_TABLE, id.as_str())),
        ));
    }
    if let Some(entity_type) = &query.subject.entity_type {
        conditions.push("subject.entity_type = $subject_type");
        values.push(("subject_type".to_string(), Value::String(entity_type.clone())));
    }
    if let Some(entity_type) = &query.target.entity_type {
        conditions.push("target.entity_type = $target_type");
        values.push(("target_type".to_string(), Value::String(entity_type.clone())));
    }

    let mut sql = format!("SELECT * FROM {}", FACT_TABLE);
    if !conditions.is_empty() {
        sql.push_str(" WHERE ");
        sql.push_str(&conditions.join(" AND "));
    }

    let (field, direction) = match query.order {
        Some(order) => (
            match order.field {
                FactOrderField::Confidence => "confidence",
                FactOrderField::Created => "created_at",
            },
            order.direction,
        ),
        None => ("created_at", SortDirection::Ascending),
    };
    let direction = match direction {
        SortDirection::Ascending => "ASC",
        SortDirection::Descending => "DESC",
    };
    sql.push_str(&format!(" ORDER BY {} {}", field, direction));

    let client_side = !query.subject.properties.is_empty() || !query.target.properties.is_empty();
    if let Some(limit) = query.limit
        && !client_side
    {
        sql.push_str(&format!(" LIMIT {}", limit));
    }
    sql.push_str(" FETCH subject, target");

    (sql, values, records, client_side)
}

#[async_trait]
impl<C> GraphBackend for SurrealGraphBackend<C>
where
    C: Connection + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn health_check(&self) -> Result<bool, StorageError> {
        Ok(self.client.health().await.is_ok())
    }

    async fn find_entity(&self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError> {
        self.select_entity(&entity_id_for(draft)).await
    }

    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        self.select_entity(id).await
    }

    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError> {
        Ok(Box::new(SurrealTransaction {
            id: Uuid::new_v4(),
            client: self.client.clone(),
            entities: HashMap::new(),
            entity_order: Vec::new(),
            relationships: Vec::new(),
        }))
    }

    async fn query(&self, query: &FactQuery) -> Result<FactStream, StorageError> {
        let (sql, values, records, client_side) = build_select(query);
        debug!(sql = %sql, "Running fact query");

        let mut request = self.client.query(sql);
        for binding in values {
            request = request.bind(binding);
        }
        for binding in records {
            request = request.bind(binding);
        }
        let mut response = request.await.map_err(query_error("Failed to run fact query"))?;
        let rows: Vec<FetchedFact> = response
            .take(0)
            .map_err(query_error("Failed to extract fact query results"))?;

        let mut results = Vec::with_capacity(rows.len());
        for row in rows {
            let record = row.into_record()?;
            if !client_side || query.matches(&record) {
                results.push(record);
            }
        }
        if client_side && let Some(limit) = query.limit {
            results.truncate(limit);
        }

        Ok(Box::pin(stream::iter(results.into_iter().map(Ok))))
    }

    async fn stats(&self) -> Result<GraphStats, StorageError> {
        let mut response = self
            .client
            .query(format!(
                "SELECT count() FROM {} GROUP ALL; SELECT count() FROM {} GROUP ALL;",
                ENTITY_TABLE, FACT_TABLE
            ))
            .await
            .map_err(query_error("Failed to count records"))?;
        let entities: Option<CountRow> = response
            .take(0)
            .map_err(query_error("Failed to extract entity count"))?;
        let facts: Option<CountRow> = response
            .take(1)
            .map_err(query_error("Failed to extract fact count"))?;

        Ok(GraphStats {
            entity_count: entities.map(|row| row.count).unwrap_or(0),
            relationship_count: facts.map(|row| row.count).unwrap_or(0),
        })
    }
}

/// Buffered write transaction
struct SurrealTransaction<C>
where
    C: Connection,
{
    id: Uuid,
    client: Surreal<C>,
    entities: HashMap<EntityId, Entity>,
    entity_order: Vec<EntityId>,
    relationships: Vec<Relationship>,
}

impl<C> SurrealTransaction<C>
where
    C: Connection + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn lookup(&self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        if let Some(entity) = self.entities.get(id) {
            return Ok(Some(entity.clone()));
        }
        select_entity(&self.client, id).await
    }
}

#[async_trait]
impl<C> GraphTransaction for SurrealTransaction<C>
where
    C: Connection + Clone + Send + Sync + std::fmt::Debug + 'static,
{
    async fn find_entity(&mut self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError> {
        self.lookup(&entity_id_for(draft)).await
    }

    async fn get_entity(&mut self, id: &EntityId) -> Result<Option<Entity>, StorageError> {
        self.lookup(id).await
    }

    async fn create_entity(&mut self, draft: EntityDraft) -> Result<Entity, StorageError> {
        let id = entity_id_for(&draft);
        if let Some(existing) = self.lookup(&id).await? {
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
            if self.lookup(id).await?.is_none() {
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
        if self.entity_order.is_empty() && self.relationships.is_empty() {
            return Ok(CommitSummary::default());
        }

        let mut sql = String::from("BEGIN TRANSACTION;\n");
        let entity_rows: Vec<SurrealEntity> = self
            .entity_order
            .iter()
            .filter_map(|id| self.entities.get(id))
            .map(SurrealEntity::from_entity)
            .collect();
        if !entity_rows.is_empty() {
            sql.push_str(&format!("INSERT IGNORE INTO {} $entities;\n", ENTITY_TABLE));
        }

        let mut fact_ids = Vec::with_capacity(self.relationships.len());
        let mut fact_contents = Vec::with_capacity(self.relationships.len());
        for (i, relationship) in self.relationships.iter().enumerate() {
            sql.push_str(&format!("CREATE $fact_id_{i} CONTENT $fact_{i};\n"));
            fact_ids.push((
                format!("fact_id_{i}"),
                RecordId::from((FACT_TABLE, relationship.id.as_str())),
            ));
            fact_contents.push((
                format!("fact_{i}"),
                FactContent {
                    subject: RecordId::from((ENTITY_TABLE, relationship.subject_id.as_str())),
                    predicate: relationship.predicate.clone(),
                    target: RecordId::from((ENTITY_TABLE, relationship.target_id.as_str())),
                    confidence: relationship.confidence,
                    source: relationship.source.clone(),
                    properties: Value::Object(relationship.properties.clone()),
                    created_at: timestamp(&relationship.created_at),
                },
            ));
        }
        sql.push_str("COMMIT TRANSACTION;");

        let staged: HashMap<String, String> = entity_rows
            .iter()
            .map(|row| (record_key(&row.id), row.created_at.clone()))
            .collect();
        let staged_ids: Vec<RecordId> = entity_rows.iter().map(|row| row.id.clone()).collect();
        let mut request = self.client.query(sql);
        if !entity_rows.is_empty() {
            request = request.bind(("entities", entity_rows));
        }
        for binding in fact_ids {
            request = request.bind(binding);
        }
        for binding in fact_contents {
            request = request.bind(binding);
        }

        request
            .await
            .and_then(|response| response.check())
            .map_err(|e| StorageError::Transaction(format!("Failed to commit unit: {}", e)))?;

        // INSERT IGNORE keeps the first writer's record, so a staged entity
        // was inserted by this commit only if the stored timestamp is ours
        let entities_created = if staged_ids.is_empty() {
            0
        } else {
            let stamps: Vec<EntityStamp> = self
                .client
                .query("SELECT id, created_at FROM $ids")
                .bind(("ids", staged_ids))
                .await
                .and_then(|mut response| response.take(0))
                .map_err(query_error("Failed to read committed entities"))?;
            stamps
                .iter()
                .filter(|stamp| {
                    staged.get(&record_key(&stamp.id)) == Some(&stamp.created_at)
                })
                .count()
        };

        debug!(
            transaction = %self.id,
            entities_staged = staged.len(),
            entities_created,
            relationships_created = self.relationships.len(),
            "Committed SurrealDB transaction"
        );
        Ok(CommitSummary {
            entities_created,
            relationships_created: self.relationships.len(),
        })
    }

    async fn rollback(self: Box<Self>) -> Result<(), StorageError> {
        debug!(
            transaction = %self.id,
            staged_entities = self.entity_order.len(),
            staged_relationships = self.relationships.len(),
            "Discarded SurrealDB transaction"
        );
        Ok(())
    }
}
