//! Trait definitions for the graph backend and the content sink

use async_trait::async_trait;
use futures::Stream;
use serde::{Deserialize, Serialize};
use std::fmt::Debug;
use std::pin::Pin;

use crate::context::message::{Content, Message, MessageId};
use crate::memory::query::FactQuery;
use crate::memory::types::{
    Entity, EntityDraft, EntityId, FactRecord, Relationship, RelationshipDraft,
};
use crate::storage::errors::StorageError;

/// Lazily produced query results
pub type FactStream = Pin<Box<dyn Stream<Item = Result<FactRecord, StorageError>> + Send>>;

/// Counts reported by [`GraphBackend::stats`]
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct GraphStats {
    pub entity_count: usize,
    pub relationship_count: usize,
}

/// What a committed transaction actually inserted
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CommitSummary {
    /// Staged entities that were still absent at commit. Entities another
    /// transaction inserted first are not counted.
    pub entities_created: usize,
    pub relationships_created: usize,
}

/// A graph database holding committed entities and relationships.
///
/// Entity identity is derived from the [`EntityKey`](crate::memory::types::EntityKey)
/// of `(type, properties)`, so every backend assigns the same id to equal
/// entities and concurrent creations converge on one node.
#[async_trait]
pub trait GraphBackend: Send + Sync + 'static + Debug {
    /// Check if the backend is healthy and available
    async fn health_check(&self) -> Result<bool, StorageError>;

    /// Find a committed entity with exactly this type and property set
    async fn find_entity(&self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError>;

    /// Get a committed entity by id
    async fn get_entity(&self, id: &EntityId) -> Result<Option<Entity>, StorageError>;

    /// Open a write transaction. Nothing it stages is visible until `commit`.
    async fn begin(&self) -> Result<Box<dyn GraphTransaction>, StorageError>;

    /// Run a read-only query against one consistent snapshot
    async fn query(&self, query: &FactQuery) -> Result<FactStream, StorageError>;

    async fn stats(&self) -> Result<GraphStats, StorageError>;
}

/// Staged writes against a [`GraphBackend`].
///
/// Dropping a transaction without committing discards everything it staged.
#[async_trait]
pub trait GraphTransaction: Send {
    /// Find an entity by key among committed and staged entities
    async fn find_entity(&mut self, draft: &EntityDraft) -> Result<Option<Entity>, StorageError>;

    /// Get an entity by id among committed and staged entities
    async fn get_entity(&mut self, id: &EntityId) -> Result<Option<Entity>, StorageError>;

    /// Create the entity unless one with the same key already exists; returns
    /// whichever entity the key now refers to.
    async fn create_entity(&mut self, draft: EntityDraft) -> Result<Entity, StorageError>;

    /// Stage a relationship. Both endpoints must exist or be staged.
    async fn create_relationship(
        &mut self,
        draft: RelationshipDraft,
    ) -> Result<Relationship, StorageError>;

    /// Make every staged write visible at once
    async fn commit(self: Box<Self>) -> Result<CommitSummary, StorageError>;

    /// Discard every staged write
    async fn rollback(self: Box<Self>) -> Result<(), StorageError>;
}

/// Durable destination for message content.
///
/// Content is appended slot by slot as appenders close; a message becomes
/// part of the committed history only once `commit_message` succeeds.
#[async_trait]
pub trait ContentSink: Send + Sync + 'static + Debug {
    /// Persist the final content of one slot
    async fn append_content(
        &self,
        message_id: MessageId,
        slot: usize,
        content: &Content,
    ) -> Result<(), StorageError>;

    /// Persist the commit marker for a message
    async fn commit_message(&self, message: &Message) -> Result<(), StorageError>;

    /// Load every committed message, oldest first
    async fn load_committed(&self) -> Result<Vec<Message>, StorageError>;

    /// Highest message id the sink holds anything for, committed or not
    async fn highest_message_id(&self) -> Result<Option<MessageId>, StorageError>;
}
