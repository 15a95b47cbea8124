//! Fact memory
//!
//! Facts are stored as a graph of typed entities connected by
//! predicate-labelled relationships that carry a confidence and a source.
//! Writes happen in remember-units: declarations are collected by a
//! [`MemoryBuilder`], deduplicated by the [`EntityResolver`] and written
//! atomically by the [`MemoryEngine`]. Queries only ever see committed units.

pub mod builder;
pub mod engine;
pub mod query;
pub mod resolver;
pub mod types;

pub use builder::{DeclaredRelationship, FactHandle, MemoryBuilder, RelationshipBuilder, UnitLimits};
pub use engine::{MemoryEngine, Remembered, UnitReceipt};
pub use query::{
    EntityPattern, FactOrder, FactOrderField, FactQuery, QueryParseError, SortDirection,
};
pub use resolver::{EntityResolver, Resolution, ResolvedUnit};
pub use types::{
    Entity, EntityDraft, EntityId, EntityKey, EntityRef, FactRecord, LocalId, Properties,
    Relationship, RelationshipDraft, RelationshipId,
};
