//! # Anamnesis
//!
//! Semantic memory and context persistence for autonomous agents:
//!
//! - **Fact memory**: typed entities and directed, predicate-labelled
//!   relationships with confidence and provenance, written in atomic units
//!   that deduplicate entities against everything already remembered.
//! - **Conversation ledger**: an append-only sequence of messages whose
//!   content is streamed in per slot and becomes visible only on commit.
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use anamnesis::prelude::*;
//! use serde_json::json;
//!
//! async fn example() -> Result<()> {
//!     let anamnesis = Anamnesis::for_testing();
//!
//!     // Remember a unit of facts; it lands completely or not at all
//!     anamnesis
//!         .memory()
//!         .remember(|unit| {
//!             let alice = unit.entity("Person", json!({"name": "Alice"}))?;
//!             let acme = unit.entity("Company", json!({"name": "Acme"}))?;
//!             unit.relationship(alice, "works_at", acme)
//!                 .confidence(0.9)
//!                 .source("onboarding call")
//!                 .declare()?;
//!             Ok(())
//!         })
//!         .await?;
//!
//!     let facts = anamnesis
//!         .memory()
//!         .query_all("(Person {name: \"Alice\"})-[works_at]->(Company)")
//!         .await?;
//!     assert_eq!(facts.len(), 1);
//!
//!     // Stream a message into the ledger
//!     let message = anamnesis.context().new_message(Role::Assistant)?;
//!     let mut text = message.new_text_content()?;
//!     text.append("Hello, ");
//!     text.append("world");
//!     text.close().await?;
//!     message.commit().await?;
//!
//!     Ok(())
//! }
//! ```

pub mod config;
pub mod context;
pub mod logging;
pub mod memory;
pub mod storage;

use std::sync::Arc;
use tracing::info;

use crate::context::ContextStore;
use crate::memory::MemoryEngine;

/// The prelude re-exports commonly used types for convenience
pub mod prelude {
    pub use crate::{Anamnesis, init, init_with_defaults};

    pub use crate::config::{AnamnesisConfig, ConfigBuilder, ConfigLoader, LogLevel};

    pub use crate::memory::{
        Entity, EntityId, EntityPattern, EntityRef, FactQuery, FactRecord, LocalId, MemoryBuilder,
        MemoryEngine, Relationship, RelationshipId, Remembered, UnitReceipt,
    };

    pub use crate::context::{
        ContentAppender, ContextStore, Message, MessageId, MessageStore, Role,
    };

    pub use crate::storage::{GraphBackend, StorageError};

    pub use crate::{AnamnesisError, Result};
}

/// Current library version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Error type for Anamnesis operations
#[derive(Debug, thiserror::Error)]
pub enum AnamnesisError {
    /// A declaration, query or content item is malformed; nothing was written
    #[error("Validation error: {0}")]
    Validation(String),

    /// The backend or content sink failed
    #[error("Storage error: {0}")]
    Storage(String),

    /// The operation is not allowed in the object's current state
    #[error("State error: {0}")]
    State(String),

    /// A referenced entity, message or slot does not exist
    #[error("Not found: {0}")]
    NotFound(String),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Configuration(String),

    /// Logging error
    #[error("Logging error: {0}")]
    Logging(#[from] crate::logging::LogError),

    /// Other unclassified errors
    #[error("{0}")]
    Other(String),
}

/// Result type for Anamnesis operations
pub type Result<T> = std::result::Result<T, AnamnesisError>;

/// Fact memory and conversation ledger wired to one configuration
#[derive(Debug, Clone)]
pub struct Anamnesis {
    memory: MemoryEngine,
    context: ContextStore,
    _logging: Arc<logging::LoggingGuard>,
}

impl Anamnesis {
    /// Assemble from already constructed parts
    pub fn from_parts(memory: MemoryEngine, context: ContextStore) -> Self {
        Self {
            memory,
            context,
            _logging: Arc::new(logging::LoggingGuard::default()),
        }
    }

    /// In-memory graph and ledger, no logging setup
    pub fn for_testing() -> Self {
        let backend = Arc::new(storage::InMemoryGraphBackend::new());
        Self::from_parts(MemoryEngine::new(backend), ContextStore::in_memory())
    }

    pub fn memory(&self) -> &MemoryEngine {
        &self.memory
    }

    pub fn context(&self) -> &ContextStore {
        &self.context
    }
}

/// Initialize Anamnesis with configuration from the default files and the
/// environment
pub async fn init_with_defaults() -> Result<Anamnesis> {
    let config = config::ConfigLoader::new()
        .load_default_files()
        .load_env()
        .extract()?;
    init(config).await
}

/// Initialize Anamnesis with the provided configuration
///
/// Installs logging, builds the graph backend and content sink, and restores
/// the committed ledger when `context.restore_on_open` is set.
pub async fn init(config: config::AnamnesisConfig) -> Result<Anamnesis> {
    config::validate_config(&config)?;
    let logging = logging::init(&config.logging)?;

    let backend = storage::create_graph_backend(&config).await?;
    let memory = MemoryEngine::with_config(backend, &config.memory);

    let sink = storage::create_content_sink(&config)?;
    let context = if config.context.restore_on_open {
        ContextStore::open(sink).await?
    } else {
        ContextStore::new(sink)
    };

    info!(
        version = VERSION,
        engine = ?config.storage.graph.engine,
        content = ?config.storage.content.kind,
        "Anamnesis initialized"
    );

    Ok(Anamnesis {
        memory,
        context,
        _logging: Arc::new(logging),
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_init_with_testing_config() {
        let config = config::ConfigBuilder::for_testing().build().unwrap();
        let anamnesis = init(config).await.unwrap();
        assert_eq!(anamnesis.memory().stats().await.unwrap().entity_count, 0);
        assert!(anamnesis.context().list_messages().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_init_rejects_invalid_config() {
        let mut config = config::AnamnesisConfig::default();
        config.memory.max_entities_per_unit = 0;
        let err = init(config).await.unwrap_err();
        assert!(matches!(err, AnamnesisError::Configuration(_)));
    }
}
