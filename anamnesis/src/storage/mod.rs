//! Storage abstractions and implementations
//!
//! ## Graph backends
//!
//! - **InMemoryGraphBackend**: process-local copy-on-write graph; no persistence.
//! - **SurrealGraphBackend**: embedded SurrealDB, in memory or on RocksDB
//!   (feature `surrealdb-embedded`).
//!
//! ## Content sinks
//!
//! - **MemoryContentSink**: keeps message content in process memory.
//! - **FileContentSink**: one directory per message with a commit marker.

pub mod content;
pub mod errors;
pub mod memory_graph;
#[cfg(feature = "surrealdb-embedded")]
pub mod surreal;
pub mod traits;

use std::sync::Arc;
use tracing::info;

use crate::config::{AnamnesisConfig, ContentSinkKind, GraphEngine};

pub use content::{FileContentSink, MemoryContentSink};
pub use errors::{StorageError, StorageResult};
pub use memory_graph::InMemoryGraphBackend;
#[cfg(feature = "surrealdb-embedded")]
pub use surreal::SurrealGraphBackend;
pub use traits::{
    CommitSummary, ContentSink, FactStream, GraphBackend, GraphStats, GraphTransaction,
};

/// Create the graph backend selected by configuration
pub async fn create_graph_backend(
    config: &AnamnesisConfig,
) -> Result<Arc<dyn GraphBackend>, StorageError> {
    let graph = &config.storage.graph;
    match graph.engine {
        GraphEngine::Memory => {
            info!("Using in-memory graph backend");
            Ok(Arc::new(InMemoryGraphBackend::new()))
        }
        #[cfg(feature = "surrealdb-embedded")]
        GraphEngine::SurrealMemory => {
            let backend = SurrealGraphBackend::memory(&graph.namespace, &graph.database).await?;
            Ok(Arc::new(backend))
        }
        #[cfg(feature = "surrealdb-embedded")]
        GraphEngine::SurrealRocksDb => {
            let path = config.storage.resolve(&graph.path);
            if let Some(parent) = path.parent() {
                std::fs::create_dir_all(parent)?;
            }
            let backend = SurrealGraphBackend::rocksdb(
                &path.to_string_lossy(),
                &graph.namespace,
                &graph.database,
            )
            .await?;
            Ok(Arc::new(backend))
        }
        #[cfg(not(feature = "surrealdb-embedded"))]
        engine => Err(StorageError::Configuration(format!(
            "Graph engine {:?} requires the 'surrealdb-embedded' feature",
            engine
        ))),
    }
}

/// Create the message content sink selected by configuration
pub fn create_content_sink(config: &AnamnesisConfig) -> Result<Arc<dyn ContentSink>, StorageError> {
    match config.storage.content.kind {
        ContentSinkKind::Memory => Ok(Arc::new(MemoryContentSink::new())),
        ContentSinkKind::File => {
            let root = config.storage.resolve(&config.storage.content.path);
            info!(root = %root.display(), "Using file content sink");
            Ok(Arc::new(FileContentSink::new(root)))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::ConfigBuilder;

    #[tokio::test]
    async fn test_factories_for_testing_config() {
        let config = ConfigBuilder::for_testing().build().unwrap();
        let backend = create_graph_backend(&config).await.unwrap();
        assert!(backend.health_check().await.unwrap());
        assert_eq!(backend.stats().await.unwrap(), GraphStats::default());

        let sink = create_content_sink(&config).unwrap();
        assert!(sink.load_committed().await.unwrap().is_empty());
    }

    #[cfg(feature = "surrealdb-embedded")]
    #[tokio::test]
    async fn test_rocksdb_backend_under_data_dir() {
        let dir = tempfile::tempdir().unwrap();
        let config = ConfigBuilder::new()
            .with_data_dir(dir.path())
            .with_graph_engine(GraphEngine::SurrealRocksDb)
            .build()
            .unwrap();
        let backend = create_graph_backend(&config).await.unwrap();
        assert!(backend.health_check().await.unwrap());
        assert!(dir.path().join("graph").exists());
    }
}
