//! Configuration builder.
//!
//! This module provides a builder pattern API for creating configurations.

use super::{Result, models::*, validation};
use std::path::{Path, PathBuf};

/// Builder for creating AnamnesisConfig instances.
#[derive(Debug, Clone)]
pub struct ConfigBuilder {
    config: AnamnesisConfig,
}

impl ConfigBuilder {
    /// Create a new configuration builder with default values.
    pub fn new() -> Self {
        Self {
            config: AnamnesisConfig::default(),
        }
    }

    /// Set the base data directory.
    pub fn with_data_dir<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.storage.data_dir = path.as_ref().to_path_buf();
        self
    }

    /// Select the graph engine
    pub fn with_graph_engine(mut self, engine: GraphEngine) -> Self {
        self.config.storage.graph.engine = engine;
        self
    }

    /// Use the in-process graph and keep message content in memory (good for testing)
    pub fn with_memory_storage(mut self) -> Self {
        self.config.storage.graph.engine = GraphEngine::Memory;
        self.config.storage.content.kind = ContentSinkKind::Memory;
        self
    }

    /// Persist message content under `data_dir/<path>`
    pub fn with_file_content<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.storage.content.kind = ContentSinkKind::File;
        self.config.storage.content.path = path.as_ref().to_path_buf();
        self
    }

    /// Set the per-unit declaration limits.
    pub fn with_unit_limits(mut self, max_entities: usize, max_relationships: usize) -> Self {
        self.config.memory.max_entities_per_unit = max_entities;
        self.config.memory.max_relationships_per_unit = max_relationships;
        self
    }

    /// Limit applied to queries that do not carry their own
    pub fn with_default_query_limit(mut self, limit: usize) -> Self {
        self.config.memory.default_query_limit = Some(limit);
        self
    }

    /// Whether committed messages are restored on startup
    pub fn with_restore_on_open(mut self, restore: bool) -> Self {
        self.config.context.restore_on_open = restore;
        self
    }

    /// Set the log level.
    pub fn with_log_level(mut self, level: LogLevel) -> Self {
        self.config.logging.level = level;
        self
    }

    /// Set the log format.
    pub fn with_log_format(mut self, format: LogFormat) -> Self {
        self.config.logging.format = format;
        self
    }

    /// Configure logging to a file.
    pub fn with_log_file<P: AsRef<Path>>(mut self, path: P) -> Self {
        self.config.logging.file = Some(path.as_ref().to_path_buf());
        self
    }

    /// Create a configuration for automated testing.
    ///
    /// - In-memory graph and content
    /// - Test-specific data directory
    /// - Warn-level logging
    pub fn for_testing() -> Self {
        Self::new()
            .with_memory_storage()
            .with_data_dir(PathBuf::from("./test_data"))
            .with_restore_on_open(false)
            .with_log_level(LogLevel::Warn)
    }

    /// Create a configuration for development: in-memory storage, debug logging.
    pub fn development() -> Self {
        Self::new()
            .with_memory_storage()
            .with_log_level(LogLevel::Debug)
    }

    /// Build the configuration, validating it in the process.
    pub fn build(self) -> Result<AnamnesisConfig> {
        validation::validate_config(&self.config)?;

        Ok(self.config)
    }
}

impl Default for ConfigBuilder {
    fn default() -> Self {
        Self::new()
    }
}
