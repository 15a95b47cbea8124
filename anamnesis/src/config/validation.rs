//! Configuration validation utilities.

use super::ConfigError;
use super::models::*;

/// Validate the entire configuration.
pub fn validate_config(config: &AnamnesisConfig) -> Result<(), ConfigError> {
    validate_storage_config(&config.storage)?;
    validate_memory_config(&config.memory)?;

    Ok(())
}

fn validate_storage_config(config: &StorageConfig) -> Result<(), ConfigError> {
    if config.data_dir.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "Data directory cannot be empty".to_string(),
        ));
    }

    if config.graph.engine.is_surreal() {
        if config.graph.namespace.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "SurrealDB namespace cannot be empty".to_string(),
            ));
        }
        if config.graph.database.trim().is_empty() {
            return Err(ConfigError::ValidationError(
                "SurrealDB database cannot be empty".to_string(),
            ));
        }
    }

    if config.graph.engine == GraphEngine::SurrealRocksDb && config.graph.path.as_os_str().is_empty()
    {
        return Err(ConfigError::ValidationError(
            "Graph path cannot be empty for the RocksDB engine".to_string(),
        ));
    }

    if config.content.kind == ContentSinkKind::File && config.content.path.as_os_str().is_empty() {
        return Err(ConfigError::ValidationError(
            "Content path cannot be empty for the file sink".to_string(),
        ));
    }

    Ok(())
}

fn validate_memory_config(config: &MemoryConfig) -> Result<(), ConfigError> {
    if config.max_entities_per_unit == 0 {
        return Err(ConfigError::ValidationError(
            "max_entities_per_unit must be greater than 0".to_string(),
        ));
    }
    if config.max_relationships_per_unit == 0 {
        return Err(ConfigError::ValidationError(
            "max_relationships_per_unit must be greater than 0".to_string(),
        ));
    }
    if config.default_query_limit == Some(0) {
        return Err(ConfigError::ValidationError(
            "default_query_limit must be greater than 0 when set".to_string(),
        ));
    }

    Ok(())
}
