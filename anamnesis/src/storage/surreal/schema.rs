//! Schema initialization for the SurrealDB graph backend

use crate::storage::errors::StorageError;
use surrealdb::{Connection, Surreal};

/// Define the entity and fact tables. Safe to run on every start.
pub async fn initialize_schema<C>(client: &Surreal<C>) -> Result<(), StorageError>
where
    C: Connection,
{
    // Entity record ids are the hex SHA-256 of the canonical (type, properties)
    // key, which makes INSERT IGNORE a create-if-absent primitive.
    let entity_table_query = r#"
        DEFINE TABLE IF NOT EXISTS entity SCHEMALESS
            COMMENT "Typed graph nodes keyed by their (type, properties) hash";

        DEFINE INDEX IF NOT EXISTS entity_type_idx ON entity FIELDS entity_type;
    "#;

    let fact_table_query = r#"
        DEFINE TABLE IF NOT EXISTS fact SCHEMALESS
            COMMENT "Directed, predicate-labelled relationships between entities";

        DEFINE INDEX IF NOT EXISTS fact_subject_idx ON fact FIELDS subject;
        DEFINE INDEX IF NOT EXISTS fact_target_idx ON fact FIELDS target;
        DEFINE INDEX IF NOT EXISTS fact_predicate_idx ON fact FIELDS predicate;
        DEFINE INDEX IF NOT EXISTS fact_created_at_idx ON fact FIELDS created_at;
    "#;

    for (name, query) in [("entity", entity_table_query), ("fact", fact_table_query)] {
        client
            .query(query)
            .await
            .and_then(|response| response.check())
            .map_err(|e| {
                StorageError::Configuration(format!("Failed to define {} table: {}", name, e))
            })?;
    }

    tracing::debug!("SurrealDB graph schema initialized");
    Ok(())
}
