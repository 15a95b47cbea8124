//! Core data model for the fact graph: entities, relationships and the
//! handles used to refer to them before and after a unit commits.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use uuid::Uuid;

/// Entity and relationship properties. Values are restricted to JSON
/// primitives (string, number, bool); see [`validate_properties`].
pub type Properties = serde_json::Map<String, Value>;

/// Backend identity of a committed entity
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityId(String);

impl EntityId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for EntityId {
    fn from(id: &str) -> Self {
        Self(id.to_string())
    }
}

impl From<String> for EntityId {
    fn from(id: String) -> Self {
        Self(id)
    }
}

/// Backend identity of a committed relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct RelationshipId(String);

impl RelationshipId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for RelationshipId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Handle to an entity declared inside one remember-unit.
///
/// Only meaningful to the unit that issued it; the unit id is carried so that a
/// handle leaking into another unit is rejected instead of silently aliasing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct LocalId {
    pub(crate) unit: Uuid,
    pub(crate) index: usize,
}

impl LocalId {
    /// Position of the declaration within its unit
    pub fn index(&self) -> usize {
        self.index
    }
}

impl fmt::Display for LocalId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "local#{}", self.index)
    }
}

/// Endpoint of a declared relationship
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub enum EntityRef {
    /// Entity declared in the same unit
    Local(LocalId),
    /// Entity already committed to the backend
    Existing(EntityId),
}

impl From<LocalId> for EntityRef {
    fn from(id: LocalId) -> Self {
        EntityRef::Local(id)
    }
}

impl From<EntityId> for EntityRef {
    fn from(id: EntityId) -> Self {
        EntityRef::Existing(id)
    }
}

impl From<&EntityId> for EntityRef {
    fn from(id: &EntityId) -> Self {
        EntityRef::Existing(id.clone())
    }
}

/// Matching key of an entity: SHA-256 over the canonical `(type, properties)` form.
///
/// Property order does not affect the key; value types do (`1` and `"1"` differ).
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(transparent)]
pub struct EntityKey(String);

impl EntityKey {
    pub fn new(entity_type: &str, properties: &Properties) -> Self {
        let sorted: BTreeMap<&String, &Value> = properties.iter().collect();
        let canonical = serde_json::json!([entity_type, sorted]);

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string().as_bytes());
        Self(format!("{:x}", hasher.finalize()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for EntityKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// Entity waiting to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EntityDraft {
    pub entity_type: String,
    pub properties: Properties,
}

impl EntityDraft {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.properties)
    }
}

/// Relationship with fully resolved endpoints, waiting to be written
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RelationshipDraft {
    pub subject_id: EntityId,
    pub predicate: String,
    pub target_id: EntityId,
    pub confidence: f64,
    pub source: String,
    pub properties: Properties,
}

/// Committed entity (graph node)
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub id: EntityId,
    pub entity_type: String,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

impl Entity {
    pub fn key(&self) -> EntityKey {
        EntityKey::new(&self.entity_type, &self.properties)
    }
}

/// Committed relationship (fact): a directed, predicate-labelled edge
/// carrying confidence and provenance.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Relationship {
    pub id: RelationshipId,
    pub subject_id: EntityId,
    pub predicate: String,
    pub target_id: EntityId,
    pub confidence: f64,
    pub source: String,
    pub properties: Properties,
    pub created_at: DateTime<Utc>,
}

/// One query result: a relationship together with both endpoints
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FactRecord {
    pub subject: Entity,
    pub relationship: Relationship,
    pub target: Entity,
}

/// Turn caller-supplied JSON into a property map.
///
/// `null` is treated as "no properties"; anything other than an object is rejected.
pub fn properties_from_value(value: Value) -> Result<Properties, String> {
    let properties = match value {
        Value::Null => Properties::new(),
        Value::Object(map) => map,
        other => {
            return Err(format!(
                "properties must be a JSON object, got {}",
                json_kind(&other)
            ));
        }
    };
    validate_properties(&properties)?;
    Ok(properties)
}

/// Check that every key is non-blank and every value is a primitive.
pub fn validate_properties(properties: &Properties) -> Result<(), String> {
    for (key, value) in properties {
        if key.trim().is_empty() {
            return Err("property keys cannot be empty".to_string());
        }
        match value {
            Value::String(_) | Value::Number(_) | Value::Bool(_) => {}
            other => {
                return Err(format!(
                    "property '{}' must be a string, number or bool, got {}",
                    key,
                    json_kind(other)
                ));
            }
        }
    }
    Ok(())
}

/// Confidence must be a finite value in `[0, 1]`.
pub fn validate_confidence(confidence: f64) -> Result<(), String> {
    if confidence.is_finite() && (0.0..=1.0).contains(&confidence) {
        Ok(())
    } else {
        Err(format!("confidence must be within [0, 1], got {}", confidence))
    }
}

fn json_kind(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn props(value: Value) -> Properties {
        properties_from_value(value).unwrap()
    }

    #[test]
    fn test_entity_key_ignores_property_order() {
        let a = props(json!({"name": "John Smith", "age": 42}));
        let mut b = Properties::new();
        b.insert("age".to_string(), json!(42));
        b.insert("name".to_string(), json!("John Smith"));

        assert_eq!(EntityKey::new("Person", &a), EntityKey::new("Person", &b));
    }

    #[test]
    fn test_entity_key_distinguishes_type_and_values() {
        let p = props(json!({"name": "Acme"}));
        assert_ne!(EntityKey::new("Person", &p), EntityKey::new("Organization", &p));

        let one = props(json!({"n": 1}));
        let text = props(json!({"n": "1"}));
        assert_ne!(EntityKey::new("T", &one), EntityKey::new("T", &text));
    }

    #[test]
    fn test_non_primitive_properties_rejected() {
        assert!(properties_from_value(json!({"tags": ["a", "b"]})).is_err());
        assert!(properties_from_value(json!({"nested": {"a": 1}})).is_err());
        assert!(properties_from_value(json!({"missing": null})).is_err());
        assert!(properties_from_value(json!("just a string")).is_err());
        assert!(properties_from_value(json!({"": 1})).is_err());
        assert!(properties_from_value(Value::Null).unwrap().is_empty());
    }

    #[test]
    fn test_confidence_bounds() {
        assert!(validate_confidence(0.0).is_ok());
        assert!(validate_confidence(1.0).is_ok());
        assert!(validate_confidence(0.42).is_ok());
        assert!(validate_confidence(1.5).is_err());
        assert!(validate_confidence(-0.1).is_err());
        assert!(validate_confidence(f64::NAN).is_err());
        assert!(validate_confidence(f64::INFINITY).is_err());
    }
}
