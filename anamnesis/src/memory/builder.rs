//! Declaration front-end for remember-units.
//!
//! A [`MemoryBuilder`] accumulates entity and relationship declarations for
//! one unit. Every declaration is validated as it is made and no backend I/O
//! happens here; the engine resolves and writes the unit afterwards.
//!
//! ```no_run
//! # use anamnesis::memory::builder::MemoryBuilder;
//! # use serde_json::json;
//! # fn declare(unit: &mut MemoryBuilder) -> anamnesis::Result<()> {
//! let john = unit.entity("Person", json!({"name": "John Smith"}))?;
//! let acme = unit.entity("Organization", json!({"name": "Acme"}))?;
//! unit.relationship(john, "worksAt", acme)
//!     .confidence(0.9)
//!     .source("conversation")
//!     .declare()?;
//! # Ok(())
//! # }
//! ```

use serde_json::Value;
use uuid::Uuid;

use super::types::{
    EntityDraft, EntityRef, LocalId, Properties, properties_from_value, validate_confidence,
    validate_properties,
};
use crate::{AnamnesisError, Result};

/// Upper bounds on the size of one unit
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct UnitLimits {
    pub max_entities: usize,
    pub max_relationships: usize,
}

impl Default for UnitLimits {
    fn default() -> Self {
        Self {
            max_entities: 1000,
            max_relationships: 1000,
        }
    }
}

/// Relationship as declared, with endpoints not yet resolved
#[derive(Debug, Clone, PartialEq)]
pub struct DeclaredRelationship {
    pub subject: EntityRef,
    pub predicate: String,
    pub target: EntityRef,
    pub confidence: f64,
    pub source: String,
    pub properties: Properties,
}

/// Position of a declared relationship within its unit
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FactHandle {
    index: usize,
}

impl FactHandle {
    pub fn index(&self) -> usize {
        self.index
    }
}

/// Accumulates the declarations of one remember-unit
#[derive(Debug)]
pub struct MemoryBuilder {
    unit_id: Uuid,
    limits: UnitLimits,
    entities: Vec<EntityDraft>,
    relationships: Vec<DeclaredRelationship>,
    poisoned: Option<String>,
}

impl MemoryBuilder {
    pub fn new(limits: UnitLimits) -> Self {
        Self {
            unit_id: Uuid::new_v4(),
            limits,
            entities: Vec::new(),
            relationships: Vec::new(),
            poisoned: None,
        }
    }

    pub fn unit_id(&self) -> Uuid {
        self.unit_id
    }

    /// Declare an entity from a JSON object of primitive properties
    pub fn entity(
        &mut self,
        entity_type: impl Into<String>,
        properties: Value,
    ) -> Result<LocalId> {
        match properties_from_value(properties) {
            Ok(properties) => self.entity_with(entity_type, properties),
            Err(message) => Err(self.reject(message)),
        }
    }

    /// Declare an entity from an already-built property map
    pub fn entity_with(
        &mut self,
        entity_type: impl Into<String>,
        properties: Properties,
    ) -> Result<LocalId> {
        let entity_type = entity_type.into();
        if entity_type.trim().is_empty() {
            return Err(self.reject("entity type cannot be empty".to_string()));
        }
        if let Err(message) = validate_properties(&properties) {
            return Err(self.reject(message));
        }
        if self.entities.len() >= self.limits.max_entities {
            return Err(self.reject(format!(
                "unit exceeds the limit of {} entities",
                self.limits.max_entities
            )));
        }

        let id = LocalId {
            unit: self.unit_id,
            index: self.entities.len(),
        };
        self.entities.push(EntityDraft {
            entity_type,
            properties,
        });
        Ok(id)
    }

    /// Start declaring a relationship. Confidence defaults to `1.0`; a source
    /// must be supplied before [`RelationshipBuilder::declare`].
    pub fn relationship(
        &mut self,
        subject: impl Into<EntityRef>,
        predicate: impl Into<String>,
        target: impl Into<EntityRef>,
    ) -> RelationshipBuilder<'_> {
        RelationshipBuilder {
            subject: subject.into(),
            predicate: predicate.into(),
            target: target.into(),
            confidence: 1.0,
            source: None,
            properties: Value::Null,
            unit: self,
        }
    }

    /// Declare a relationship with every field given up front
    pub fn declare_relationship(
        &mut self,
        subject: impl Into<EntityRef>,
        predicate: impl Into<String>,
        target: impl Into<EntityRef>,
        confidence: f64,
        source: impl Into<String>,
        properties: Value,
    ) -> Result<FactHandle> {
        self.relationship(subject, predicate, target)
            .confidence(confidence)
            .source(source)
            .properties(properties)
            .declare()
    }

    pub fn entities(&self) -> &[EntityDraft] {
        &self.entities
    }

    pub fn relationships(&self) -> &[DeclaredRelationship] {
        &self.relationships
    }

    pub fn is_empty(&self) -> bool {
        self.entities.is_empty() && self.relationships.is_empty()
    }

    /// Fails if any earlier declaration in this unit was rejected
    pub(crate) fn check_committable(&self) -> Result<()> {
        match &self.poisoned {
            Some(reason) => Err(AnamnesisError::Validation(format!(
                "unit {} has a rejected declaration and cannot be committed: {}",
                self.unit_id, reason
            ))),
            None => Ok(()),
        }
    }

    pub(crate) fn into_parts(self) -> (Uuid, Vec<EntityDraft>, Vec<DeclaredRelationship>) {
        (self.unit_id, self.entities, self.relationships)
    }

    fn reject(&mut self, message: String) -> AnamnesisError {
        if self.poisoned.is_none() {
            self.poisoned = Some(message.clone());
        }
        AnamnesisError::Validation(message)
    }

    fn check_ref(&self, role: &str, reference: &EntityRef) -> std::result::Result<(), String> {
        match reference {
            EntityRef::Local(local) if local.unit != self.unit_id => {
                Err(format!("{} {} was declared in another unit", role, local))
            }
            EntityRef::Local(local) if local.index >= self.entities.len() => {
                Err(format!("{} {} is not declared in this unit", role, local))
            }
            EntityRef::Existing(id) if id.as_str().trim().is_empty() => {
                Err(format!("{} entity id cannot be empty", role))
            }
            _ => Ok(()),
        }
    }
}

/// In-progress relationship declaration
#[must_use = "a relationship is only recorded once `declare` is called"]
#[derive(Debug)]
pub struct RelationshipBuilder<'a> {
    unit: &'a mut MemoryBuilder,
    subject: EntityRef,
    predicate: String,
    target: EntityRef,
    confidence: f64,
    source: Option<String>,
    properties: Value,
}

impl RelationshipBuilder<'_> {
    pub fn confidence(mut self, confidence: f64) -> Self {
        self.confidence = confidence;
        self
    }

    /// Provenance of the fact
    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = Some(source.into());
        self
    }

    pub fn properties(mut self, properties: Value) -> Self {
        self.properties = properties;
        self
    }

    /// Validate and record the relationship in the unit
    pub fn declare(self) -> Result<FactHandle> {
        let RelationshipBuilder {
            unit,
            subject,
            predicate,
            target,
            confidence,
            source,
            properties,
        } = self;

        let checked = (|| {
            if predicate.trim().is_empty() {
                return Err("predicate cannot be empty".to_string());
            }
            validate_confidence(confidence)?;
            let source = match source {
                Some(source) if !source.trim().is_empty() => source,
                _ => return Err("relationship source cannot be empty".to_string()),
            };
            unit.check_ref("subject", &subject)?;
            unit.check_ref("target", &target)?;
            let properties = properties_from_value(properties)?;
            if unit.relationships.len() >= unit.limits.max_relationships {
                return Err(format!(
                    "unit exceeds the limit of {} relationships",
                    unit.limits.max_relationships
                ));
            }
            Ok((source, properties))
        })();

        let (source, properties) = match checked {
            Ok(fields) => fields,
            Err(message) => return Err(unit.reject(message)),
        };

        let handle = FactHandle {
            index: unit.relationships.len(),
        };
        unit.relationships.push(DeclaredRelationship {
            subject,
            predicate,
            target,
            confidence,
            source,
            properties,
        });
        Ok(handle)
    }
}
