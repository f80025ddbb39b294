//! Entity records.
//!
//! An entity is the subject of rate limiting: a user, an API key, a
//! service. Entities may form a hierarchy; a child created with
//! `cascade = true` consumes from its parent's bucket in the same
//! transaction as its own.

use crate::error::Result;
use crate::validation;
use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

/// One `#META` record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Entity {
    pub entity_id: String,
    /// Human-readable display name.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Parent entity for hierarchical limiting.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_id: Option<String>,
    /// Whether acquires against this entity also consume from the parent.
    #[serde(default)]
    pub cascade: bool,
    /// Free-form string metadata. Flattened to one JSON attribute in the
    /// store to keep records nested-map-free.
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl Entity {
    pub fn new(entity_id: impl Into<String>) -> Self {
        Self {
            entity_id: entity_id.into(),
            name: None,
            parent_id: None,
            cascade: false,
            metadata: BTreeMap::new(),
        }
    }

    pub fn with_name(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }

    pub fn with_parent(mut self, parent_id: impl Into<String>, cascade: bool) -> Self {
        self.parent_id = Some(parent_id.into());
        self.cascade = cascade;
        self
    }

    pub fn with_metadata(mut self, metadata: BTreeMap<String, String>) -> Self {
        self.metadata = metadata;
        self
    }

    /// Validates the identifiers and the parent/cascade combination.
    pub fn validate(&self) -> Result<()> {
        validation::validate_entity_id(&self.entity_id)?;
        if let Some(parent) = &self.parent_id {
            validation::validate_entity_id(parent)?;
        }
        if self.cascade && self.parent_id.is_none() {
            return Err(crate::error::LimiterError::Validation(
                "cascade requires a parent_id".to_string(),
            ));
        }
        Ok(())
    }

    /// Whether acquires against this entity must also write the parent
    /// bucket.
    pub fn cascades(&self) -> bool {
        self.cascade && self.parent_id.is_some()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_builder_and_validate() {
        let entity = Entity::new("child-1").with_parent("parent-1", true);
        assert!(entity.validate().is_ok());
        assert!(entity.cascades());

        let leaf = Entity::new("u1");
        assert!(leaf.validate().is_ok());
        assert!(!leaf.cascades());
    }

    #[test]
    fn test_cascade_without_parent_rejected() {
        let mut entity = Entity::new("u1");
        entity.cascade = true;
        assert!(entity.validate().is_err());
    }

    #[test]
    fn test_bad_identifiers_rejected() {
        assert!(Entity::new("u#1").validate().is_err());
        assert!(Entity::new("ok").with_parent("p#1", true).validate().is_err());
    }
}
