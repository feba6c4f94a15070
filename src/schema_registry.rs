use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{Context, Result};
use log::debug;
use serde::{Deserialize, Serialize};

use crate::{documents, entity::EntityType, value::Value};

/// Sentinel written into string and enum fields that the source left empty.
pub const NOT_REPORTED: &str = "Not Reported";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(untagged)]
pub enum PropertyKind {
    One(String),
    Many(Vec<String>),
}

impl PropertyKind {
    fn includes(&self, kind: &str) -> bool {
        match self {
            PropertyKind::One(k) => k == kind,
            PropertyKind::Many(kinds) => kinds.iter().any(|k| k == kind),
        }
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PropertySchema {
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub kind: Option<PropertyKind>,
    #[serde(rename = "enum", default, skip_serializing_if = "Option::is_none")]
    pub allowed: Option<Vec<serde_json::Value>>,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct EntitySchema {
    #[serde(default)]
    pub required: BTreeSet<String>,
    #[serde(default)]
    pub properties: BTreeMap<String, PropertySchema>,
}

/// Required-field and type metadata per entity type.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SchemaRegistry {
    entities: BTreeMap<EntityType, EntitySchema>,
}

impl SchemaRegistry {
    pub fn load(path: &Path) -> Result<Self> {
        documents::load_from_path(path).with_context(|| format!("Loading schemas from {path:?}"))
    }

    pub fn with_entity(mut self, entity_type: EntityType, schema: EntitySchema) -> Self {
        self.entities.insert(entity_type, schema);
        self
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&EntitySchema> {
        self.entities.get(&entity_type)
    }

    pub fn required_fields(&self, entity_type: EntityType) -> BTreeSet<String> {
        self.get(entity_type)
            .map(|schema| schema.required.clone())
            .unwrap_or_default()
    }

    pub fn is_required(&self, entity_type: EntityType, field: &str) -> bool {
        self.get(entity_type)
            .is_some_and(|schema| schema.required.contains(field))
    }

    /// Value for a field the mapping declared as `null`.
    ///
    /// Enum fields and string fields (other than dates) become
    /// [`NOT_REPORTED`]; numeric and boolean fields stay null.
    pub fn allowable_value(&self, entity_type: EntityType, field: &str) -> Option<Value> {
        let Some(schema) = self.get(entity_type) else {
            debug!("No schema for {entity_type}; leaving '{field}' null");
            return None;
        };
        let Some(property) = schema.properties.get(field) else {
            debug!("No schema for property '{field}' of {entity_type}");
            return None;
        };
        let is_enum = property.allowed.is_some();
        let is_string = property.kind.as_ref().is_some_and(|k| k.includes("string"));
        if is_enum || (is_string && !field.ends_with("date")) {
            Some(Value::from(NOT_REPORTED))
        } else {
            None
        }
    }
}
