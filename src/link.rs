use log::debug;
use thiserror::Error;

use crate::{
    cache::IdentifierCache,
    entity::EntityType,
    mapper::Payload,
    schema_registry::SchemaRegistry,
    value::{Record, Value},
};

/// A payload whose required parent has not been loaded.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
#[error("{entity_type} '{natural_key}': required {parent} '{source_key}' not found for '{target_field}'")]
pub struct MissingParent {
    pub entity_type: EntityType,
    pub natural_key: String,
    pub parent: EntityType,
    pub source_key: String,
    pub target_field: String,
}

/// A payload ready for persistence: foreign keys merged in, private keys
/// removed, natural key carried alongside for the identifier cache.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkedPayload {
    pub natural_key: Option<String>,
    pub record: Record,
}

/// Substitutes parent natural keys with generated ids from the cache.
pub struct LinkResolver<'a> {
    cache: &'a IdentifierCache,
    schemas: Option<&'a SchemaRegistry>,
}

impl<'a> LinkResolver<'a> {
    pub fn new(cache: &'a IdentifierCache, schemas: Option<&'a SchemaRegistry>) -> Self {
        Self { cache, schemas }
    }

    pub fn resolve(&self, payload: Payload) -> Result<LinkedPayload, MissingParent> {
        let Payload {
            entity_type,
            mut fields,
            unique_id,
            links,
        } = payload;

        for link in links {
            let resolved = link
                .source_value
                .as_ref()
                .and_then(|key| self.cache.get(link.parent, key));
            match resolved {
                Some(id) => {
                    fields.insert(link.target_field, Some(Value::from(id)));
                }
                None if self.is_required(entity_type, &link.target_field) => {
                    return Err(MissingParent {
                        entity_type,
                        natural_key: unique_id.unwrap_or_default(),
                        parent: link.parent,
                        source_key: link
                            .source_value
                            .map(|v| v.as_display())
                            .unwrap_or_default(),
                        target_field: link.target_field,
                    });
                }
                None => {
                    debug!(
                        "{entity_type} '{}': optional {} '{}' not found; '{}' left null",
                        unique_id.as_deref().unwrap_or_default(),
                        link.parent,
                        link.source_value
                            .as_ref()
                            .map(Value::as_display)
                            .unwrap_or_default(),
                        link.target_field
                    );
                    fields.insert(link.target_field, None);
                }
            }
        }

        Ok(LinkedPayload {
            natural_key: unique_id,
            record: fields,
        })
    }

    fn is_required(&self, entity_type: EntityType, field: &str) -> bool {
        self.schemas
            .is_some_and(|schemas| schemas.is_required(entity_type, field))
    }
}
