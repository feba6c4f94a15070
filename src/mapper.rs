use std::{cell::RefCell, collections::BTreeSet};

use anyhow::{Result, anyhow};
use log::{debug, warn};

use crate::{
    entity::EntityType,
    extract::Row,
    mapping::{EntityMapping, FieldNode, FieldRule, MappingSpec},
    schema_registry::SchemaRegistry,
    value::{Record, Value},
};

/// A parent reference captured at mapping time, resolved later against the
/// identifier cache.
#[derive(Debug, Clone, PartialEq)]
pub struct PendingLink {
    pub parent: EntityType,
    pub source_value: Option<Value>,
    pub target_field: String,
}

/// The mapped, not yet persisted, form of one source row.
#[derive(Debug, Clone, PartialEq)]
pub struct Payload {
    pub entity_type: EntityType,
    pub fields: Record,
    /// Natural key, already coerced to its string form.
    pub unique_id: Option<String>,
    pub links: Vec<PendingLink>,
}

impl Payload {
    pub fn new(entity_type: EntityType, unique_id: Option<String>) -> Self {
        Self {
            entity_type,
            fields: Record::new(),
            unique_id,
            links: Vec::new(),
        }
    }

    pub fn get(&self, field: &str) -> Option<&Value> {
        self.fields.get(field).and_then(|v| v.as_ref())
    }

    pub fn natural_key(&self) -> &str {
        self.unique_id.as_deref().unwrap_or("<none>")
    }
}

/// Interprets a [`MappingSpec`] against source rows.
pub struct Mapper<'a> {
    mappings: &'a MappingSpec,
    schemas: Option<&'a SchemaRegistry>,
    reported_columns: RefCell<BTreeSet<(EntityType, String)>>,
}

impl<'a> Mapper<'a> {
    pub fn new(mappings: &'a MappingSpec) -> Self {
        Self {
            mappings,
            schemas: None,
            reported_columns: RefCell::new(BTreeSet::new()),
        }
    }

    /// Fills allowable-value fields from `schemas`.
    pub fn with_schemas(mut self, schemas: &'a SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn mappings(&self) -> &'a MappingSpec {
        self.mappings
    }

    pub fn unique_id_col(&self, entity_type: EntityType) -> Option<&'a str> {
        self.mappings.unique_id_col(entity_type)
    }

    pub fn build_entity(&self, entity_type: EntityType, row: &Row) -> Result<Payload> {
        let mapping = self
            .mappings
            .get(entity_type)
            .ok_or_else(|| anyhow!("No mapping defined for {entity_type}"))?;

        let unique_id = mapping
            .unique_id_col
            .as_deref()
            .and_then(|col| row.get(col))
            .map(Value::as_display);
        let mut payload = Payload::new(entity_type, unique_id);

        self.map_nodes(mapping, &mapping.fields, row, &mut payload.fields);

        for link in &mapping.links {
            let source_value = self.map_value(entity_type, &link.source, row, &link.target_field);
            payload.links.push(PendingLink {
                parent: link.parent,
                source_value,
                target_field: link.target_field.clone(),
            });
        }
        Ok(payload)
    }

    fn map_nodes(
        &self,
        mapping: &EntityMapping,
        nodes: &[(String, FieldNode)],
        row: &Row,
        out: &mut Record,
    ) {
        for (name, node) in nodes {
            match node {
                FieldNode::Rule(rule) => {
                    let value = self.map_value(mapping.entity_type, rule, row, name);
                    out.insert(name.clone(), value);
                }
                FieldNode::Allowable => {
                    let value = self
                        .schemas
                        .and_then(|s| s.allowable_value(mapping.entity_type, name));
                    out.insert(name.clone(), value);
                }
                FieldNode::Group(children) => self.map_nodes(mapping, children, row, out),
            }
        }
    }

    fn map_value(
        &self,
        entity_type: EntityType,
        rule: &FieldRule,
        row: &Row,
        field: &str,
    ) -> Option<Value> {
        match rule {
            FieldRule::ColumnLookup { column } => self.lookup(entity_type, row, column, field),
            FieldRule::TranslatedColumn { column, table } => self
                .lookup(entity_type, row, column, field)
                .map(|value| table.get(&value.as_display()).cloned().unwrap_or(value)),
            FieldRule::Constant { value } => value.clone(),
            FieldRule::Typed { rule, field_type } => {
                let value = self.map_value(entity_type, rule, row, field)?;
                match field_type.coerce(value) {
                    Ok(coerced) => Some(coerced),
                    Err(err) => {
                        warn!(
                            "{entity_type} {}: cannot coerce '{field}' to {field_type} ({err}); using null",
                            describe_row(self.unique_id_col(entity_type), row)
                        );
                        None
                    }
                }
            }
        }
    }

    fn lookup(
        &self,
        entity_type: EntityType,
        row: &Row,
        column: &str,
        field: &str,
    ) -> Option<Value> {
        if !row.contains(column) {
            let first = self
                .reported_columns
                .borrow_mut()
                .insert((entity_type, column.to_string()));
            if first {
                warn!(
                    "Column \"{column}\" not found in source data for {entity_type}; \
                     filling null for \"{field}\""
                );
            } else {
                debug!("Column \"{column}\" missing for {entity_type} field \"{field}\"");
            }
            return None;
        }
        row.get(column).cloned()
    }
}

fn describe_row(unique_id_col: Option<&str>, row: &Row) -> String {
    unique_id_col
        .and_then(|col| row.get(col))
        .map(|v| format!("'{v}'"))
        .unwrap_or_else(|| "row".to_string())
}
