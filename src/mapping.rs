//! Mapping Specification model and parser.
//!
//! A mapping document is keyed by entity type. Each entity maps output field
//! names to a field rule, to `null` (an allowable-value field), or to a
//! nested group of further fields. A field rule is a mapping carrying at
//! least one marker key:
//!
//! - `$col_name`: read the named column from the row
//! - `$col_value`: a constant, or, next to `$col_name`, a value-translation
//!   table applied to the column value
//! - `$col_type`: coerce the result to `integer`, `float`, `string` or `boolean`
//!
//! Two reserved keys sit beside the fields: `_unique_id_col` names the
//! natural-key column and `_links` declares parent references as
//! `{parent: {source_fk_col: <rule>, target_fk_col: {$col_value: <field>}}}`.
//!
//! The document is parsed once into [`MappingSpec`]; nothing downstream
//! walks untyped YAML.

use std::{collections::BTreeMap, path::Path};

use anyhow::{Context, Result, anyhow, bail, ensure};

use crate::{
    documents::{self, YamlValue},
    entity::EntityType,
    value::{FieldType, Value},
};

pub const COL_NAME: &str = "$col_name";
pub const COL_VALUE: &str = "$col_value";
pub const COL_TYPE: &str = "$col_type";
pub const UNIQUE_ID_COL: &str = "_unique_id_col";
pub const LINKS: &str = "_links";
const SOURCE_FK_COL: &str = "source_fk_col";
const TARGET_FK_COL: &str = "target_fk_col";

#[derive(Debug, Clone, PartialEq)]
pub enum FieldRule {
    ColumnLookup {
        column: String,
    },
    Constant {
        value: Option<Value>,
    },
    TranslatedColumn {
        column: String,
        table: BTreeMap<String, Value>,
    },
    Typed {
        rule: Box<FieldRule>,
        field_type: FieldType,
    },
}

impl FieldRule {
    pub fn column(name: impl Into<String>) -> Self {
        FieldRule::ColumnLookup {
            column: name.into(),
        }
    }

    pub fn constant(value: impl Into<Value>) -> Self {
        FieldRule::Constant {
            value: Some(value.into()),
        }
    }

    /// The source column this rule reads, if any.
    pub fn source_column(&self) -> Option<&str> {
        match self {
            FieldRule::ColumnLookup { column } | FieldRule::TranslatedColumn { column, .. } => {
                Some(column)
            }
            FieldRule::Constant { .. } => None,
            FieldRule::Typed { rule, .. } => rule.source_column(),
        }
    }

    fn parse(node: &serde_yaml::Mapping) -> Result<Self> {
        let column = match node.get(COL_NAME) {
            None | Some(YamlValue::Null) => None,
            Some(YamlValue::String(name)) => Some(name.trim().to_string()),
            Some(other) => bail!("{COL_NAME} must be a column name, found {other:?}"),
        };
        let value = node.get(COL_VALUE);

        let rule = match (column, value) {
            (Some(column), Some(YamlValue::Mapping(entries))) => {
                let mut table = BTreeMap::new();
                for (from, to) in entries {
                    let from = Value::from_yaml(from)?
                        .ok_or_else(|| anyhow!("Translation keys cannot be null"))?;
                    let Some(to) = Value::from_yaml(to)? else {
                        continue;
                    };
                    table.insert(from.as_display(), to);
                }
                FieldRule::TranslatedColumn { column, table }
            }
            (Some(column), None | Some(YamlValue::Null)) => FieldRule::ColumnLookup { column },
            (Some(column), Some(other)) => bail!(
                "{COL_VALUE} beside {COL_NAME} '{column}' must be a translation table, found {other:?}"
            ),
            (None, Some(value)) => FieldRule::Constant {
                value: Value::from_yaml(value)?,
            },
            (None, None) => bail!("Field rule requires {COL_NAME} or {COL_VALUE}"),
        };

        match node.get(COL_TYPE) {
            None | Some(YamlValue::Null) => Ok(rule),
            Some(YamlValue::String(tag)) => Ok(FieldRule::Typed {
                rule: Box::new(rule),
                field_type: tag.parse().unwrap_or_else(|never| match never {}),
            }),
            Some(other) => bail!("{COL_TYPE} must be a type name, found {other:?}"),
        }
    }
}

/// One node of an entity's field tree.
#[derive(Debug, Clone, PartialEq)]
pub enum FieldNode {
    Rule(FieldRule),
    /// `null` in the document: filled from the schema registry, if any.
    Allowable,
    /// Grouping only; its fields are flattened into the payload.
    Group(Vec<(String, FieldNode)>),
}

impl FieldNode {
    fn parse(value: &YamlValue) -> Result<Self> {
        match value {
            YamlValue::Null => Ok(FieldNode::Allowable),
            YamlValue::Mapping(node) if is_leaf(node) => Ok(FieldNode::Rule(FieldRule::parse(node)?)),
            YamlValue::Mapping(node) => {
                let mut children = Vec::with_capacity(node.len());
                for (key, child) in node {
                    let name = key_name(key)?;
                    let parsed =
                        FieldNode::parse(child).with_context(|| format!("field '{name}'"))?;
                    children.push((name, parsed));
                }
                Ok(FieldNode::Group(children))
            }
            other => bail!("Expected a field rule, a group or null, found {other:?}"),
        }
    }
}

fn is_leaf(node: &serde_yaml::Mapping) -> bool {
    node.contains_key(COL_NAME) || node.contains_key(COL_VALUE)
}

fn key_name(key: &YamlValue) -> Result<String> {
    key.as_str()
        .map(str::to_string)
        .ok_or_else(|| anyhow!("Mapping keys must be strings, found {key:?}"))
}

/// A declared reference from an entity to its parent.
#[derive(Debug, Clone, PartialEq)]
pub struct LinkSpec {
    pub parent: EntityType,
    /// Produces the parent's natural key from the child row.
    pub source: FieldRule,
    /// Payload field that receives the parent's generated id.
    pub target_field: String,
}

impl LinkSpec {
    fn parse(parent: EntityType, value: &YamlValue) -> Result<Self> {
        let node = value
            .as_mapping()
            .ok_or_else(|| anyhow!("Link to {parent} must be a mapping"))?;
        let source = match node.get(SOURCE_FK_COL) {
            Some(YamlValue::Mapping(rule)) => FieldRule::parse(rule)?,
            Some(YamlValue::String(column)) => FieldRule::column(column.trim()),
            _ => bail!("Link to {parent} is missing {SOURCE_FK_COL}"),
        };
        let target_field = marker_string(node.get(TARGET_FK_COL))
            .ok_or_else(|| anyhow!("Link to {parent} is missing {TARGET_FK_COL}"))?;
        Ok(LinkSpec {
            parent,
            source,
            target_field,
        })
    }
}

/// Accepts either a bare string or `{$col_value: <string>}`.
fn marker_string(value: Option<&YamlValue>) -> Option<String> {
    match value? {
        YamlValue::String(s) => Some(s.trim().to_string()),
        YamlValue::Mapping(node) => node.get(COL_VALUE)?.as_str().map(|s| s.trim().to_string()),
        _ => None,
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EntityMapping {
    pub entity_type: EntityType,
    pub fields: Vec<(String, FieldNode)>,
    pub unique_id_col: Option<String>,
    pub links: Vec<LinkSpec>,
}

impl EntityMapping {
    pub fn new(entity_type: EntityType, unique_id_col: Option<&str>) -> Self {
        Self {
            entity_type,
            fields: Vec::new(),
            unique_id_col: unique_id_col.map(str::to_string),
            links: Vec::new(),
        }
    }

    pub fn field(mut self, name: impl Into<String>, rule: FieldRule) -> Self {
        self.fields.push((name.into(), FieldNode::Rule(rule)));
        self
    }

    pub fn allowable(mut self, name: impl Into<String>) -> Self {
        self.fields.push((name.into(), FieldNode::Allowable));
        self
    }

    pub fn link(mut self, parent: EntityType, source_column: &str, target_field: &str) -> Self {
        self.links.push(LinkSpec {
            parent,
            source: FieldRule::column(source_column),
            target_field: target_field.to_string(),
        });
        self
    }

    /// Counts leaf fields, looking through groups.
    pub fn leaf_count(&self) -> usize {
        fn count(nodes: &[(String, FieldNode)]) -> usize {
            nodes
                .iter()
                .map(|(_, node)| match node {
                    FieldNode::Group(children) => count(children),
                    _ => 1,
                })
                .sum()
        }
        count(&self.fields)
    }

    /// Payload field names produced by this mapping, groups flattened.
    pub fn leaf_names(&self) -> Vec<&str> {
        fn collect<'n>(nodes: &'n [(String, FieldNode)], out: &mut Vec<&'n str>) {
            for (name, node) in nodes {
                match node {
                    FieldNode::Group(children) => collect(children, out),
                    _ => out.push(name),
                }
            }
        }
        let mut names = Vec::with_capacity(self.fields.len());
        collect(&self.fields, &mut names);
        names
    }

    fn parse(entity_type: EntityType, value: &YamlValue) -> Result<Self> {
        let node = value
            .as_mapping()
            .ok_or_else(|| anyhow!("Mapping for {entity_type} must be a mapping"))?;
        let mut mapping = EntityMapping::new(entity_type, None);
        for (key, child) in node {
            let name = key_name(key)?;
            match name.as_str() {
                UNIQUE_ID_COL => {
                    mapping.unique_id_col = Some(
                        marker_string(Some(child))
                            .ok_or_else(|| anyhow!("{UNIQUE_ID_COL} must name a column"))?,
                    );
                }
                LINKS => {
                    let links = child
                        .as_mapping()
                        .ok_or_else(|| anyhow!("{LINKS} must be a mapping"))?;
                    for (parent, spec) in links {
                        let parent: EntityType = key_name(parent)?.parse()?;
                        mapping.links.push(LinkSpec::parse(parent, spec)?);
                    }
                }
                _ => {
                    let parsed =
                        FieldNode::parse(child).with_context(|| format!("field '{name}'"))?;
                    mapping.fields.push((name, parsed));
                }
            }
        }
        ensure!(
            mapping.unique_id_col.is_some() || entity_type == EntityType::FamilyRelationship,
            "{entity_type} must declare {UNIQUE_ID_COL}"
        );
        Ok(mapping)
    }
}

/// Parsed mapping document for one study.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MappingSpec {
    entities: BTreeMap<EntityType, EntityMapping>,
}

impl MappingSpec {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_entity(mut self, mapping: EntityMapping) -> Self {
        self.entities.insert(mapping.entity_type, mapping);
        self
    }

    pub fn load(path: &Path) -> Result<Self> {
        let document = documents::load_value(path)?;
        Self::from_value(&document).with_context(|| format!("Invalid mapping file {path:?}"))
    }

    pub fn from_value(document: &YamlValue) -> Result<Self> {
        let entities = document
            .as_mapping()
            .ok_or_else(|| anyhow!("Mapping document must be keyed by entity type"))?;
        let mut spec = MappingSpec::new();
        for (key, value) in entities {
            let entity_type: EntityType = key_name(key)?.parse()?;
            let mapping = EntityMapping::parse(entity_type, value)
                .with_context(|| format!("Parsing mapping for {entity_type}"))?;
            spec.entities.insert(entity_type, mapping);
        }
        Ok(spec)
    }

    pub fn get(&self, entity_type: EntityType) -> Option<&EntityMapping> {
        self.entities.get(&entity_type)
    }

    pub fn unique_id_col(&self, entity_type: EntityType) -> Option<&str> {
        self.get(entity_type)?.unique_id_col.as_deref()
    }

    pub fn entity_types(&self) -> impl Iterator<Item = EntityType> + '_ {
        self.entities.keys().copied()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::documents::{DocumentFormat, parse_str};

    fn parse(yaml: &str) -> Result<MappingSpec> {
        MappingSpec::from_value(&parse_str(yaml, DocumentFormat::Yaml).unwrap())
    }

    #[test]
    fn parses_every_rule_variant() {
        let spec = parse(
            r#"
participant:
  external_id: {$col_name: subjid}
  gender: {$col_name: sex, $col_value: {F: female, M: male}}
  is_proband: {$col_name: proband, $col_type: boolean}
  ethnicity: {$col_value: Not Reported}
  race: null
  _unique_id_col: {$col_value: subjid}
"#,
        )
        .unwrap();
        let mapping = spec.get(EntityType::Participant).unwrap();
        assert_eq!(mapping.unique_id_col.as_deref(), Some("subjid"));
        assert_eq!(mapping.fields[0].1, FieldNode::Rule(FieldRule::column("subjid")));
        match &mapping.fields[1].1 {
            FieldNode::Rule(FieldRule::TranslatedColumn { column, table }) => {
                assert_eq!(column, "sex");
                assert_eq!(table["F"], Value::from("female"));
            }
            other => panic!("unexpected {other:?}"),
        }
        assert!(matches!(
            &mapping.fields[2].1,
            FieldNode::Rule(FieldRule::Typed { field_type: FieldType::Boolean, .. })
        ));
        assert_eq!(mapping.fields[3].1, FieldNode::Rule(FieldRule::constant("Not Reported")));
        assert_eq!(mapping.fields[4].1, FieldNode::Allowable);
    }

    #[test]
    fn parses_links() {
        let spec = parse(
            r#"
participant:
  external_id: {$col_name: id}
  _unique_id_col: {$col_value: id}
  _links:
    study:
      source_fk_col: {$col_name: study_id}
      target_fk_col: {$col_value: study_id}
"#,
        )
        .unwrap();
        let link = &spec.get(EntityType::Participant).unwrap().links[0];
        assert_eq!(link.parent, EntityType::Study);
        assert_eq!(link.source.source_column(), Some("study_id"));
        assert_eq!(link.target_field, "study_id");
    }

    #[test]
    fn nested_groups_are_detected_structurally() {
        let spec = parse(
            r#"
biospecimen:
  sample:
    external_id: {$col_name: sample_name}
    composition: {$col_value: Blood}
  _unique_id_col: {$col_value: sample_name}
"#,
        )
        .unwrap();
        let mapping = spec.get(EntityType::Biospecimen).unwrap();
        assert_eq!(mapping.leaf_count(), 2);
        assert!(matches!(mapping.fields[0].1, FieldNode::Group(_)));
    }

    #[test]
    fn unique_id_col_is_required_except_for_family_relationships() {
        assert!(parse("study:\n  name: {$col_name: n}\n").is_err());
        assert!(parse("family_relationship:\n  mother: {$col_name: mother}\n").is_ok());
    }

    #[test]
    fn rejects_unknown_entities_and_incomplete_links() {
        assert!(parse("sample:\n  _unique_id_col: id\n").is_err());
        let incomplete = r#"
participant:
  _unique_id_col: id
  _links:
    study:
      source_fk_col: {$col_name: study_id}
"#;
        assert!(parse(incomplete).is_err());
    }

    #[test]
    fn scalar_value_beside_column_name_is_rejected() {
        let err = parse("study:\n  name: {$col_name: n, $col_value: fixed}\n  _unique_id_col: {$col_value: n}\n")
            .unwrap_err();
        assert!(format!("{err:#}").contains("translation table"));
        assert!(parse("study:\n  name: {$col_name: n, $col_value: null}\n  _unique_id_col: {$col_value: n}\n").is_ok());
    }
}
