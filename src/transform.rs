use std::collections::BTreeMap;

use anyhow::{Context, Result};
use itertools::Itertools;
use log::{debug, info};

use crate::{
    entity::EntityType,
    extract::{Extraction, Row},
    mapper::{Mapper, Payload},
};

/// Payloads per entity type, in source order.
pub type EntityPayloads = BTreeMap<EntityType, Vec<Payload>>;

/// Drives the [`Mapper`] over every requested entity type.
pub struct Transformer<'a> {
    mapper: Mapper<'a>,
    nrows: Option<usize>,
}

impl<'a> Transformer<'a> {
    pub fn new(mapper: Mapper<'a>) -> Self {
        Self {
            mapper,
            nrows: None,
        }
    }

    /// Map at most `nrows` rows per entity type.
    pub fn with_row_limit(mut self, nrows: Option<usize>) -> Self {
        self.nrows = nrows;
        self
    }

    pub fn mapper(&self) -> &Mapper<'a> {
        &self.mapper
    }

    pub fn run(&self, extraction: &Extraction, entity_types: &[EntityType]) -> Result<EntityPayloads> {
        let mut output = EntityPayloads::new();
        for &entity_type in entity_types {
            let Some(rows) = self.select_rows(extraction, entity_type) else {
                continue;
            };
            let limit = self.nrows.unwrap_or(usize::MAX);
            let payloads = rows
                .into_iter()
                .take(limit)
                .map(|row| self.mapper.build_entity(entity_type, row))
                .collect::<Result<Vec<_>>>()
                .with_context(|| format!("Transforming {entity_type} rows"))?;
            info!("Transformed {} {entity_type} payload(s)", payloads.len());
            output.insert(entity_type, payloads);
        }
        Ok(output)
    }

    /// Rows for `entity_type`, deduplicated by natural key (first occurrence
    /// wins). `None` means the entity type is skipped for this run.
    fn select_rows<'e>(
        &self,
        extraction: &'e Extraction,
        entity_type: EntityType,
    ) -> Option<Vec<&'e Row>> {
        if self.mapper.mappings().get(entity_type).is_none() {
            info!("Skipping {entity_type}: no mapping defined");
            return None;
        }
        let collection = extraction.collection_for(entity_type);
        if collection.is_empty() {
            info!("Skipping {entity_type}: no rows extracted");
            return None;
        }

        let Some(id_col) = self.mapper.unique_id_col(entity_type) else {
            return Some(collection.rows().iter().collect());
        };
        if !collection.has_column(id_col) {
            info!("Skipping {entity_type}: extracted rows lack natural-key column '{id_col}'");
            return None;
        }

        let (keyed, unkeyed): (Vec<&Row>, Vec<&Row>) = collection
            .rows()
            .iter()
            .partition(|row| row.get(id_col).is_some());
        if !unkeyed.is_empty() {
            debug!(
                "Ignoring {} {entity_type} row(s) with an empty '{id_col}'",
                unkeyed.len()
            );
        }
        let unique = keyed
            .into_iter()
            .unique_by(|row| row.get(id_col).map(|v| v.as_display()))
            .collect::<Vec<_>>();
        debug!(
            "{entity_type}: {} of {} row(s) unique by '{id_col}'",
            unique.len(),
            collection.len()
        );
        Some(unique)
    }
}
