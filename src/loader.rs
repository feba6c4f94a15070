//! Persists payloads one entity type at a time.
//!
//! Each entity type moves through `Building -> Linking -> Persisting ->
//! Caching`. A batch is atomic: any store error rolls the whole entity type
//! back and the run moves on to the next one. Family relationships are
//! always loaded last, after every participant they may reference.

use std::fmt;

use anyhow::{Context, Result};
use log::{debug, error, info, warn};

use crate::{
    cache::IdentifierCache,
    entity::EntityType,
    extract::Extraction,
    family::{self, PARENT_RELATIONS},
    link::{LinkResolver, LinkedPayload},
    mapper::Payload,
    report::LoadReport,
    schema_registry::SchemaRegistry,
    store::{PersistenceStore, StoreError},
    transform::Transformer,
};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    /// Fresh import: every payload becomes a new row.
    Create,
    /// Patch rows previously created for the same natural keys.
    Update,
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(match self {
            Operation::Create => "import",
            Operation::Update => "update",
        })
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LoadPhase {
    Idle,
    Building(EntityType),
    Linking(EntityType),
    Persisting(EntityType),
    Caching(EntityType),
    FamilyRelationships,
    Done,
}

impl fmt::Display for LoadPhase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            LoadPhase::Idle => f.write_str("idle"),
            LoadPhase::Building(ty) => write!(f, "building {ty}"),
            LoadPhase::Linking(ty) => write!(f, "linking {ty}"),
            LoadPhase::Persisting(ty) => write!(f, "persisting {ty}"),
            LoadPhase::Caching(ty) => write!(f, "caching {ty}"),
            LoadPhase::FamilyRelationships => f.write_str("family relationships"),
            LoadPhase::Done => f.write_str("done"),
        }
    }
}

pub struct Loader<'a, S: PersistenceStore> {
    store: &'a mut S,
    cache: &'a mut IdentifierCache,
    schemas: Option<&'a SchemaRegistry>,
    phase: LoadPhase,
    report: LoadReport,
}

impl<'a, S: PersistenceStore> Loader<'a, S> {
    pub fn new(store: &'a mut S, cache: &'a mut IdentifierCache) -> Self {
        Self {
            store,
            cache,
            schemas: None,
            phase: LoadPhase::Idle,
            report: LoadReport::new(),
        }
    }

    /// Registry consulted for required links.
    pub fn with_schemas(mut self, schemas: &'a SchemaRegistry) -> Self {
        self.schemas = Some(schemas);
        self
    }

    pub fn phase(&self) -> LoadPhase {
        self.phase
    }

    /// Loads `entity_types` in order. An UPDATE run reads the identifier
    /// cache first; a cache that cannot be read aborts the run before
    /// anything is persisted.
    pub fn run(
        &mut self,
        transformer: &Transformer<'_>,
        extraction: &Extraction,
        entity_types: &[EntityType],
        operation: Operation,
    ) -> Result<LoadReport> {
        if operation == Operation::Update {
            self.cache
                .load()
                .context("Cannot update without a readable identifier cache")?;
        }
        info!("Starting {operation} of {} entity type(s)", entity_types.len());

        for &entity_type in entity_types {
            if entity_type == EntityType::FamilyRelationship {
                continue;
            }
            self.enter(LoadPhase::Building(entity_type));
            let payloads = transformer
                .run(extraction, &[entity_type])?
                .remove(&entity_type)
                .unwrap_or_default();
            self.load_entity_type(entity_type, payloads, operation)?;
        }

        if entity_types.contains(&EntityType::FamilyRelationship) {
            self.enter(LoadPhase::FamilyRelationships);
            let rows = transformer
                .run(extraction, &[EntityType::FamilyRelationship])?
                .remove(&EntityType::FamilyRelationship)
                .unwrap_or_default();
            self.load_family_relationships(&rows, operation)?;
        }

        self.enter(LoadPhase::Done);
        info!(
            "Finished {operation}: {} dropped payload(s), {} failed",
            self.report.total_dropped(),
            self.report.total_failed()
        );
        Ok(std::mem::take(&mut self.report))
    }

    /// Links and persists one entity type's payloads as a single batch.
    /// Returns an error only for run-level failures; a rejected batch is
    /// recorded in the report.
    pub fn load_entity_type(
        &mut self,
        entity_type: EntityType,
        payloads: Vec<Payload>,
        operation: Operation,
    ) -> Result<()> {
        self.report.entry(entity_type).built += payloads.len();
        if payloads.is_empty() {
            debug!("No {entity_type} payloads to load");
            return Ok(());
        }

        self.enter(LoadPhase::Linking(entity_type));
        let batch = self.link(entity_type, payloads, operation);
        self.persist(entity_type, batch, operation)
    }

    fn load_family_relationships(&mut self, rows: &[Payload], operation: Operation) -> Result<()> {
        let entity_type = EntityType::FamilyRelationship;
        let edges = family::build_edges(rows, &*self.cache, PARENT_RELATIONS);
        info!(
            "Built {} family relationship(s) from {} family row(s)",
            edges.len(),
            rows.len()
        );
        self.report.entry(entity_type).built += edges.len();

        let batch = edges
            .iter()
            .map(|edge| LinkedPayload {
                natural_key: Some(edge.natural_key()),
                record: edge.to_record(),
            })
            .filter(|item| !self.already_loaded(entity_type, item, operation))
            .collect::<Vec<_>>();
        self.persist(entity_type, batch, operation)
    }

    fn link(
        &mut self,
        entity_type: EntityType,
        payloads: Vec<Payload>,
        operation: Operation,
    ) -> Vec<LinkedPayload> {
        let resolver = LinkResolver::new(&*self.cache, self.schemas);
        let mut batch = Vec::with_capacity(payloads.len());
        let mut dropped = Vec::new();
        for payload in payloads {
            if payload.unique_id.is_none() && entity_type != EntityType::FamilyRelationship {
                dropped.push(format!("{entity_type} payload without a natural key"));
                continue;
            }
            match resolver.resolve(payload) {
                Ok(linked) => batch.push(linked),
                Err(err) => {
                    warn!("Dropping payload: {err}");
                    dropped.push(err.to_string());
                }
            }
        }
        self.report.entry(entity_type).dropped.extend(dropped);
        batch
            .into_iter()
            .filter(|item| !self.already_loaded(entity_type, item, operation))
            .collect()
    }

    /// CREATE skips natural keys that a previous, resumed run already cached.
    fn already_loaded(&mut self, entity_type: EntityType, item: &LinkedPayload, operation: Operation) -> bool {
        if operation != Operation::Create {
            return false;
        }
        let Some(key) = item.natural_key.as_deref() else {
            return false;
        };
        if self.cache.get(entity_type, key).is_some() {
            debug!("{entity_type} '{key}' already loaded");
            self.report.entry(entity_type).skipped += 1;
            return true;
        }
        false
    }

    fn persist(&mut self, entity_type: EntityType, batch: Vec<LinkedPayload>, operation: Operation) -> Result<()> {
        if batch.is_empty() {
            debug!("Nothing to persist for {entity_type}");
            return Ok(());
        }
        self.enter(LoadPhase::Persisting(entity_type));
        let size = batch.len();
        let outcome = match operation {
            Operation::Create => self.create_batch(entity_type, batch),
            Operation::Update => self.update_batch(entity_type, batch),
        };

        match outcome {
            Ok(created) => {
                self.enter(LoadPhase::Caching(entity_type));
                for (natural_key, id) in created {
                    self.cache.put(entity_type, natural_key, id);
                }
                self.cache
                    .flush()
                    .with_context(|| format!("Saving identifier cache after {entity_type}"))?;
                Ok(())
            }
            Err(err) => {
                self.store.rollback();
                error!("Rolled back {size} {entity_type} payload(s): {err}");
                self.report.entry(entity_type).failed += size;
                Ok(())
            }
        }
    }

    /// Returns `(natural key, id)` for every row written.
    fn create_batch(
        &mut self,
        entity_type: EntityType,
        batch: Vec<LinkedPayload>,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.store.begin();
        let mut created = Vec::with_capacity(batch.len());
        for item in batch {
            let id = self.store.create(entity_type, item.record)?;
            debug!(
                "Created {entity_type} {id} for '{}'",
                item.natural_key.as_deref().unwrap_or_default()
            );
            if let Some(key) = item.natural_key {
                created.push((key, id));
            }
        }
        self.store.commit()?;
        info!("Created {} {entity_type}(s)", created.len());
        self.report.entry(entity_type).created += created.len();
        Ok(created)
    }

    fn update_batch(
        &mut self,
        entity_type: EntityType,
        batch: Vec<LinkedPayload>,
    ) -> Result<Vec<(String, String)>, StoreError> {
        self.store.begin();
        let mut updated = 0;
        let mut skipped = 0;
        for item in batch {
            let key = item.natural_key.unwrap_or_default();
            let Some(id) = self.cache.get(entity_type, &key).map(str::to_string) else {
                debug!("{entity_type} '{key}' was never loaded; not creating it");
                skipped += 1;
                continue;
            };
            if self.store.get(entity_type, &id)?.is_none() {
                warn!("{entity_type} '{key}' is cached as {id} but missing from the store");
                skipped += 1;
                continue;
            }
            // A column absent from this extract must not erase stored data.
            let patch = item
                .record
                .into_iter()
                .filter(|(_, value)| value.is_some())
                .collect();
            self.store.update(entity_type, &id, patch)?;
            updated += 1;
        }
        self.store.commit()?;
        info!("Updated {updated} {entity_type}(s), skipped {skipped}");
        let counts = self.report.entry(entity_type);
        counts.updated += updated;
        counts.skipped += skipped;
        Ok(Vec::new())
    }

    fn enter(&mut self, next: LoadPhase) {
        debug!("Loader: {} -> {next}", self.phase);
        self.phase = next;
    }
}
