//! Persistence backend.
//!
//! The Loader only sees [`PersistenceStore`]. [`Database`] implements it on
//! top of one [`EntityRepository`] per entity type, registered when the
//! database is constructed. Writes between `begin` and `commit` are
//! journaled so `rollback` restores the previous state exactly, which is
//! what gives each entity type's batch its all-or-nothing behaviour.

use std::{
    collections::{BTreeMap, BTreeSet},
    fs,
    path::{Path, PathBuf},
};

use chrono::{SecondsFormat, Utc};
use log::{debug, warn};
use thiserror::Error;
use uuid::Uuid;

use crate::{
    entity::{EntityType, TableSpec},
    io_utils,
    value::{Record, Value},
};

const CROCKFORD: &[u8; 32] = b"0123456789ABCDEFGHJKMNPQRSTVWXYZ";

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("integrity error on {entity_type}: {message}")]
    Integrity {
        entity_type: EntityType,
        message: String,
    },

    #[error("{entity_type} {id} not found")]
    NotFound { entity_type: EntityType, id: String },

    #[error("no repository registered for {0}")]
    UnknownRepository(EntityType),

    #[error("store I/O failed: {0}")]
    Io(String),
}

impl StoreError {
    fn integrity(entity_type: EntityType, message: impl Into<String>) -> Self {
        StoreError::Integrity {
            entity_type,
            message: message.into(),
        }
    }
}

/// What the Loader needs from a backend.
pub trait PersistenceStore {
    /// Starts a unit of work; everything up to `commit` or `rollback` is atomic.
    fn begin(&mut self);

    fn create(&mut self, entity_type: EntityType, payload: Record) -> Result<String, StoreError>;

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>, StoreError>;

    /// Overwrites only the fields present in `patch`.
    fn update(&mut self, entity_type: EntityType, id: &str, patch: Record)
    -> Result<(), StoreError>;

    fn commit(&mut self) -> Result<(), StoreError>;

    fn rollback(&mut self);
}

/// Storage for the rows of one entity type.
pub trait EntityRepository {
    fn entity_type(&self) -> EntityType;

    fn get(&self, id: &str) -> Option<&Record>;

    fn insert(&mut self, id: String, record: Record) -> Result<(), StoreError>;

    /// Returns the previous record.
    fn replace(&mut self, id: &str, record: Record) -> Result<Record, StoreError>;

    fn remove(&mut self, id: &str) -> Option<Record>;

    /// Ids of rows whose `field` equals `value`.
    fn find(&self, field: &str, value: &Value) -> Vec<String>;

    fn export(&self) -> BTreeMap<String, Record>;

    fn len(&self) -> usize;
}

/// In-memory table enforcing the entity type's own non-null and unique
/// constraints. Foreign keys span tables and are checked by [`Database`].
#[derive(Debug, Clone)]
pub struct TableRepository {
    entity_type: EntityType,
    spec: TableSpec,
    rows: BTreeMap<String, Record>,
}

impl TableRepository {
    pub fn new(entity_type: EntityType) -> Self {
        Self {
            entity_type,
            spec: entity_type.table(),
            rows: BTreeMap::new(),
        }
    }

    pub fn with_rows(mut self, rows: BTreeMap<String, Record>) -> Self {
        self.rows = rows;
        self
    }

    fn check(&self, id: &str, record: &Record) -> Result<(), StoreError> {
        for field in self.spec.not_null {
            if record.get(*field).is_none_or(Option::is_none) {
                return Err(StoreError::integrity(
                    self.entity_type,
                    format!("null value in column \"{field}\" violates not-null constraint"),
                ));
            }
        }
        for fields in self.spec.unique {
            let key = unique_key(record, fields);
            let clash = self
                .rows
                .iter()
                .find(|(other_id, other)| other_id.as_str() != id && unique_key(other, fields) == key);
            if let Some((other_id, _)) = clash {
                return Err(StoreError::integrity(
                    self.entity_type,
                    format!("duplicate key ({}) already exists as {other_id}", fields.join(", ")),
                ));
            }
        }
        Ok(())
    }
}

fn unique_key(record: &Record, fields: &[&str]) -> Vec<Option<Value>> {
    fields
        .iter()
        .map(|f| record.get(*f).cloned().flatten())
        .collect()
}

impl EntityRepository for TableRepository {
    fn entity_type(&self) -> EntityType {
        self.entity_type
    }

    fn get(&self, id: &str) -> Option<&Record> {
        self.rows.get(id)
    }

    fn insert(&mut self, id: String, record: Record) -> Result<(), StoreError> {
        if self.rows.contains_key(&id) {
            return Err(StoreError::integrity(
                self.entity_type,
                format!("primary key {id} already exists"),
            ));
        }
        self.check(&id, &record)?;
        self.rows.insert(id, record);
        Ok(())
    }

    fn replace(&mut self, id: &str, record: Record) -> Result<Record, StoreError> {
        if !self.rows.contains_key(id) {
            return Err(StoreError::NotFound {
                entity_type: self.entity_type,
                id: id.to_string(),
            });
        }
        self.check(id, &record)?;
        self.rows
            .insert(id.to_string(), record)
            .ok_or_else(|| StoreError::NotFound {
                entity_type: self.entity_type,
                id: id.to_string(),
            })
    }

    fn remove(&mut self, id: &str) -> Option<Record> {
        self.rows.remove(id)
    }

    fn find(&self, field: &str, value: &Value) -> Vec<String> {
        self.rows
            .iter()
            .filter(|(_, record)| record.get(field).and_then(Option::as_ref) == Some(value))
            .map(|(id, _)| id.clone())
            .collect()
    }

    fn export(&self) -> BTreeMap<String, Record> {
        self.rows.clone()
    }

    fn len(&self) -> usize {
        self.rows.len()
    }
}

#[derive(Debug)]
enum Undo {
    Created(EntityType, String),
    Updated(EntityType, String, Record),
    Deleted(EntityType, String, Record),
}

/// The local relational store: a registry of repositories plus a journal.
pub struct Database {
    repositories: BTreeMap<EntityType, Box<dyn EntityRepository>>,
    journal: Vec<Undo>,
    touched: BTreeSet<EntityType>,
    root: Option<PathBuf>,
}

impl Database {
    /// An in-memory database with a [`TableRepository`] for every entity type.
    pub fn new() -> Self {
        let repositories = EntityType::ALL
            .iter()
            .map(|ty| {
                (
                    *ty,
                    Box::new(TableRepository::new(*ty)) as Box<dyn EntityRepository>,
                )
            })
            .collect();
        Self {
            repositories,
            journal: Vec::new(),
            touched: BTreeSet::new(),
            root: None,
        }
    }

    /// Opens (or initialises) a database persisted as one JSON file per table
    /// under `root`. Committed changes are written back.
    pub fn open(root: &Path) -> Result<Self, StoreError> {
        let mut database = Self::new();
        for ty in EntityType::ALL {
            let path = table_path(root, *ty);
            let raw = match fs::read_to_string(&path) {
                Ok(raw) => raw,
                Err(err) if err.kind() == std::io::ErrorKind::NotFound => continue,
                Err(err) => return Err(StoreError::Io(format!("reading {path:?}: {err}"))),
            };
            let rows: BTreeMap<String, Record> = serde_json::from_str(&raw)
                .map_err(|err| StoreError::Io(format!("parsing {path:?}: {err}")))?;
            debug!("Loaded {} {ty} row(s) from {path:?}", rows.len());
            database.register(Box::new(TableRepository::new(*ty).with_rows(rows)));
        }
        database.root = Some(root.to_path_buf());
        Ok(database)
    }

    /// Installs `repository` for its entity type, replacing any existing one.
    pub fn register(&mut self, repository: Box<dyn EntityRepository>) {
        self.repositories
            .insert(repository.entity_type(), repository);
    }

    pub fn count(&self, entity_type: EntityType) -> usize {
        self.repositories.get(&entity_type).map_or(0, |r| r.len())
    }

    pub fn find(&self, entity_type: EntityType, field: &str, value: &Value) -> Vec<String> {
        self.repositories
            .get(&entity_type)
            .map(|r| r.find(field, value))
            .unwrap_or_default()
    }

    pub fn rows(&self, entity_type: EntityType) -> BTreeMap<String, Record> {
        self.repositories
            .get(&entity_type)
            .map(|r| r.export())
            .unwrap_or_default()
    }

    /// Deletes a row and, transitively, every row whose foreign key points at
    /// it. Returns the number of rows removed. Journaled like any other write.
    pub fn delete_cascade(&mut self, entity_type: EntityType, id: &str) -> Result<usize, StoreError> {
        let mut removed = 0;
        let mut pending = vec![(entity_type, id.to_string())];
        while let Some((ty, id)) = pending.pop() {
            let Some(record) = self.repository_mut(ty)?.remove(&id) else {
                continue;
            };
            removed += 1;
            self.touched.insert(ty);
            let key = Value::String(id.clone());
            self.journal.push(Undo::Deleted(ty, id, record));
            for child in EntityType::ALL {
                for fk in child.table().foreign_keys.iter().filter(|fk| fk.parent == ty) {
                    for child_id in self.find(*child, fk.field, &key) {
                        pending.push((*child, child_id));
                    }
                }
            }
        }
        Ok(removed)
    }

    fn repository(&self, entity_type: EntityType) -> Result<&dyn EntityRepository, StoreError> {
        self.repositories
            .get(&entity_type)
            .map(|r| r.as_ref())
            .ok_or(StoreError::UnknownRepository(entity_type))
    }

    fn repository_mut(
        &mut self,
        entity_type: EntityType,
    ) -> Result<&mut Box<dyn EntityRepository>, StoreError> {
        self.repositories
            .get_mut(&entity_type)
            .ok_or(StoreError::UnknownRepository(entity_type))
    }

    fn check_foreign_keys(&self, entity_type: EntityType, record: &Record) -> Result<(), StoreError> {
        for fk in entity_type.table().foreign_keys {
            match record.get(fk.field).and_then(Option::as_ref) {
                None if fk.nullable => {}
                None => {
                    return Err(StoreError::integrity(
                        entity_type,
                        format!("null value in column \"{}\" violates not-null constraint", fk.field),
                    ));
                }
                Some(value) => {
                    let parent_id = value.as_display();
                    if self.repository(fk.parent)?.get(&parent_id).is_none() {
                        return Err(StoreError::integrity(
                            entity_type,
                            format!(
                                "\"{}\" references missing {} {parent_id}",
                                fk.field, fk.parent
                            ),
                        ));
                    }
                }
            }
        }
        Ok(())
    }

    fn generate_id(&self, entity_type: EntityType) -> Result<String, StoreError> {
        let repository = self.repository(entity_type)?;
        loop {
            let id = format_id(entity_type.id_prefix(), Uuid::new_v4());
            if repository.get(&id).is_none() {
                return Ok(id);
            }
        }
    }

    fn save(&self) -> Result<(), StoreError> {
        let Some(root) = &self.root else {
            return Ok(());
        };
        for ty in &self.touched {
            let path = table_path(root, *ty);
            io_utils::write_json_atomic(&path, &self.repository(*ty)?.export())
                .map_err(|err| StoreError::Io(format!("{err:#}")))?;
        }
        Ok(())
    }
}

impl Default for Database {
    fn default() -> Self {
        Self::new()
    }
}

impl PersistenceStore for Database {
    fn begin(&mut self) {
        if !self.journal.is_empty() {
            warn!(
                "Discarding {} uncommitted change(s) before starting a new batch",
                self.journal.len()
            );
            self.rollback();
        }
    }

    fn create(&mut self, entity_type: EntityType, mut payload: Record) -> Result<String, StoreError> {
        self.check_foreign_keys(entity_type, &payload)?;
        let id = self.generate_id(entity_type)?;
        let now = timestamp();
        payload.insert("kf_id".to_string(), Some(Value::String(id.clone())));
        payload.insert("created_at".to_string(), Some(now.clone()));
        payload.insert("modified_at".to_string(), Some(now));
        self.repository_mut(entity_type)?.insert(id.clone(), payload)?;
        self.touched.insert(entity_type);
        self.journal.push(Undo::Created(entity_type, id.clone()));
        Ok(id)
    }

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>, StoreError> {
        Ok(self.repository(entity_type)?.get(id).cloned())
    }

    fn update(
        &mut self,
        entity_type: EntityType,
        id: &str,
        patch: Record,
    ) -> Result<(), StoreError> {
        let mut merged = self
            .repository(entity_type)?
            .get(id)
            .cloned()
            .ok_or_else(|| StoreError::NotFound {
                entity_type,
                id: id.to_string(),
            })?;
        merged.extend(patch);
        merged.insert("kf_id".to_string(), Some(Value::String(id.to_string())));
        merged.insert("modified_at".to_string(), Some(timestamp()));
        self.check_foreign_keys(entity_type, &merged)?;
        let previous = self.repository_mut(entity_type)?.replace(id, merged)?;
        self.touched.insert(entity_type);
        self.journal
            .push(Undo::Updated(entity_type, id.to_string(), previous));
        Ok(())
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.save()?;
        debug!("Committed {} change(s)", self.journal.len());
        self.journal.clear();
        self.touched.clear();
        Ok(())
    }

    fn rollback(&mut self) {
        let changes = self.journal.len();
        while let Some(undo) = self.journal.pop() {
            let restored = match undo {
                Undo::Created(ty, id) => self.repository_mut(ty).map(|r| {
                    r.remove(&id);
                }),
                Undo::Updated(ty, id, previous) => self
                    .repository_mut(ty)
                    .and_then(|r| r.replace(&id, previous).map(|_| ())),
                Undo::Deleted(ty, id, record) => {
                    self.repository_mut(ty).and_then(|r| r.insert(id, record))
                }
            };
            if let Err(err) = restored {
                warn!("Rollback step failed: {err}");
            }
        }
        self.touched.clear();
        debug!("Rolled back {changes} change(s)");
    }
}

fn table_path(root: &Path, entity_type: EntityType) -> PathBuf {
    root.join(format!("{}.json", entity_type.as_str()))
}

fn timestamp() -> Value {
    Value::String(Utc::now().to_rfc3339_opts(SecondsFormat::Millis, true))
}

/// `XX_` followed by eight Crockford base-32 characters drawn from `uuid`.
pub fn format_id(prefix: &str, uuid: Uuid) -> String {
    let bytes = uuid.as_bytes();
    let mut bits = bytes[..5]
        .iter()
        .fold(0u64, |acc, byte| (acc << 8) | u64::from(*byte));
    let mut suffix = [0u8; 8];
    for slot in suffix.iter_mut().rev() {
        *slot = CROCKFORD[(bits & 0x1f) as usize];
        bits >>= 5;
    }
    format!("{prefix}_{}", String::from_utf8_lossy(&suffix))
}
