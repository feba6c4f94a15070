//! Durable map from `(entity type, natural key)` to generated id.
//!
//! The cache is what makes imports resumable: it is flushed after every
//! entity type's batch, and an UPDATE run starts from the flushed state.
//! Keys are always stored in their string form so that `42`, `42.0` and
//! `"42"` address the same entry.

use std::{
    cell::{Cell, RefCell},
    collections::BTreeMap,
    fmt,
    fs,
    io::ErrorKind,
    path::{Path, PathBuf},
    rc::Rc,
};

use log::debug;
use thiserror::Error;

use crate::{entity::EntityType, io_utils};

pub const CACHE_FILE_NAME: &str = "cache_kf_id.json";

pub type CacheDocument = BTreeMap<EntityType, BTreeMap<String, String>>;

#[derive(Debug, Error)]
pub enum CacheError {
    #[error("identifier cache at {location} is unreadable: {message}")]
    Unreadable { location: String, message: String },

    #[error("identifier cache at {location} is corrupt: {message}")]
    Corrupt { location: String, message: String },

    #[error("failed to write identifier cache to {location}: {message}")]
    Write { location: String, message: String },
}

/// Where a cache document lives between runs.
pub trait CacheStorage {
    fn location(&self) -> String;

    /// `Ok(None)` when nothing has been stored yet.
    fn read(&self) -> Result<Option<CacheDocument>, CacheError>;

    fn write(&self, document: &CacheDocument) -> Result<(), CacheError>;
}

/// One JSON document per study, under `<cache_dir>/<etl_package_name>/`.
#[derive(Debug, Clone)]
pub struct JsonFileStorage {
    path: PathBuf,
}

impl JsonFileStorage {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn for_package(cache_dir: &Path, etl_package_name: &str) -> Self {
        Self::new(cache_dir.join(etl_package_name).join(CACHE_FILE_NAME))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CacheStorage for JsonFileStorage {
    fn location(&self) -> String {
        self.path.display().to_string()
    }

    fn read(&self) -> Result<Option<CacheDocument>, CacheError> {
        let raw = match fs::read_to_string(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == ErrorKind::NotFound => return Ok(None),
            Err(err) => {
                return Err(CacheError::Unreadable {
                    location: self.location(),
                    message: err.to_string(),
                });
            }
        };
        serde_json::from_str(&raw)
            .map(Some)
            .map_err(|err| CacheError::Corrupt {
                location: self.location(),
                message: err.to_string(),
            })
    }

    fn write(&self, document: &CacheDocument) -> Result<(), CacheError> {
        io_utils::write_json_atomic(&self.path, document).map_err(|err| CacheError::Write {
            location: self.location(),
            message: format!("{err:#}"),
        })
    }
}

/// Shared in-process storage, mostly useful for tests and dry runs.
#[derive(Debug, Clone, Default)]
pub struct MemoryStorage {
    document: Rc<RefCell<Option<CacheDocument>>>,
    writes: Rc<Cell<usize>>,
}

impl MemoryStorage {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_document(document: CacheDocument) -> Self {
        let storage = Self::default();
        storage.document.replace(Some(document));
        storage
    }

    pub fn snapshot(&self) -> Option<CacheDocument> {
        self.document.borrow().clone()
    }

    pub fn write_count(&self) -> usize {
        self.writes.get()
    }
}

impl CacheStorage for MemoryStorage {
    fn location(&self) -> String {
        "memory".to_string()
    }

    fn read(&self) -> Result<Option<CacheDocument>, CacheError> {
        Ok(self.document.borrow().clone())
    }

    fn write(&self, document: &CacheDocument) -> Result<(), CacheError> {
        self.document.replace(Some(document.clone()));
        self.writes.set(self.writes.get() + 1);
        Ok(())
    }
}

pub struct IdentifierCache {
    entries: CacheDocument,
    storage: Box<dyn CacheStorage>,
}

impl IdentifierCache {
    /// An empty cache backed by `storage`; nothing is read until [`load`](Self::load).
    pub fn new(storage: Box<dyn CacheStorage>) -> Self {
        Self {
            entries: CacheDocument::new(),
            storage,
        }
    }

    /// Replaces the in-memory entries with the stored document, if one exists.
    pub fn load(&mut self) -> Result<(), CacheError> {
        match self.storage.read()? {
            Some(document) => {
                debug!(
                    "Loaded {} cached id(s) from {}",
                    document.values().map(BTreeMap::len).sum::<usize>(),
                    self.storage.location()
                );
                self.entries = document;
            }
            None => debug!("No identifier cache at {} yet", self.storage.location()),
        }
        Ok(())
    }

    pub fn get(&self, entity_type: EntityType, natural_key: impl fmt::Display) -> Option<&str> {
        self.entries
            .get(&entity_type)?
            .get(&natural_key.to_string())
            .map(String::as_str)
    }

    pub fn put(
        &mut self,
        entity_type: EntityType,
        natural_key: impl fmt::Display,
        id: impl Into<String>,
    ) {
        self.entries
            .entry(entity_type)
            .or_default()
            .insert(natural_key.to_string(), id.into());
    }

    pub fn flush(&self) -> Result<(), CacheError> {
        self.storage.write(&self.entries)
    }

    pub fn len(&self, entity_type: EntityType) -> usize {
        self.entries.get(&entity_type).map_or(0, BTreeMap::len)
    }

    pub fn is_empty(&self) -> bool {
        self.entries.values().all(BTreeMap::is_empty)
    }

    pub fn location(&self) -> String {
        self.storage.location()
    }
}

impl fmt::Debug for IdentifierCache {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("IdentifierCache")
            .field("entries", &self.entries)
            .field("storage", &self.storage.location())
            .finish()
    }
}
