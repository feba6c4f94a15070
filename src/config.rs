//! Run configuration for one study's ETL package.
//!
//! ```yaml
//! etl_package_name: seidman
//! mappings: mappings.yml
//! schemas: schemas.json
//! validate: true
//! extract:
//!   default: data/subjects.tsv
//!   entities:
//!     genomic_file: data/manifest.csv
//! load:
//!   store: db
//!   cache_dir: cache
//! drop_data:
//!   study: { attribute: external_id, value: phs001138 }
//! ```
//!
//! Relative paths are resolved against the directory holding the file.

use std::{
    collections::BTreeMap,
    path::{Path, PathBuf},
};

use anyhow::{Context, Result, anyhow, bail};
use encoding_rs::Encoding;
use regex::Regex;
use serde::Deserialize;

use crate::{
    documents,
    entity::{DEFAULT_ENTITY_TYPES, EntityType},
    io_utils,
    value::Value,
};

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct EtlConfig {
    pub etl_package_name: String,
    #[serde(default)]
    pub entities: Option<Vec<EntityType>>,
    pub mappings: PathBuf,
    #[serde(default)]
    pub schemas: Option<PathBuf>,
    /// Fill allowable-value defaults and reject mapped fields the schema
    /// registry does not know. Required links are enforced whenever
    /// `schemas` is set.
    #[serde(default)]
    pub validate: bool,
    pub extract: ExtractConfig,
    #[serde(default)]
    pub load: LoadConfig,
    #[serde(default)]
    pub drop_data: Option<DropDataConfig>,
    #[serde(default)]
    pub nrows: Option<usize>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct ExtractConfig {
    pub default: PathBuf,
    #[serde(default)]
    pub entities: BTreeMap<EntityType, PathBuf>,
    #[serde(default)]
    pub delimiter: Option<String>,
    #[serde(default)]
    pub encoding: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct LoadConfig {
    #[serde(default = "default_store_dir")]
    pub store: PathBuf,
    #[serde(default = "default_cache_dir")]
    pub cache_dir: PathBuf,
}

impl Default for LoadConfig {
    fn default() -> Self {
        Self {
            store: default_store_dir(),
            cache_dir: default_cache_dir(),
        }
    }
}

fn default_store_dir() -> PathBuf {
    PathBuf::from("store")
}

fn default_cache_dir() -> PathBuf {
    PathBuf::from("cache")
}

#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct DropDataConfig {
    pub study: StudySelector,
}

/// Identifies the study whose rows `drop-data` removes.
#[derive(Debug, Clone, Deserialize)]
#[serde(deny_unknown_fields)]
pub struct StudySelector {
    pub attribute: String,
    pub value: Value,
}

const PACKAGE_NAME_PATTERN: &str = r"^[a-z][a-z0-9_]*$";

impl EtlConfig {
    pub fn load(path: &Path) -> Result<Self> {
        let mut config: EtlConfig = documents::load_from_path(path)?;
        config.validate_package_name()?;
        let base = path
            .parent()
            .filter(|p| !p.as_os_str().is_empty())
            .unwrap_or_else(|| Path::new("."));
        config.resolve_paths(base);
        Ok(config)
    }

    fn validate_package_name(&self) -> Result<()> {
        let pattern = Regex::new(PACKAGE_NAME_PATTERN)?;
        if !pattern.is_match(&self.etl_package_name) {
            bail!(
                "etl_package_name '{}' must be lowercase letters, digits and underscores, starting with a letter",
                self.etl_package_name
            );
        }
        Ok(())
    }

    fn resolve_paths(&mut self, base: &Path) {
        let join = |path: &mut PathBuf| {
            if path.is_relative() {
                *path = base.join(&*path);
            }
        };
        join(&mut self.mappings);
        if let Some(schemas) = self.schemas.as_mut() {
            join(schemas);
        }
        join(&mut self.extract.default);
        self.extract.entities.values_mut().for_each(join);
        join(&mut self.load.store);
        join(&mut self.load.cache_dir);
    }

    /// Entity types to load, in order.
    pub fn entity_types(&self) -> Vec<EntityType> {
        self.entities
            .clone()
            .unwrap_or_else(|| DEFAULT_ENTITY_TYPES.to_vec())
    }

    pub fn delimiter(&self) -> Result<Option<u8>> {
        self.extract
            .delimiter
            .as_deref()
            .map(|raw| io_utils::parse_delimiter(raw).map_err(|err| anyhow!(err)))
            .transpose()
            .context("Invalid extract.delimiter")
    }

    pub fn encoding(&self) -> Result<&'static Encoding> {
        io_utils::resolve_encoding(self.extract.encoding.as_deref())
    }
}
