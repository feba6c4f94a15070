use std::path::Path;

use anyhow::{Context, Result, bail};
use log::{info, warn};

use crate::{
    cache::{IdentifierCache, JsonFileStorage},
    config::EtlConfig,
    entity::EntityType,
    extract::CsvExtractor,
    loader::{Loader, Operation},
    mapper::Mapper,
    mapping::MappingSpec,
    report::LoadReport,
    schema_registry::SchemaRegistry,
    store::{Database, PersistenceStore},
    transform::Transformer,
    value::Value,
};

#[derive(Debug, Clone, Copy, Default)]
pub struct RunOptions {
    /// Keep ids cached by an earlier, interrupted import.
    pub resume: bool,
    /// Overrides the config's `nrows`.
    pub nrows: Option<usize>,
}

/// Runs extract, transform and load for the study described by `config_path`.
pub fn run(operation: Operation, config_path: &Path, options: RunOptions) -> Result<LoadReport> {
    let config = EtlConfig::load(config_path)
        .with_context(|| format!("Loading run configuration {config_path:?}"))?;
    info!("Running {operation} for ETL package '{}'", config.etl_package_name);

    let mappings = MappingSpec::load(&config.mappings)?;
    let schemas = config
        .schemas
        .as_deref()
        .map(SchemaRegistry::load)
        .transpose()?;
    if config.validate
        && let Some(schemas) = schemas.as_ref()
    {
        let issues = validate_mappings(&mappings, schemas);
        if !issues.is_empty() {
            bail!("Mapping does not match the schema registry:\n  {}", issues.join("\n  "));
        }
    }

    let extraction = CsvExtractor::new(config.delimiter()?, config.encoding()?)
        .extract(&config.extract.default, &config.extract.entities)?;

    let mut mapper = Mapper::new(&mappings);
    if config.validate
        && let Some(schemas) = schemas.as_ref()
    {
        mapper = mapper.with_schemas(schemas);
    }
    let transformer = Transformer::new(mapper).with_row_limit(options.nrows.or(config.nrows));

    let storage = JsonFileStorage::for_package(&config.load.cache_dir, &config.etl_package_name);
    let mut cache = IdentifierCache::new(Box::new(storage));
    if operation == Operation::Create && options.resume {
        cache
            .load()
            .context("Cannot resume without a readable identifier cache")?;
    }

    let mut store = Database::open(&config.load.store)
        .with_context(|| format!("Opening store at {:?}", config.load.store))?;
    let mut loader = Loader::new(&mut store, &mut cache);
    if let Some(schemas) = schemas.as_ref() {
        loader = loader.with_schemas(schemas);
    }
    loader.run(&transformer, &extraction, &config.entity_types(), operation)
}

/// Deletes every study selected by `drop_data.study`, everything that
/// references it, and its investigator once no other study uses it.
/// Returns the number of rows removed.
pub fn drop_data(config_path: &Path) -> Result<usize> {
    let config = EtlConfig::load(config_path)
        .with_context(|| format!("Loading run configuration {config_path:?}"))?;
    let Some(drop) = config.drop_data.as_ref() else {
        bail!("{config_path:?} has no drop_data.study section");
    };
    let selector = &drop.study;

    let mut store = Database::open(&config.load.store)
        .with_context(|| format!("Opening store at {:?}", config.load.store))?;
    let studies = store.find(EntityType::Study, &selector.attribute, &selector.value);
    if studies.is_empty() {
        warn!(
            "No study with {} = {}; nothing to drop",
            selector.attribute, selector.value
        );
        return Ok(0);
    }

    store.begin();
    let mut removed = 0;
    for study_id in studies {
        let investigator = store
            .get(EntityType::Study, &study_id)?
            .and_then(|row| row.get("investigator_id").cloned().flatten());
        removed += store.delete_cascade(EntityType::Study, &study_id)?;
        if let Some(Value::String(investigator_id)) = investigator
            && store
                .find(EntityType::Study, "investigator_id", &Value::from(investigator_id.as_str()))
                .is_empty()
        {
            removed += store.delete_cascade(EntityType::Investigator, &investigator_id)?;
        }
        info!("Dropped study {study_id}");
    }
    store.commit()?;
    info!("Removed {removed} row(s)");
    Ok(removed)
}

/// Parses a mapping file, and checks it against a schema registry when one
/// is given. Returns one summary line per entity type.
pub fn check_mappings(mappings: &Path, schemas: Option<&Path>) -> Result<Vec<String>> {
    let spec = MappingSpec::load(mappings)?;
    let registry = schemas.map(SchemaRegistry::load).transpose()?;
    if let Some(registry) = registry.as_ref() {
        let issues = validate_mappings(&spec, registry);
        if !issues.is_empty() {
            bail!("{} problem(s) found:\n  {}", issues.len(), issues.join("\n  "));
        }
    }

    let lines = spec
        .entity_types()
        .filter_map(|ty| spec.get(ty))
        .map(|mapping| {
            format!(
                "{}: {} field(s), key {}, {} link(s)",
                mapping.entity_type,
                mapping.leaf_count(),
                mapping
                    .unique_id_col
                    .as_deref()
                    .map_or_else(|| "none".to_string(), |col| format!("'{col}'")),
                mapping.links.len()
            )
        })
        .collect();
    Ok(lines)
}

/// Field and link targets that the registry does not know about.
pub fn validate_mappings(spec: &MappingSpec, schemas: &SchemaRegistry) -> Vec<String> {
    let mut issues = Vec::new();
    for entity_type in spec.entity_types() {
        let (Some(mapping), Some(schema)) = (spec.get(entity_type), schemas.get(entity_type)) else {
            continue;
        };
        if schema.properties.is_empty() {
            continue;
        }
        let targets = mapping
            .leaf_names()
            .into_iter()
            .chain(mapping.links.iter().map(|l| l.target_field.as_str()));
        for field in targets {
            if !schema.properties.contains_key(field) {
                issues.push(format!("{entity_type}: unknown field '{field}'"));
            }
        }
    }
    issues
}
