use std::fs;
use std::path::Path;

use anyhow::{Context, Result};
use serde::de::DeserializeOwned;

pub use serde_yaml::Value as YamlValue;

/// Document syntax, chosen from the file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DocumentFormat {
    Yaml,
    Json,
}

impl DocumentFormat {
    pub fn for_path(path: &Path) -> Self {
        match path.extension().and_then(|ext| ext.to_str()) {
            Some(ext) if ext.eq_ignore_ascii_case("json") => DocumentFormat::Json,
            _ => DocumentFormat::Yaml,
        }
    }
}

fn read_to_string(path: &Path) -> Result<String> {
    fs::read_to_string(path).with_context(|| format!("Opening document {path:?}"))
}

/// Parses YAML or JSON into a generic tree. JSON is parsed with `serde_json`
/// so that error positions match the source syntax.
pub fn parse_str(input: &str, format: DocumentFormat) -> Result<YamlValue> {
    match format {
        DocumentFormat::Yaml => Ok(serde_yaml::from_str(input)?),
        DocumentFormat::Json => {
            let json: serde_json::Value = serde_json::from_str(input)?;
            Ok(serde_yaml::to_value(json)?)
        }
    }
}

pub fn load_value(path: &Path) -> Result<YamlValue> {
    let raw = read_to_string(path)?;
    parse_str(&raw, DocumentFormat::for_path(path))
        .with_context(|| format!("Parsing document {path:?}"))
}

pub fn load_from_path<T: DeserializeOwned>(path: &Path) -> Result<T> {
    let value = load_value(path)?;
    serde_yaml::from_value(value).with_context(|| format!("Reading document {path:?}"))
}
