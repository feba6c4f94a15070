use std::{
    collections::{BTreeMap, BTreeSet},
    path::Path,
};

use anyhow::{Context, Result};
use encoding_rs::Encoding;
use log::{debug, info};

use crate::{entity::EntityType, io_utils, value::Value};

/// One source row, addressable by normalised column name.
///
/// A column that is present but empty holds `None`; a column that the
/// source never had is absent altogether.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct Row {
    cells: BTreeMap<String, Option<Value>>,
}

impl Row {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn from_pairs<I, K, V>(pairs: I) -> Self
    where
        I: IntoIterator<Item = (K, V)>,
        K: Into<String>,
        V: Into<Value>,
    {
        Self {
            cells: pairs
                .into_iter()
                .map(|(k, v)| (k.into(), Some(v.into())))
                .collect(),
        }
    }

    pub fn insert(&mut self, column: impl Into<String>, value: Option<Value>) {
        self.cells.insert(column.into(), value);
    }

    pub fn contains(&self, column: &str) -> bool {
        self.cells.contains_key(column)
    }

    /// Value of `column`, or `None` when it is absent or empty.
    pub fn get(&self, column: &str) -> Option<&Value> {
        self.cells.get(column).and_then(|v| v.as_ref())
    }

    pub fn columns(&self) -> impl Iterator<Item = &str> {
        self.cells.keys().map(String::as_str)
    }

    fn is_blank(&self) -> bool {
        self.cells.values().all(Option::is_none)
    }
}

/// Rows for one entity type as produced by an extractor.
#[derive(Debug, Clone, Default)]
pub struct TabularCollection {
    columns: Vec<String>,
    rows: Vec<Row>,
}

impl TabularCollection {
    pub fn new(columns: Vec<String>) -> Self {
        Self {
            columns,
            rows: Vec::new(),
        }
    }

    /// Builds a collection whose columns are the union of the rows' columns.
    pub fn from_rows(rows: Vec<Row>) -> Self {
        let columns = rows
            .iter()
            .flat_map(|row| row.columns().map(str::to_string))
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        Self { columns, rows }
    }

    pub fn push(&mut self, row: Row) {
        for column in row.columns() {
            if !self.has_column(column) {
                self.columns.push(column.to_string());
            }
        }
        self.rows.push(row);
    }

    pub fn columns(&self) -> &[String] {
        &self.columns
    }

    pub fn has_column(&self, column: &str) -> bool {
        self.columns.iter().any(|c| c == column)
    }

    pub fn rows(&self) -> &[Row] {
        &self.rows
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }
}

/// Per-entity collections plus the `default` fallback collection.
#[derive(Debug, Clone, Default)]
pub struct Extraction {
    collections: BTreeMap<EntityType, TabularCollection>,
    default: TabularCollection,
}

impl Extraction {
    pub fn new(default: TabularCollection) -> Self {
        Self {
            collections: BTreeMap::new(),
            default,
        }
    }

    pub fn with_collection(mut self, entity_type: EntityType, rows: TabularCollection) -> Self {
        self.insert(entity_type, rows);
        self
    }

    pub fn insert(&mut self, entity_type: EntityType, rows: TabularCollection) {
        self.collections.insert(entity_type, rows);
    }

    /// The dedicated collection for `entity_type`, falling back to `default`.
    pub fn collection_for(&self, entity_type: EntityType) -> &TabularCollection {
        self.collections.get(&entity_type).unwrap_or(&self.default)
    }
}

/// Reads delimited files into an [`Extraction`].
#[derive(Debug, Clone, Copy)]
pub struct CsvExtractor {
    delimiter: Option<u8>,
    encoding: &'static Encoding,
}

impl CsvExtractor {
    pub fn new(delimiter: Option<u8>, encoding: &'static Encoding) -> Self {
        Self {
            delimiter,
            encoding,
        }
    }

    pub fn extract(
        &self,
        default: &Path,
        per_entity: &BTreeMap<EntityType, std::path::PathBuf>,
    ) -> Result<Extraction> {
        let mut extraction = Extraction::new(self.read_collection(default)?);
        for (entity_type, path) in per_entity {
            let collection = self
                .read_collection(path)
                .with_context(|| format!("Extracting {entity_type} rows from {path:?}"))?;
            extraction.insert(*entity_type, collection);
        }
        Ok(extraction)
    }

    pub fn read_collection(&self, path: &Path) -> Result<TabularCollection> {
        let delimiter = io_utils::resolve_input_delimiter(path, self.delimiter);
        let mut reader = io_utils::open_csv_reader_from_path(path, delimiter)?;
        let headers = io_utils::reader_headers(&mut reader, self.encoding)?
            .iter()
            .map(|h| normalize_column_name(h))
            .collect::<Vec<_>>();

        let mut rows = Vec::new();
        for (idx, record) in reader.byte_records().enumerate() {
            let record = record.with_context(|| format!("Reading row {} in {path:?}", idx + 2))?;
            let decoded = io_utils::decode_record(&record, self.encoding)
                .with_context(|| format!("Decoding row {} in {path:?}", idx + 2))?;
            let mut row = Row::new();
            for (col_idx, header) in headers.iter().enumerate() {
                let cell = decoded
                    .get(col_idx)
                    .map(|s| s.trim())
                    .filter(|s| !s.is_empty())
                    .map(Value::from);
                row.insert(header.clone(), cell);
            }
            if row.is_blank() {
                continue;
            }
            rows.push(row);
        }

        let populated = headers
            .iter()
            .filter(|h| rows.iter().any(|row| row.get(h).is_some()))
            .cloned()
            .collect::<Vec<_>>();
        let dropped = headers.len() - populated.len();
        if dropped > 0 {
            debug!("Dropped {dropped} empty column(s) from {path:?}");
            for row in &mut rows {
                row.cells.retain(|column, _| populated.contains(column));
            }
        }

        info!(
            "Extracted {} row(s) across {} column(s) from {path:?}",
            rows.len(),
            populated.len()
        );
        let mut collection = TabularCollection::new(populated);
        collection.rows = rows;
        Ok(collection)
    }
}

/// Trims a header, replaces inner whitespace with `_` and lowercases it.
pub fn normalize_column_name(name: &str) -> String {
    name.trim()
        .split_whitespace()
        .collect::<Vec<_>>()
        .join("_")
        .to_lowercase()
}
