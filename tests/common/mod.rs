#![allow(dead_code)]

use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};

use study_etl::{
    entity::EntityType,
    store::{Database, PersistenceStore, StoreError},
    value::Record,
};
use tempfile::{TempDir, tempdir};

/// Scratch directory helper that cleans up files automatically on drop.
pub struct TestWorkspace {
    temp_dir: TempDir,
}

impl TestWorkspace {
    /// Creates a fresh scratch directory for the current test case.
    pub fn new() -> Self {
        Self {
            temp_dir: tempdir().expect("temp dir"),
        }
    }

    /// Returns the root path for all files owned by this workspace.
    pub fn path(&self) -> &Path {
        self.temp_dir.path()
    }

    /// Writes `contents` into a file under the workspace and returns the path.
    pub fn write(&self, name: &str, contents: &str) -> PathBuf {
        let path = self.temp_dir.path().join(name);
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent).expect("create parent dirs");
        }
        let mut file = File::create(&path).expect("create temp file");
        file.write_all(contents.as_bytes())
            .expect("write temp file contents");
        path
    }

    pub fn cache_path(&self) -> PathBuf {
        self.path().join("cache").join("demo").join("cache_kf_id.json")
    }

    pub fn open_store(&self) -> Database {
        Database::open(&self.path().join("store")).expect("open store")
    }
}

pub const MAPPINGS: &str = r#"
study:
  external_id: {$col_name: study}
  name: {$col_value: Congenital Heart Defects}
  _unique_id_col: {$col_value: study}
participant:
  external_id: {$col_name: subject}
  gender: {$col_name: sex, $col_value: {F: female, M: male}}
  is_proband: {$col_name: proband_flag, $col_type: boolean}
  ethnicity: null
  _unique_id_col: {$col_value: subject}
  _links:
    study:
      source_fk_col: {$col_name: study}
      target_fk_col: {$col_value: study_id}
diagnosis:
  external_id: {$col_name: diagnosis_id}
  diagnosis: {$col_name: diagnosis}
  age_at_event_days: {$col_name: age_days, $col_type: integer}
  _unique_id_col: {$col_value: diagnosis_id}
  _links:
    participant:
      source_fk_col: {$col_name: subject}
      target_fk_col: {$col_value: participant_id}
family_relationship:
  family: {$col_name: family}
  mother: {$col_name: mother}
  father: {$col_name: father}
  proband: {$col_name: proband}
"#;

pub const SCHEMAS: &str = r#"{
  "participant": {
    "required": ["study_id"],
    "properties": {
      "external_id": {"type": "string"},
      "gender": {"type": "string", "enum": ["female", "male"]},
      "is_proband": {"type": "boolean"},
      "ethnicity": {"type": "string"},
      "study_id": {"type": "string"}
    }
  },
  "diagnosis": {
    "required": ["participant_id"],
    "properties": {
      "external_id": {"type": "string"},
      "diagnosis": {"type": "string"},
      "age_at_event_days": {"type": "integer"},
      "participant_id": {"type": "string"}
    }
  }
}"#;

pub const SUBJECTS: &str = "\
study\tsubject\tsex\tproband_flag\tdiagnosis_id\tdiagnosis\tage_days
phs1\tP001\tF\tyes\tD1\tTetralogy of Fallot\t120
phs1\tM1\tF\tno\tD2\tNone\t9000
phs1\tF1x\tM\tno\t\t\t
phs1\tP001\tF\tyes\tD1\tduplicate row\t1
";

pub const FAMILIES: &str = "\
family,mother,father,proband
F1,M1,F1x,P001
";

pub const CONFIG: &str = "\
etl_package_name: demo
entities: [study, participant, family_relationship, diagnosis]
mappings: mappings.yml
schemas: schemas.json
validate: true
extract:
  default: data/subjects.tsv
  entities:
    family_relationship: data/families.csv
load:
  store: store
  cache_dir: cache
drop_data:
  study:
    attribute: external_id
    value: phs1
";

/// Writes a small two-generation study and returns its config path.
pub fn study_fixture(ws: &TestWorkspace) -> PathBuf {
    ws.write("mappings.yml", MAPPINGS);
    ws.write("schemas.json", SCHEMAS);
    ws.write("data/subjects.tsv", SUBJECTS);
    ws.write("data/families.csv", FAMILIES);
    ws.write("config.yml", CONFIG)
}

/// Wraps a [`Database`] and records every create call it forwards.
pub struct RecordingStore {
    pub inner: Database,
    pub creates: Vec<(EntityType, Record)>,
    pub updates: Vec<(EntityType, String)>,
}

impl RecordingStore {
    pub fn new() -> Self {
        Self {
            inner: Database::new(),
            creates: Vec::new(),
            updates: Vec::new(),
        }
    }
}

impl PersistenceStore for RecordingStore {
    fn begin(&mut self) {
        self.inner.begin();
    }

    fn create(&mut self, entity_type: EntityType, payload: Record) -> Result<String, StoreError> {
        self.creates.push((entity_type, payload.clone()));
        self.inner.create(entity_type, payload)
    }

    fn get(&self, entity_type: EntityType, id: &str) -> Result<Option<Record>, StoreError> {
        self.inner.get(entity_type, id)
    }

    fn update(&mut self, entity_type: EntityType, id: &str, patch: Record) -> Result<(), StoreError> {
        self.updates.push((entity_type, id.to_string()));
        self.inner.update(entity_type, id, patch)
    }

    fn commit(&mut self) -> Result<(), StoreError> {
        self.inner.commit()
    }

    fn rollback(&mut self) {
        self.inner.rollback();
    }
}
