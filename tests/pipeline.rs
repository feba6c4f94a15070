mod common;

use std::fs;

use common::{TestWorkspace, study_fixture};
use study_etl::{
    cache::CacheDocument,
    entity::EntityType,
    etl::{self, RunOptions},
    loader::Operation,
    schema_registry::NOT_REPORTED,
    value::Value,
};

fn read_cache(ws: &TestWorkspace) -> CacheDocument {
    let raw = fs::read_to_string(ws.cache_path()).expect("cache file");
    serde_json::from_str(&raw).expect("cache json")
}

#[test]
fn import_loads_every_entity_type_and_flushes_cache() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);

    let report = etl::run(Operation::Create, &config, RunOptions::default()).unwrap();
    assert_eq!(report.get(EntityType::Study).unwrap().created, 1);
    assert_eq!(report.get(EntityType::Participant).unwrap().created, 3);
    assert_eq!(report.get(EntityType::Diagnosis).unwrap().created, 2);
    assert_eq!(report.get(EntityType::FamilyRelationship).unwrap().created, 2);
    assert_eq!(report.total_failed(), 0);

    let cache = read_cache(&ws);
    assert_eq!(cache[&EntityType::Participant].len(), 3);
    assert_eq!(cache[&EntityType::FamilyRelationship].len(), 2);

    let store = ws.open_store();
    let proband_id = &cache[&EntityType::Participant]["P001"];
    let proband = &store.rows(EntityType::Participant)[proband_id];
    assert_eq!(proband["gender"], Some(Value::from("female")));
    assert_eq!(proband["is_proband"], Some(Value::Boolean(true)));
    assert_eq!(proband["ethnicity"], Some(Value::from(NOT_REPORTED)));
    assert_eq!(
        proband["study_id"],
        Some(Value::from(cache[&EntityType::Study]["phs1"].as_str()))
    );

    let diagnoses = store.rows(EntityType::Diagnosis);
    let first = &diagnoses[&cache[&EntityType::Diagnosis]["D1"]];
    assert_eq!(first["diagnosis"], Some(Value::from("Tetralogy of Fallot")));
    assert_eq!(first["age_at_event_days"], Some(Value::Integer(120)));
}

#[test]
fn update_patches_existing_rows_without_creating() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    etl::run(Operation::Create, &config, RunOptions::default()).unwrap();

    ws.write(
        "data/subjects.tsv",
        "study\tsubject\tsex\tdiagnosis_id\tdiagnosis\n\
         phs1\tP001\tF\tD1\tDouble outlet right ventricle\n\
         phs1\tP999\tM\tD9\tNew diagnosis\n",
    );
    let report = etl::run(Operation::Update, &config, RunOptions::default()).unwrap();
    let diagnosis = report.get(EntityType::Diagnosis).unwrap();
    assert_eq!(diagnosis.created, 0);
    assert_eq!(diagnosis.updated, 1);
    // D9 links to P999, which was never imported, so it is dropped before
    // the update lookup.
    assert_eq!(diagnosis.dropped.len(), 1);
    assert_eq!(report.get(EntityType::Participant).unwrap().skipped, 1);

    let store = ws.open_store();
    assert_eq!(store.count(EntityType::Participant), 3);
    assert_eq!(store.count(EntityType::Diagnosis), 2);
    let cache = read_cache(&ws);
    let d1 = &store.rows(EntityType::Diagnosis)[&cache[&EntityType::Diagnosis]["D1"]];
    assert_eq!(d1["diagnosis"], Some(Value::from("Double outlet right ventricle")));
    // Untouched by the update mapping's surviving columns.
    assert_eq!(d1["age_at_event_days"], Some(Value::Integer(120)));
}

#[test]
fn corrupt_cache_aborts_update_before_any_write() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    ws.write("cache/demo/cache_kf_id.json", "{ this is not json");

    let err = etl::run(Operation::Update, &config, RunOptions::default()).unwrap_err();
    assert!(format!("{err:#}").contains("corrupt"));
    assert!(!ws.path().join("store").join("study.json").exists());
}

#[test]
fn resumed_import_skips_cached_keys() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    etl::run(Operation::Create, &config, RunOptions::default()).unwrap();

    let options = RunOptions {
        resume: true,
        nrows: None,
    };
    let report = etl::run(Operation::Create, &config, options).unwrap();
    assert_eq!(report.get(EntityType::Participant).unwrap().created, 0);
    assert_eq!(report.get(EntityType::Participant).unwrap().skipped, 3);
    assert_eq!(ws.open_store().count(EntityType::Participant), 3);
}

#[test]
fn missing_required_parent_drops_only_that_payload() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    ws.write(
        "data/diagnoses.tsv",
        "subject\tdiagnosis_id\tdiagnosis\n\
         P001\tD1\tTetralogy of Fallot\n\
         GHOST\tD7\tUnknown\n",
    );
    ws.write(
        "config.yml",
        &common::CONFIG.replace(
            "    family_relationship: data/families.csv\n",
            "    family_relationship: data/families.csv\n    diagnosis: data/diagnoses.tsv\n",
        ),
    );

    let report = etl::run(Operation::Create, &config, RunOptions::default()).unwrap();
    let diagnosis = report.get(EntityType::Diagnosis).unwrap();
    assert_eq!(diagnosis.created, 1);
    assert_eq!(diagnosis.dropped.len(), 1);
    assert!(diagnosis.dropped[0].contains("GHOST"));
}

#[test]
fn failed_batch_leaves_earlier_batches_committed() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    // Without a schema registry the unresolved participant link is left
    // null, and the store's foreign-key check rejects the whole batch.
    ws.write(
        "data/diagnoses.tsv",
        "subject\tdiagnosis_id\tdiagnosis\nP001\tD1\tok\nGHOST\tD7\tbroken\n",
    );
    ws.write(
        "config.yml",
        &common::CONFIG
            .replace("schemas: schemas.json\n", "")
            .replace("validate: true\n", "")
            .replace(
                "    family_relationship: data/families.csv\n",
                "    family_relationship: data/families.csv\n    diagnosis: data/diagnoses.tsv\n",
            ),
    );

    let report = etl::run(Operation::Create, &config, RunOptions::default()).unwrap();
    assert_eq!(report.get(EntityType::Diagnosis).unwrap().failed, 2);
    assert_eq!(report.get(EntityType::Participant).unwrap().created, 3);

    let store = ws.open_store();
    assert_eq!(store.count(EntityType::Participant), 3);
    assert_eq!(store.count(EntityType::Diagnosis), 0);
    let cache = read_cache(&ws);
    assert!(!cache.contains_key(&EntityType::Diagnosis) || cache[&EntityType::Diagnosis].is_empty());
}

#[test]
fn drop_data_removes_the_study_and_its_descendants() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    etl::run(Operation::Create, &config, RunOptions::default()).unwrap();

    let removed = etl::drop_data(&config).unwrap();
    // study + 3 participants + 2 diagnoses + 2 family relationships
    assert_eq!(removed, 8);
    let store = ws.open_store();
    for ty in [
        EntityType::Study,
        EntityType::Participant,
        EntityType::Diagnosis,
        EntityType::FamilyRelationship,
    ] {
        assert_eq!(store.count(ty), 0, "{ty} rows remain");
    }
    assert_eq!(etl::drop_data(&config).unwrap(), 0);
}

#[test]
fn check_mappings_summarises_each_entity_type() {
    let ws = TestWorkspace::new();
    study_fixture(&ws);
    let lines = etl::check_mappings(
        &ws.path().join("mappings.yml"),
        Some(&ws.path().join("schemas.json")),
    )
    .unwrap();
    assert_eq!(lines.len(), 4);
    assert!(lines.iter().any(|l| l == "participant: 4 field(s), key 'subject', 1 link(s)"));
    assert!(lines.iter().any(|l| l.starts_with("family_relationship:") && l.contains("key none")));
}

#[test]
fn drop_data_keeps_an_investigator_shared_with_another_study() {
    let ws = TestWorkspace::new();
    ws.write(
        "mappings.yml",
        r#"
investigator:
  name: {$col_name: pi}
  _unique_id_col: {$col_value: pi}
study:
  external_id: {$col_name: study}
  _unique_id_col: {$col_value: study}
  _links:
    investigator:
      source_fk_col: {$col_name: pi}
      target_fk_col: {$col_value: investigator_id}
"#,
    );
    ws.write("data/studies.tsv", "study\tpi\nphs1\tSeidman\nphs2\tSeidman\n");
    let config_for = |study: &str| {
        format!(
            "etl_package_name: demo\n\
             entities: [investigator, study]\n\
             mappings: mappings.yml\n\
             extract:\n  default: data/studies.tsv\n\
             drop_data:\n  study:\n    attribute: external_id\n    value: {study}\n"
        )
    };
    let config = ws.write("config.yml", &config_for("phs1"));
    etl::run(Operation::Create, &config, RunOptions::default()).unwrap();
    assert_eq!(ws.open_store().count(EntityType::Investigator), 1);

    assert_eq!(etl::drop_data(&config).unwrap(), 1);
    let store = ws.open_store();
    assert_eq!(store.count(EntityType::Study), 1);
    assert_eq!(store.count(EntityType::Investigator), 1);

    ws.write("config.yml", &config_for("phs2"));
    // The last study referencing the investigator takes it along.
    assert_eq!(etl::drop_data(&config).unwrap(), 2);
    let store = ws.open_store();
    assert_eq!(store.count(EntityType::Study), 0);
    assert_eq!(store.count(EntityType::Investigator), 0);
}
