mod common;

use assert_cmd::Command;
use common::{TestWorkspace, study_fixture};
use predicates::str::contains;

fn study_etl() -> Command {
    Command::cargo_bin("study-etl").expect("binary exists")
}

#[test]
fn import_prints_report_table() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    study_etl()
        .args(["import", "--config", config.to_str().unwrap()])
        .assert()
        .success()
        .stdout(contains("entity"))
        .stdout(contains("participant"))
        .stdout(contains("family_relationship"));
    assert!(ws.cache_path().exists());
}

#[test]
fn update_then_drop_data() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    let config = config.to_str().unwrap();
    study_etl().args(["import", "-c", config]).assert().success();
    study_etl()
        .args(["update", "--config", config])
        .assert()
        .success()
        .stdout(contains("updated"));
    study_etl()
        .args(["drop-data", "--config", config])
        .assert()
        .success()
        .stdout(contains("Removed 8 row(s)"));
}

#[test]
fn update_with_corrupt_cache_fails() {
    let ws = TestWorkspace::new();
    let config = study_fixture(&ws);
    ws.write("cache/demo/cache_kf_id.json", "[1, 2");
    study_etl()
        .args(["update", "--config", config.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("error:"))
        .stderr(contains("corrupt"));
}

#[test]
fn check_mappings_lists_entities() {
    let ws = TestWorkspace::new();
    study_fixture(&ws);
    let mappings = ws.path().join("mappings.yml");
    let schemas = ws.path().join("schemas.json");
    study_etl()
        .args([
            "check-mappings",
            "--mappings",
            mappings.to_str().unwrap(),
            "--schemas",
            schemas.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(contains("diagnosis: 3 field(s), key 'diagnosis_id', 1 link(s)"));
}

#[test]
fn check_mappings_rejects_unknown_entity() {
    let ws = TestWorkspace::new();
    let mappings = ws.write("bad.yml", "sample:\n  _unique_id_col: id\n");
    study_etl()
        .args(["check-mappings", "-m", mappings.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("Unknown entity type 'sample'"));
}

#[test]
fn missing_config_is_reported() {
    let ws = TestWorkspace::new();
    let missing = ws.path().join("nope.yml");
    study_etl()
        .args(["import", "--config", missing.to_str().unwrap()])
        .assert()
        .failure()
        .stderr(contains("nope.yml"));
}
