use assert_cmd::prelude::*;
use predicates::prelude::*;
use std::fs;
use std::process::Command;
use tempfile::TempDir;

fn write_empty_config(dir: &TempDir) -> std::path::PathBuf {
    let p = dir.path().join("config.yaml");
    fs::write(&p, "sources: []\npublishing:\n  routes: []\n").unwrap();
    p
}

#[test]
fn run_with_no_sources_completes_and_prints_report() {
    let dir = TempDir::new().unwrap();
    let config = write_empty_config(&dir);
    let data_dir = dir.path().join("data");
    let db_path = dir.path().join("state.db");

    let bin = assert_cmd::cargo::cargo_bin!("aggregator");
    Command::new(&bin)
        .args([
            "run",
            "--config",
            config.to_str().unwrap(),
            "--data-dir",
            data_dir.to_str().unwrap(),
            "--db-path",
            db_path.to_str().unwrap(),
            "--no-deliver",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sources_ok\": 0"))
        .stdout(predicate::str::contains("\"sources_err\": 0"));

    assert!(data_dir.join("outputs_dev").exists() || db_path.exists());
}

#[test]
fn inspect_reads_state_without_mutating_it() {
    let dir = TempDir::new().unwrap();
    let config = write_empty_config(&dir);
    let db_path = dir.path().join("state.db");

    let bin = assert_cmd::cargo::cargo_bin!("aggregator");
    Command::new(&bin)
        .args([
            "inspect",
            "--config",
            config.to_str().unwrap(),
            "--db-path",
            db_path.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"sources\""))
        .stdout(predicate::str::contains("\"routes\""));
}

#[test]
fn run_twice_acquires_and_releases_the_lock() {
    let dir = TempDir::new().unwrap();
    let config = write_empty_config(&dir);
    let data_dir = dir.path().join("data");
    let db_path = dir.path().join("state.db");
    let bin = assert_cmd::cargo::cargo_bin!("aggregator");

    for _ in 0..2 {
        Command::new(&bin)
            .args([
                "run",
                "--config",
                config.to_str().unwrap(),
                "--data-dir",
                data_dir.to_str().unwrap(),
                "--db-path",
                db_path.to_str().unwrap(),
                "--no-deliver",
            ])
            .assert()
            .success();
    }
}
