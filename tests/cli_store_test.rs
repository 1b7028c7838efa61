//! Integration tests for the store administration commands:
//! migrate, status, backup, restore, cleanup, and the legacy import.

mod common;

use common::TestEnv;
use predicates::prelude::*;
use std::fs;

#[test]
fn test_migrate_reports_current_version() {
    let env = TestEnv::new();
    env.magents()
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Store at version 1"));
    assert!(env.db_path().exists());

    // A second run is a no-op at the same version.
    env.magents()
        .arg("migrate")
        .assert()
        .success()
        .stdout(predicate::str::contains("Store at version 1"));
}

#[test]
fn test_status_prints_store_stats() {
    let env = TestEnv::init();
    env.magents()
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("\"version\": 1"))
        .stdout(predicate::str::contains("agents"))
        .stdout(predicate::str::contains("\"journal_mode\": \"wal\""));
}

#[test]
fn test_backup_restore_roundtrip() {
    let env = TestEnv::init();
    let backup_dir = env.path().join("backups");

    env.magents()
        .args(["backup", "--description", "before upgrade"])
        .args(["--backup-dir"])
        .arg(&backup_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("bak-"));

    let backup_file = fs::read_dir(&backup_dir)
        .unwrap()
        .next()
        .unwrap()
        .unwrap()
        .path();

    env.magents()
        .arg("backups")
        .assert()
        .success()
        .stdout(predicate::str::contains("manual"))
        .stdout(predicate::str::contains("before upgrade"));

    // Dry run validates without touching the store.
    env.magents()
        .arg("restore")
        .arg(&backup_file)
        .args(["--dry-run", "--no-backup"])
        .assert()
        .success()
        .stdout(predicate::str::contains("is valid"));

    env.magents()
        .arg("restore")
        .arg(&backup_file)
        .arg("--no-backup")
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored from"));
}

#[test]
fn test_restore_rejects_non_sqlite_file() {
    let env = TestEnv::init();
    let bogus = env.path().join("not-a-backup.db");
    fs::write(&bogus, b"definitely not a database").unwrap();

    env.magents()
        .arg("restore")
        .arg(&bogus)
        .arg("--no-backup")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Error:"));
}

#[test]
fn test_cleanup_reports_counts() {
    let env = TestEnv::init();
    env.magents()
        .args(["cleanup", "--retention-days", "30", "--max-backups", "5"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Removed 0 backups"));
}

fn write_legacy_layout(dir: &std::path::Path) {
    fs::create_dir_all(dir.join("projects")).unwrap();
    fs::create_dir_all(dir.join("agents")).unwrap();
    fs::write(
        dir.join("projects").join("projects.json"),
        serde_json::json!({
            "projects": [{
                "id": "proj-legacy",
                "name": "legacy",
                "path": "/work/legacy",
                "status": "active"
            }]
        })
        .to_string(),
    )
    .unwrap();
    fs::write(
        dir.join("agents").join("agent-1.json"),
        serde_json::json!({
            "id": "agent-legacy",
            "name": "worker",
            "projectId": "proj-legacy",
            "status": "running",
            "worktreePath": "/work/legacy/wt-1"
        })
        .to_string(),
    )
    .unwrap();
}

#[test]
fn test_import_dry_run_then_real_run() {
    let env = TestEnv::init();
    let data_dir = env.path().join("legacy");
    write_legacy_layout(&data_dir);

    env.magents()
        .args(["import", "--dry-run", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("(dry run)"));

    env.magents()
        .args(["import", "--verify", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 of 1 projects, 1 of 1 agents"));
}

#[test]
fn test_rollback_import_restores_sources() {
    let env = TestEnv::init();
    let data_dir = env.path().join("legacy");
    write_legacy_layout(&data_dir);
    let projects_path = data_dir.join("projects").join("projects.json");
    let original = fs::read_to_string(&projects_path).unwrap();

    env.magents()
        .args(["import", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .success();

    fs::write(&projects_path, "{}").unwrap();

    env.magents()
        .args(["rollback-import", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .success()
        .stdout(predicate::str::contains("Restored 2 source files"));
    assert_eq!(fs::read_to_string(&projects_path).unwrap(), original);
    assert!(!env.db_path().exists());
}

#[test]
fn test_rollback_import_without_backups_fails() {
    let env = TestEnv::init();
    let data_dir = env.path().join("legacy");
    fs::create_dir_all(&data_dir).unwrap();

    env.magents()
        .args(["rollback-import", "--data-dir"])
        .arg(&data_dir)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no import backups found"));
}
