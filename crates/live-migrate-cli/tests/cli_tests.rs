//! CLI integration tests for live-migrate.
//!
//! These tests verify command-line argument parsing, help output,
//! exit codes, and the commands that need no database connection.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::path::Path;

/// Get a command for the live-migrate binary.
fn cmd() -> Command {
    Command::cargo_bin("live-migrate").unwrap()
}

const RECORD: &str = r#"{
    "migration_uuid": "6f1c1f3e-4a11-4c3e-9a59-2a0c4d1b2f10",
    "source_db": {"type": "postgresql", "host": "src", "database": "app", "user": "u", "schema": "public"},
    "table_list": ["public.orders"]
}"#;

const DESCRIPTOR: &str = r#"{
    "file_format": "csv",
    "has_header": true,
    "data_file_list": [
        {"file_path": "/export/data/orders_data.csv", "table_name": "public.orders", "row_count": 10}
    ]
}"#;

const EXPORTED: &str = r#"[
    {"exporter_role": "SOURCE_DB_EXPORTER", "table_name": "public.orders", "inserts": 5, "updates": 2, "deletes": 0}
]"#;

/// Export directory with migration state and a config pointing at it.
fn export_dir() -> (tempfile::TempDir, std::path::PathBuf) {
    let dir = tempfile::tempdir().unwrap();
    let metainfo = dir.path().join("metainfo");
    std::fs::create_dir_all(&metainfo).unwrap();
    std::fs::write(metainfo.join("migration_status.json"), RECORD).unwrap();
    std::fs::write(metainfo.join("data_file_descriptor.json"), DESCRIPTOR).unwrap();
    std::fs::write(metainfo.join("exported_events_stats.json"), EXPORTED).unwrap();
    let config = write_config(dir.path());
    (dir, config)
}

fn write_config(export_dir: &Path) -> std::path::PathBuf {
    let path = export_dir.join("config.yaml");
    std::fs::write(
        &path,
        format!(
            "export_dir: {}\nimport:\n  parallel_jobs: 2\n",
            export_dir.display()
        ),
    )
    .unwrap();
    path
}

// =============================================================================
// Help and Version Tests
// =============================================================================

#[test]
fn test_help_shows_all_commands() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("import-snapshot"))
        .stdout(predicate::str::contains("apply-events"))
        .stdout(predicate::str::contains("report"))
        .stdout(predicate::str::contains("clear-events"))
        .stdout(predicate::str::contains("health-check"));
}

#[test]
fn test_apply_events_subcommand_help() {
    cmd()
        .args(["apply-events", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--role"))
        .stdout(predicate::str::contains("--file"));
}

#[test]
fn test_role_defaults_to_target() {
    cmd()
        .args(["import-snapshot", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: target]"));
}

#[test]
fn test_version_flag() {
    cmd()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("live-migrate"));
}

// =============================================================================
// Global Flags Tests
// =============================================================================

#[test]
fn test_log_format_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--log-format"))
        .stdout(predicate::str::contains("[default: text]"));
}

#[test]
fn test_verbosity_flag_exists() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("--verbosity"))
        .stdout(predicate::str::contains("[default: info]"));
}

#[test]
fn test_config_default_path() {
    cmd()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("[default: config.yaml]"));
}

// =============================================================================
// Exit Code Tests
// =============================================================================

#[test]
fn test_missing_config_exits_with_code_1() {
    // A missing file is an IO error, not a config error
    cmd()
        .args(["--config", "nonexistent_config_file.yaml", "report"])
        .assert()
        .code(1);
}

#[test]
fn test_invalid_yaml_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "invalid: yaml: content: [").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "report"])
        .assert()
        .code(2);
}

#[test]
fn test_missing_export_dir_exits_with_code_2() {
    let mut file = tempfile::NamedTempFile::new().unwrap();
    writeln!(file, "import:").unwrap();
    writeln!(file, "  parallel_jobs: 4").unwrap();

    cmd()
        .args(["--config", file.path().to_str().unwrap(), "report"])
        .assert()
        .code(2);
}

#[test]
fn test_zero_parallel_jobs_exits_with_code_2() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("config.yaml");
    std::fs::write(
        &path,
        format!("export_dir: {}\nimport:\n  parallel_jobs: 0\n", dir.path().display()),
    )
    .unwrap();

    cmd()
        .args(["--config", path.to_str().unwrap(), "report"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("parallel_jobs"));
}

#[test]
fn test_missing_migration_status_is_state_error() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    cmd()
        .args(["--config", config.to_str().unwrap(), "report"])
        .assert()
        .code(1)
        .stderr(predicate::str::contains("migration status"));
}

#[test]
fn test_unknown_role_exits_with_code_2() {
    let (_dir, config) = export_dir();

    cmd()
        .args(["--config", config.to_str().unwrap(), "health-check", "--role", "replica"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("unknown importer role"));
}

#[test]
fn test_disabled_role_exits_with_code_2() {
    let (_dir, config) = export_dir();

    cmd()
        .args(["--config", config.to_str().unwrap(), "import-snapshot", "--role", "fall-forward"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not enabled"));
}

#[test]
fn test_clear_events_on_disabled_role_exits_with_code_2() {
    let (_dir, config) = export_dir();

    cmd()
        .args(["--config", config.to_str().unwrap(), "clear-events", "--role", "fall-back"])
        .assert()
        .code(2)
        .stderr(predicate::str::contains("not enabled"));
}

#[test]
fn test_unknown_log_format_exits_with_code_2() {
    let (_dir, config) = export_dir();

    cmd()
        .args(["--config", config.to_str().unwrap(), "--log-format", "xml", "report"])
        .assert()
        .code(2);
}

// =============================================================================
// Report Tests
// =============================================================================

#[test]
fn test_report_prints_source_row_and_unreachable_roles() {
    let (dir, config) = export_dir();
    let output = dir.path().join("report.json");

    cmd()
        .args([
            "--config",
            config.to_str().unwrap(),
            "report",
            "--output",
            output.to_str().unwrap(),
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"table_name\": \"orders\""))
        .stdout(predicate::str::contains("\"db_type\": \"source\""))
        .stdout(predicate::str::contains("\"inserts_out\": 5"))
        .stdout(predicate::str::contains("\"final_row_count\": 15"))
        // No target_db in the record: the target role is reported as failed.
        .stdout(predicate::str::contains("\"role\": \"target\""));

    let written = std::fs::read_to_string(&output).unwrap();
    let report: serde_json::Value = serde_json::from_str(&written).unwrap();
    assert_eq!(report["rows"].as_array().unwrap().len(), 1);
    assert_eq!(report["failures"].as_array().unwrap().len(), 1);
}

// =============================================================================
// No Subcommand Tests
// =============================================================================

#[test]
fn test_no_subcommand_shows_help() {
    cmd()
        .assert()
        .failure()
        .stderr(predicate::str::contains("Usage:"));
}
