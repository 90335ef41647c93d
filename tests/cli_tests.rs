//! Binary tests: run `ee-migrate` against a temporary root with no sites,
//! so no docker call is ever needed.

use std::path::Path;
use std::process::{Command, Output};

use ee_migrate::MigrateConfig;
use tempfile::TempDir;

fn write_config(root: &Path) -> std::path::PathBuf {
    let config = MigrateConfig {
        root_dir: root.to_path_buf(),
        docker_bin: "ee-migrate-test-no-docker".to_string(),
        ..Default::default()
    };
    let path = root.join("ee-migrate.json");
    config.save_to_file(&path).unwrap();
    path
}

fn ee_migrate(config: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_ee-migrate"))
        .arg("--config")
        .arg(config)
        .args(args)
        .env_remove("EE_ROOT_DIR")
        .env_remove("RUST_LOG")
        .output()
        .expect("Failed to run ee-migrate")
}

fn stdout(output: &Output) -> String {
    String::from_utf8_lossy(&output.stdout).to_string()
}

#[test]
fn test_status_then_migrate_then_status() {
    let root = TempDir::new().unwrap();
    let config = write_config(root.path());

    let before = ee_migrate(&config, &["status"]);
    assert!(before.status.success());
    let text = stdout(&before);
    assert!(text.contains("pending  20190312102847_add_php_config_volume"));
    assert!(text.contains("pending  20200114093000_update_nginx_security_conf"));

    let migrate = ee_migrate(&config, &["migrate"]);
    assert!(migrate.status.success(), "stderr: {}", String::from_utf8_lossy(&migrate.stderr));
    assert!(stdout(&migrate).contains("Skipped 20190312102847_add_php_config_volume"));
    assert!(root.path().join("db").join("migrations.json").exists());

    let after = ee_migrate(&config, &["status"]);
    assert!(!stdout(&after).contains("pending"));

    let again = ee_migrate(&config, &["migrate"]);
    assert!(stdout(&again).contains("No pending migrations"));
}

#[test]
fn test_dry_run_records_nothing() {
    let root = TempDir::new().unwrap();
    let config = write_config(root.path());

    let output = ee_migrate(&config, &["--dry-run", "migrate"]);
    assert!(output.status.success());
    let text = stdout(&output);
    assert!(text.contains("20190312102847_add_php_config_volume"));
    assert!(text.contains("skipped:"));
    assert!(!root.path().join("db").join("migrations.json").exists());
}

#[test]
fn test_revert_errors_exit_non_zero() {
    let root = TempDir::new().unwrap();
    let config = write_config(root.path());

    let unknown = ee_migrate(&config, &["revert", "20990101000000"]);
    assert_eq!(unknown.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&unknown.stderr).contains("no migration with version"));

    let not_applied = ee_migrate(&config, &["revert", "20200114093000"]);
    assert_eq!(not_applied.status.code(), Some(1));

    let irreversible = ee_migrate(&config, &["--dry-run", "revert", "20190312102847"]);
    assert_eq!(irreversible.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&irreversible.stderr).contains("does not support down()"));
}

#[test]
fn test_invalid_config_is_rejected() {
    let root = TempDir::new().unwrap();
    let path = root.path().join("bad.json");
    std::fs::write(&path, r#"{ "step_timeout_secs": 0 }"#).unwrap();

    let output = ee_migrate(&path, &["status"]);
    assert_eq!(output.status.code(), Some(1));
    assert!(String::from_utf8_lossy(&output.stderr).contains("step_timeout_secs"));
}
