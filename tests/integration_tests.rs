//! CLI integration tests for shipyard.
//!
//! Each test runs the binary in its own scratch directory, so the default
//! `.shipyard/` state paths never collide.

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::TempDir;

fn shipyard(dir: &Path) -> Command {
    let mut cmd = cargo_bin_cmd!("shipyard");
    cmd.current_dir(dir)
        .env_remove("SHIPYARD_CONFIG")
        .env_remove("SHIPYARD_STORE_BACKEND")
        .env_remove("SHIPYARD_STORE_ROOT")
        .env_remove("SHIPYARD_QUEUE_DATABASE")
        .env("RUST_LOG", "warn");
    cmd
}

fn create_project(root: &Path) -> std::path::PathBuf {
    let project = root.join("site");
    fs::create_dir_all(project.join("src")).unwrap();
    fs::write(project.join("package.json"), r#"{"scripts":{"build":"true"}}"#).unwrap();
    fs::write(project.join("src/index.js"), "console.log('hi')").unwrap();
    project
}

/// Submit the project and return the printed deployment id.
fn submit(dir: &TempDir) -> String {
    let project = create_project(dir.path());
    let output = shipyard(dir.path())
        .arg("submit")
        .arg(&project)
        .assert()
        .success()
        .get_output()
        .stdout
        .clone();
    let stdout = String::from_utf8(output).unwrap();
    stdout
        .split_whitespace()
        .nth(1)
        .expect("submit prints the deployment id")
        .to_string()
}

mod cli_basics {
    use super::*;

    #[test]
    fn test_shipyard_help() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .arg("--help")
            .assert()
            .success()
            .stdout(predicate::str::contains("worker"))
            .stdout(predicate::str::contains("router"))
            .stdout(predicate::str::contains("submit"));
    }

    #[test]
    fn test_shipyard_version() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path()).arg("--version").assert().success();
    }

    #[test]
    fn test_unknown_log_format_is_rejected() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["--log-format", "xml", "status", "abc12"])
            .assert()
            .failure();
    }
}

mod deployment_commands {
    use super::*;

    #[test]
    fn test_submit_then_status_is_uploaded() {
        let dir = TempDir::new().unwrap();
        let id = submit(&dir);

        assert_eq!(id.len(), 5);
        assert!(
            id.chars()
                .all(|c| c.is_ascii_digit() || c.is_ascii_lowercase())
        );
        assert!(
            dir.path()
                .join(".shipyard/objects/repos")
                .join(&id)
                .join("src/index.js")
                .exists()
        );

        shipyard(dir.path())
            .args(["status", &id])
            .assert()
            .success()
            .stdout(predicate::str::starts_with("uploaded"));
    }

    #[test]
    fn test_status_json_includes_history() {
        let dir = TempDir::new().unwrap();
        let id = submit(&dir);
        let output = shipyard(dir.path())
            .args(["status", &id, "--json"])
            .assert()
            .success()
            .get_output()
            .stdout
            .clone();
        let report: serde_json::Value = serde_json::from_slice(&output).unwrap();
        assert_eq!(report["id"], id.as_str());
        assert_eq!(report["status"], "uploaded");
        assert_eq!(report["history"].as_array().unwrap().len(), 1);
        assert_eq!(report["history"][0]["status"], "uploaded");
    }

    #[test]
    fn test_enqueue_existing_deployment() {
        let dir = TempDir::new().unwrap();
        let id = submit(&dir);
        shipyard(dir.path())
            .args(["enqueue", &id])
            .assert()
            .success()
            .stdout(predicate::str::contains(format!("deployment {} queued", id)));
    }

    #[test]
    fn test_enqueue_unknown_deployment_fails() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["enqueue", "zzzzz"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No stored source"));
    }

    #[test]
    fn test_invalid_id_is_rejected() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["status", "../../etc"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("Invalid deployment id"));
    }

    #[test]
    fn test_status_of_unknown_deployment_fails() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["status", "abc12"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("No status recorded"));
    }

    #[test]
    fn test_submit_missing_directory_fails() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["submit", "does-not-exist"])
            .assert()
            .failure();
    }
}

mod configuration {
    use super::*;

    #[test]
    fn test_config_file_paths_are_used() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("shipyard.toml"),
            "[store]\nroot = \"objects\"\n\n[queue]\ndatabase = \"state/broker.db\"\n",
        )
        .unwrap();
        let id = submit(&dir);
        assert!(dir.path().join("objects/repos").join(&id).exists());
        assert!(dir.path().join("state/broker.db").exists());
    }

    #[test]
    fn test_env_overrides_default_store_root() {
        let dir = TempDir::new().unwrap();
        let project = create_project(dir.path());
        shipyard(dir.path())
            .env("SHIPYARD_STORE_ROOT", dir.path().join("from-env"))
            .arg("submit")
            .arg(&project)
            .assert()
            .success();
        assert!(dir.path().join("from-env/repos").exists());
    }

    #[test]
    fn test_invalid_config_is_reported() {
        let dir = TempDir::new().unwrap();
        fs::write(
            dir.path().join("shipyard.toml"),
            "[sandbox]\nmemory = \"lots\"\n",
        )
        .unwrap();
        shipyard(dir.path())
            .args(["status", "abc12"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("sandbox.memory"));
    }

    #[test]
    fn test_s3_backend_without_bucket_is_reported() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .env("SHIPYARD_STORE_BACKEND", "s3")
            .env_remove("SHIPYARD_STORE_BUCKET")
            .args(["status", "abc12"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("store.bucket"));
    }

    #[test]
    fn test_explicit_missing_config_fails() {
        let dir = TempDir::new().unwrap();
        shipyard(dir.path())
            .args(["--config", "nope.toml", "status", "abc12"])
            .assert()
            .failure()
            .stderr(predicate::str::contains("does not exist"));
    }
}
