//! CLI Integration Tests
//!
//! Tests the command-line interface end-to-end.

use std::fs;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

/// Get the binary to test.
fn stepbook() -> Command {
    Command::cargo_bin("stepbook").unwrap()
}

fn write_book(dir: &TempDir, name: &str, yaml: &str) -> std::path::PathBuf {
    let path = dir.path().join(name);
    if let Some(parent) = path.parent() {
        fs::create_dir_all(parent).unwrap();
    }
    fs::write(&path, yaml).unwrap();
    path
}

// ============================================================================
// Help & Version Tests
// ============================================================================

#[test]
fn test_help_flag() {
    stepbook()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Runbook-driven automation"));
}

#[test]
fn test_version_flag() {
    stepbook()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_run_requires_paths() {
    stepbook().arg("run").assert().failure().stderr(predicate::str::contains("PATHS"));
}

// ============================================================================
// List Tests
// ============================================================================

#[test]
fn test_list_directory() {
    let dir = TempDir::new().unwrap();
    write_book(&dir, "login.yml", "desc: Login flow\nsteps:\n  - test: 'true'\n");
    write_book(&dir, "nested/logout.yaml", "desc: Logout flow\nsteps:\n  - test: 'true'\n");
    write_book(&dir, "notes.txt", "not a runbook");

    stepbook()
        .arg("list")
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("Login flow"))
        .stdout(predicate::str::contains("Logout flow"))
        .stdout(predicate::str::contains("Total: 2 runbooks"));
}

#[test]
fn test_list_json() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "a.yml", "desc: A\nlabels: [smoke]\nsteps:\n  - test: 'true'\n");

    let output = stepbook().args(["list", "--format", "json"]).arg(&path).output().unwrap();
    assert!(output.status.success());
    let listed: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(listed[0]["desc"], "A");
    assert_eq!(listed[0]["labels"][0], "smoke");
    assert_eq!(listed[0]["steps"], 1);
    assert_eq!(listed[0]["id"].as_str().unwrap().len(), 64);
}

#[test]
fn test_list_invalid_runbook_fails() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "bad.yml", "desc: no steps\n");
    stepbook()
        .arg("list")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("at least one step"));
}

// ============================================================================
// Run Tests
// ============================================================================

#[cfg(unix)]
#[test]
fn test_run_exec_and_test() {
    let dir = TempDir::new().unwrap();
    let path = write_book(
        &dir,
        "echo.yml",
        r#"
desc: Echo
vars:
  word: hello
steps:
  - exec: "printf %s {{ vars.word }}"
    test: 'current.exit_code == 0 && current.stdout == "hello"'
"#,
    );

    stepbook()
        .arg("run")
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("1 scenario, 0 skipped, 0 failures"));
}

#[cfg(unix)]
#[test]
fn test_run_failure_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let path = write_book(
        &dir,
        "fail.yml",
        r#"
steps:
  - exec: exit 3
    test: current.exit_code == 0
"#,
    );

    stepbook()
        .arg("run")
        .arg(&path)
        .assert()
        .code(1)
        .stdout(predicate::str::contains("1 failure"))
        .stderr(predicate::str::contains("test failed"));
}

#[cfg(unix)]
#[test]
fn test_run_json_output() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "a.yml", "steps:\n  - exec: 'true'\n");

    let output = stepbook().args(["run", "--format", "json"]).arg(&path).output().unwrap();
    assert!(output.status.success());
    let runs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 1);
    assert_eq!(runs[0]["results"][0]["steps"][0]["outcome"], "success");
}

#[cfg(unix)]
#[test]
fn test_run_times_repeats() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "a.yml", "steps:\n  - exec: 'true'\n");

    let output = stepbook().args(["run", "--times", "3", "--format", "json"]).arg(&path).output().unwrap();
    assert!(output.status.success());
    let runs: serde_json::Value = serde_json::from_slice(&output.stdout).unwrap();
    assert_eq!(runs.as_array().unwrap().len(), 3);
}

#[test]
fn test_run_label_filter() {
    let dir = TempDir::new().unwrap();
    write_book(&dir, "smoke.yml", "labels: [smoke]\nsteps:\n  - test: 'true'\n");
    write_book(&dir, "slow.yml", "labels: [slow]\nsteps:\n  - test: 'false'\n");

    stepbook()
        .args(["run", "--label", "smoke"])
        .arg(dir.path())
        .assert()
        .success()
        .stdout(predicate::str::contains("1 scenario, 0 skipped, 0 failures"));
}

#[test]
fn test_run_profile_written() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "a.yml", "steps:\n  - test: 'true'\n");
    let profile = dir.path().join("profile.json");

    stepbook().arg("run").arg(&path).arg("--profile").arg(&profile).assert().success();

    let dumped: serde_json::Value = serde_json::from_str(&fs::read_to_string(&profile).unwrap()).unwrap();
    assert!(dumped["spans"].is_array());
}

#[test]
fn test_run_wait_timeout_accepts_compound_duration() {
    let dir = TempDir::new().unwrap();
    let path = write_book(&dir, "a.yml", "steps:\n  - test: 'true'\n");
    stepbook().args(["run", "--wait-timeout", "1m30s"]).arg(&path).assert().success();
    stepbook()
        .args(["run", "--wait-timeout", "soon"])
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid duration"));
}

#[test]
fn test_run_invalid_concurrency() {
    stepbook()
        .args(["run", "--concurrent", "0", "x.yml"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("positive number"));
}

// ============================================================================
// Completions Tests
// ============================================================================

#[test]
fn test_completions_bash() {
    stepbook()
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("stepbook"));
}
