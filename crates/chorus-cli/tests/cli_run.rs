//! End-to-end CLI tests using `assert_cmd`
#![cfg_attr(
    test,
    allow(
        dead_code,
        clippy::expect_used,
        clippy::unwrap_used,
        clippy::panic,
        clippy::missing_panics_doc,
        clippy::missing_errors_doc,
        clippy::print_stdout,
        clippy::print_stderr,
        clippy::tests_outside_test_module,
        reason = "Test allows"
    )
)]

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

const ROSTER: &str = r#"
[[agents]]
agent_number = 1
provider = "mock"
model = "draft"

[[agents]]
agent_number = 2
provider = "mock"
model = "review"
depends_on = [1]
"#;

/// Helper to get cargo binary or fail test
fn cargo_bin() -> Command {
    Command::cargo_bin("chorus").unwrap_or_else(|err| panic!("Binary not found: {err}"))
}

/// Writes a roster and a config into a fresh temp dir.
fn workspace(roster: &str) -> (TempDir, PathBuf, PathBuf) {
    let temp = TempDir::new().unwrap_or_else(|err| panic!("Failed to create temp dir: {err}"));
    let roster_path = temp.path().join("agents.toml");
    let config_path = temp.path().join("config.toml");
    fs::write(&roster_path, roster).unwrap();
    fs::write(&config_path, "[watchdog]\ninactivity_timeout_secs = 5\n").unwrap();
    (temp, roster_path, config_path)
}

#[test]
fn test_cli_help() {
    cargo_bin()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Usage"));
}

#[test]
fn test_cli_invalid_command() {
    cargo_bin().arg("invalid-command-xyz").assert().failure();
}

#[test]
fn test_run_streams_every_agent() {
    let (_temp, roster, config) = workspace(ROSTER);

    cargo_bin()
        .env_remove("RUST_LOG")
        .arg("run")
        .arg("--roster")
        .arg(&roster)
        .arg("--prompt")
        .arg("Explain ownership")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("=== Agent 1 (draft) ==="))
        .stdout(predicate::str::contains("Mock response from draft."))
        .stdout(predicate::str::contains("Mock response from review."))
        .stderr(predicate::str::contains("Pipeline complete"))
        .stderr(predicate::str::contains("2 agent(s), 2 call(s)"));
}

#[test]
fn test_run_in_levels_mode() {
    let (_temp, roster, config) = workspace(ROSTER);

    cargo_bin()
        .args(["run", "--mode", "levels", "--prompt", "Plan a trip"])
        .arg("--roster")
        .arg(&roster)
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("Level 2: agents [2]"));
}

#[test]
fn test_missing_provider_is_reported_and_run_finishes() {
    let roster = r#"
[[agents]]
agent_number = 1
provider = "anthropic"
model = "claude-sonnet"

[[agents]]
agent_number = 2
provider = "mock"
model = "review"
"#;
    let (_temp, roster, config) = workspace(roster);

    cargo_bin()
        .env_remove("ANTHROPIC_API_KEY")
        .arg("run")
        .arg("--roster")
        .arg(&roster)
        .arg("--prompt")
        .arg("Hi")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stderr(predicate::str::contains("[agent 1] Error:"))
        .stdout(predicate::str::contains("Mock response from review."));
}

#[test]
fn test_run_with_log_file() {
    let (temp, roster, config) = workspace(ROSTER);
    let log = temp.path().join("chorus.log");

    cargo_bin()
        .env_remove("RUST_LOG")
        .arg("run")
        .arg("--roster")
        .arg(&roster)
        .arg("--prompt")
        .arg("Hi")
        .arg("--config")
        .arg(&config)
        .arg("--log-file")
        .arg(&log)
        .assert()
        .success();

    let contents = fs::read_to_string(&log).unwrap();
    assert!(contents.contains("Pipeline started"));
}

#[test]
fn test_invalid_roster_fails() {
    let (_temp, roster, config) = workspace("[[agents]]\nagent_number = 0\nprovider = \"mock\"\nmodel = \"x\"\n");

    cargo_bin()
        .arg("run")
        .arg("--roster")
        .arg(&roster)
        .arg("--prompt")
        .arg("Hi")
        .arg("--config")
        .arg(&config)
        .assert()
        .failure()
        .stderr(predicate::str::contains("agent_number must start at 1"));
}

#[test]
fn test_config_command_prints_toml() {
    let (_temp, _roster, config) = workspace(ROSTER);

    cargo_bin()
        .arg("config")
        .arg("--config")
        .arg(&config)
        .assert()
        .success()
        .stdout(predicate::str::contains("[watchdog]"))
        .stdout(predicate::str::contains("inactivity_timeout_secs = 5"));
}
