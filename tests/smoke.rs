//! Smoke tests -- verify the binary runs and the operator commands work
//! against a throwaway store.

use assert_cmd::Command;
use predicates::prelude::*;

fn bugwatch() -> Command {
    let mut cmd = Command::cargo_bin("bugwatch").unwrap();
    cmd.env_remove("BUGWATCH_CONFIG").env_remove("BUGWATCH_LOG_JSON");
    cmd
}

/// A config with no sources whose database lives in `dir`.
fn write_config(dir: &std::path::Path) -> std::path::PathBuf {
    let path = dir.join("bugwatch.toml");
    let db = dir.join("bugwatch.db");
    std::fs::write(&path, format!("[storage]\ndatabase = {:?}\n", db.display().to_string())).unwrap();
    path
}

#[test]
fn test_cli_help() {
    bugwatch()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("bug-report volume spikes"));
}

#[test]
fn test_cli_version() {
    bugwatch()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("bugwatch"));
}

#[test]
fn test_subcommands_exist() {
    for sub in ["run", "watch", "status", "reset-baseline"] {
        bugwatch().args([sub, "--help"]).assert().success();
    }
}

#[test]
fn test_run_without_sources_succeeds() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    bugwatch().arg("--config").arg(&config).args(["run", "--dry-run"]).assert().success();
}

#[test]
fn test_run_unknown_source_fails() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["run", "--source", "nope"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no enabled source named 'nope'"));
}

#[test]
fn test_missing_explicit_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    bugwatch()
        .arg("--config")
        .arg(dir.path().join("absent.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("failed to read config file"));
}

#[test]
fn test_reset_baseline_then_status() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());

    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["reset-baseline", "--source", "zendesk", "--key", "all", "--per-hour", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("336 reports over 168 hours"));

    bugwatch()
        .arg("--config")
        .arg(&config)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("=== zendesk").and(predicate::str::contains("2.000")));

    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["status", "--json"])
        .assert()
        .success()
        .stdout(predicate::str::contains("\"observed_count\": 336"));
}

#[test]
fn test_reset_baseline_rejects_bad_rate() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["reset-baseline", "--source", "zendesk", "--key", "all", "--per-hour", "-1"])
        .assert()
        .failure();
}

#[test]
fn test_reset_baseline_rejects_rate_that_rounds_to_zero() {
    let dir = tempfile::tempdir().unwrap();
    let config = write_config(dir.path());
    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["reset-baseline", "--source", "zendesk", "--key", "all", "--per-hour", "0.002"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("rounds to 0 reports"));

    bugwatch()
        .arg("--config")
        .arg(&config)
        .args(["reset-baseline", "--source", "zendesk", "--key", "all", "--per-hour", "0.002"])
        .args(["--window-hours", "5000"])
        .assert()
        .success()
        .stdout(predicate::str::contains("10 reports over 5000 hours"));
}
