//! Integration tests for the `wazigate` binary.
//!
//! Only the offline subcommands are exercised here; `serve` binds ports
//! and runs until signalled.
#![allow(clippy::unwrap_used)]

use std::path::Path;

use assert_cmd::cargo::cargo_bin_cmd;
use predicates::prelude::*;

// ── Helpers ─────────────────────────────────────────────────────────

/// A `wazigate` command that ignores the caller's environment and reads
/// its config from `dir`.
fn wazigate_cmd(dir: &Path) -> assert_cmd::Command {
    let mut cmd = cargo_bin_cmd!("wazigate");
    cmd.env("HOME", dir)
        .env("XDG_CONFIG_HOME", dir)
        .env("WAZIGATE_CONFIG", dir.join("config.toml"))
        .env_remove("RUST_LOG")
        .env_remove("NOTIFY_SOCKET")
        .env_remove("WAZIGATE_EDGE_DELAY")
        .env_remove("WAZIGATE_ID");
    for (key, _) in std::env::vars_os() {
        if key.to_string_lossy().starts_with("WAZIUP_") {
            cmd.env_remove(key);
        }
    }
    cmd
}

fn combined_output(output: &std::process::Output) -> String {
    let stdout = String::from_utf8_lossy(&output.stdout);
    let stderr = String::from_utf8_lossy(&output.stderr);
    format!("{stdout}{stderr}")
}

// ── Basic invocation ────────────────────────────────────────────────

#[test]
fn test_help_flag() {
    let dir = tempfile::tempdir().unwrap();
    wazigate_cmd(dir.path()).arg("--help").assert().success().stdout(
        predicate::str::contains("MQTT broker")
            .and(predicate::str::contains("serve"))
            .and(predicate::str::contains("clouds"))
            .and(predicate::str::contains("completions")),
    );
}

#[test]
fn test_version_flag() {
    let dir = tempfile::tempdir().unwrap();
    wazigate_cmd(dir.path())
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains(env!("CARGO_PKG_VERSION")));
}

#[test]
fn test_unknown_subcommand_is_a_usage_error() {
    let dir = tempfile::tempdir().unwrap();
    let output = wazigate_cmd(dir.path()).arg("frobnicate").output().unwrap();
    assert_eq!(output.status.code(), Some(2));
    assert!(combined_output(&output).contains("Usage"));
}

#[test]
fn test_completions_bash() {
    let dir = tempfile::tempdir().unwrap();
    wazigate_cmd(dir.path())
        .args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("wazigate"));
}

// ── config ──────────────────────────────────────────────────────────

#[test]
fn test_config_prints_defaults() {
    let dir = tempfile::tempdir().unwrap();
    wazigate_cmd(dir.path())
        .arg("config")
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#"mqtt_addr = ":1883""#)
                .and(predicate::str::contains(r#"sync_interval = "5s""#))
                .and(predicate::str::contains(r#"clouds_file = "clouds.json""#)),
        );
}

#[test]
fn test_config_honours_file_and_environment() {
    let dir = tempfile::tempdir().unwrap();
    std::fs::write(
        dir.path().join("config.toml"),
        "http_addr = \"\"\nmax_pending = 8\n",
    )
    .unwrap();

    wazigate_cmd(dir.path())
        .arg("config")
        .env("WAZIUP_MQTT_ADDR", "127.0.0.1:1884")
        .env("WAZIGATE_EDGE_DELAY", "30s")
        .assert()
        .success()
        .stdout(
            predicate::str::contains(r#"mqtt_addr = "127.0.0.1:1884""#)
                .and(predicate::str::contains(r#"http_addr = """#))
                .and(predicate::str::contains("max_pending = 8"))
                .and(predicate::str::contains(r#"sync_interval = "30s""#)),
        );
}

#[test]
fn test_config_write_saves_file() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("etc").join("wazigate.toml");
    wazigate_cmd(dir.path())
        .args(["config", "--write", "--config"])
        .arg(&path)
        .assert()
        .success();

    let written = std::fs::read_to_string(&path).unwrap();
    assert!(written.contains("mqtts_addr"), "{written}");
}

#[test]
fn test_invalid_config_exits_with_usage_code() {
    let dir = tempfile::tempdir().unwrap();
    let output = wazigate_cmd(dir.path())
        .arg("config")
        .env("WAZIGATE_EDGE_DELAY", "soon")
        .output()
        .unwrap();
    assert_eq!(output.status.code(), Some(2));
    let text = combined_output(&output);
    assert!(text.contains("sync_interval"), "{text}");
}

// ── clouds ──────────────────────────────────────────────────────────

#[test]
fn test_clouds_lists_registry_without_tokens() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = dir.path().join("clouds.json");
    std::fs::write(
        &clouds,
        r#"{
            "waziup": {
                "id": "waziup", "paused": false,
                "rest": "https://api.waziup.io/api/v2",
                "credentials": { "username": "alice", "token": "hunter2" },
                "statusCode": 401, "statusText": "Unauthorized"
            },
            "lab": { "paused": true, "rest": "https://lab.test/api" }
        }"#,
    )
    .unwrap();

    let output = wazigate_cmd(dir.path())
        .arg("clouds")
        .env("WAZIUP_CLOUDS_FILE", &clouds)
        .output()
        .unwrap();
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert!(stdout.contains("waziup"), "{stdout}");
    assert!(stdout.contains("alice"));
    assert!(stdout.contains("401"));
    assert!(stdout.contains("Unauthorized"));
    assert!(stdout.contains("lab"));
    assert!(stdout.contains("paused"));
    assert!(!stdout.contains("hunter2"));
}

#[test]
fn test_clouds_without_file() {
    let dir = tempfile::tempdir().unwrap();
    wazigate_cmd(dir.path())
        .arg("clouds")
        .env("WAZIUP_CLOUDS_FILE", dir.path().join("missing.json"))
        .assert()
        .success()
        .stderr(predicate::str::contains("No clouds file"));
}

#[test]
fn test_malformed_clouds_file_fails() {
    let dir = tempfile::tempdir().unwrap();
    let clouds = dir.path().join("clouds.json");
    std::fs::write(&clouds, "{ nope").unwrap();
    wazigate_cmd(dir.path())
        .arg("clouds")
        .env("WAZIUP_CLOUDS_FILE", &clouds)
        .assert()
        .failure()
        .code(1);
}
