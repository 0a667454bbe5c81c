//! Binary-level CLI surface tests: exercise the compiled
//! `certdeploy-server` binary directly rather than its internals.
//!
//! Scenarios that would require a live SFTP peer and ed25519 key material
//! are covered at the unit level instead (`engine.rs`, `hook.rs`,
//! `scheduler.rs`); these tests stick to config-validation exit-code
//! behavior, which is deterministic and needs no network or crypto
//! fixtures.

use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn server_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("certdeploy-server"))
}

#[test]
fn missing_private_key_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("server.yaml");

    server_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("--push")
        .assert()
        .failure()
        .code(2)
        .stderr(contains("ERROR:certdeploy-server:ConfigError"));
}

#[test]
fn unknown_renew_unit_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("server.yaml");
    fs::write(
        &config_path,
        r#"
private_key: /etc/certdeploy/server_key
renew_unit: fortnight
"#,
    )
    .unwrap();

    server_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("--push")
        .assert()
        .failure()
        .code(2)
        .stderr(contains("ERROR:certdeploy-server:ConfigError"));
}

#[test]
fn negative_push_interval_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("server.yaml");
    fs::write(
        &config_path,
        r#"
private_key: /etc/certdeploy/server_key
push_interval: -5
"#,
    )
    .unwrap();

    server_cmd()
        .arg("--config")
        .arg(&config_path)
        .arg("--push")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn daemon_flag_conflicts_with_lineage_flag() {
    server_cmd()
        .arg("--daemon")
        .arg("--lineage")
        .arg("/etc/letsencrypt/live/example.com")
        .assert()
        .failure()
        .code(2);
}

#[test]
fn help_exits_zero() {
    server_cmd().arg("--help").assert().success();
}
