//! Binary-level CLI surface tests (§6/§8), mirroring
//! `certdeploy-server/tests/cli.rs`. The client always runs its embedded
//! SFTP receiver and watch-loop orchestrator for the life of the process
//! once config validation succeeds, so only the deterministic,
//! fast-exiting config-error paths are covered here; the daemon's runtime
//! behavior is covered at the unit level (`promoter.rs`, `orchestrator.rs`).

use std::fs;

use assert_cmd::Command;
use predicates::str::contains;
use tempfile::tempdir;

fn client_cmd() -> Command {
    Command::new(assert_cmd::cargo::cargo_bin!("certdeploy-client"))
}

#[test]
fn missing_sftpd_section_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("client.yaml");

    client_cmd()
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .code(2)
        .stderr(contains("ERROR:certdeploy-client:ConfigError"));
}

#[test]
fn sftpd_missing_pubkey_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("client.yaml");
    fs::write(
        &config_path,
        r#"
destination: /etc/nginx/certs
sftpd:
  private_key: /etc/certdeploy/client_key
"#,
    )
    .unwrap();

    client_cmd()
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .code(2)
        .stderr(contains("sftpd.pubkey"));
}

#[test]
fn listen_port_out_of_range_is_a_config_error() {
    let td = tempdir().unwrap();
    let config_path = td.path().join("client.yaml");
    fs::write(
        &config_path,
        r#"
destination: /etc/nginx/certs
sftpd:
  listen_port: 99999
  pubkey: "ssh-ed25519 AAAAC3NzaC1lZDI1NTE5AAAAIQ"
  private_key: /etc/certdeploy/client_key
"#,
    )
    .unwrap();

    client_cmd()
        .arg("--config")
        .arg(&config_path)
        .assert()
        .failure()
        .code(2)
        .stderr(contains("sftpd.listen_port"));
}

#[test]
fn help_exits_zero() {
    client_cmd().arg("--help").assert().success();
}
