//! Smoke tests -- verify the binary runs and the subcommands are wired up.

use std::io::Write;

use assert_cmd::Command;
use predicates::prelude::*;

fn speedcheck() -> Command {
    let mut cmd = Command::cargo_bin("speedcheck").unwrap();
    cmd.env_remove("SPEEDCHECK_CATALOG")
        .env_remove("SPEEDCHECK_CONFIG");
    cmd
}

#[test]
fn test_cli_help() {
    speedcheck()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicates::str::contains("Failover-aware"));
}

#[test]
fn test_cli_version() {
    speedcheck()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicates::str::contains("speedcheck"));
}

#[test]
fn test_run_subcommand_exists() {
    speedcheck()
        .args(["run", "--help"])
        .assert()
        .success()
        .stdout(predicates::str::contains("--timeout"));
}

#[test]
fn test_servers_lists_embedded_catalog() {
    speedcheck()
        .arg("servers")
        .assert()
        .success()
        .stdout(predicates::str::contains("Cloudflare"));
}

#[test]
fn test_servers_json_from_toml_catalog() {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    writeln!(
        file,
        r#"
[[servers]]
name = "lab"
downloadUrl = "http://10.0.0.2/down"
uploadUrl = "http://10.0.0.2/up"
uploadSizeBytes = 1000000
"#
    )
    .unwrap();

    speedcheck()
        .args(["servers", "--json", "--catalog"])
        .arg(file.path())
        .assert()
        .success()
        .stdout(predicates::str::contains("\"name\": \"lab\""));
}

#[test]
fn test_broken_catalog_fails() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(file, "{{ not json").unwrap();

    speedcheck()
        .args(["servers", "--catalog"])
        .arg(file.path())
        .assert()
        .failure()
        .stderr(predicates::str::contains("failed to load server list"));
}

#[test]
fn test_run_against_unreachable_servers_fails() {
    let mut file = tempfile::Builder::new().suffix(".json").tempfile().unwrap();
    write!(
        file,
        r#"[{{"name": "closed", "downloadUrl": "http://127.0.0.1:1/down", "uploadUrl": "http://127.0.0.1:1/up"}}]"#
    )
    .unwrap();

    speedcheck()
        .args(["run", "--json", "--catalog"])
        .arg(file.path())
        .assert()
        .failure()
        .stdout(predicates::str::contains("\"outcome\": \"exhausted\""))
        .stderr(predicate::str::contains("All speed test servers failed."));
}
