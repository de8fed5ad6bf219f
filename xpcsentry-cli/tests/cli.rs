#![allow(clippy::unwrap_used, clippy::expect_used)]

use assert_cmd::prelude::*;
use insta::assert_snapshot;
use predicates::prelude::*;
use std::process::Command;

fn cli() -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("xpcsentry-cli"));
    cmd.arg("--log-level").arg("error");
    cmd
}

#[test]
fn shows_version() -> Result<(), Box<dyn std::error::Error>> {
    let output = Command::new(assert_cmd::cargo::cargo_bin!("xpcsentry-cli"))
        .arg("--version")
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_snapshot!(stdout, @"xpcsentry-cli 0.1.0");
    Ok(())
}

#[test]
fn lists_subcommands() {
    Command::new(assert_cmd::cargo::cargo_bin!("xpcsentry-cli"))
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("resolve"))
        .stdout(predicate::str::contains("services"))
        .stdout(predicate::str::contains("print"))
        .stdout(predicate::str::contains("identity"))
        .stdout(predicate::str::contains("check"));
}

#[test]
fn unresolved_endpoint_prints_empty_path() -> Result<(), Box<dyn std::error::Error>> {
    let output = cli()
        .args(["resolve", "com.nobody.listens.nowhere", "--domain", "gui/501", "--format", "json"])
        .output()?;
    assert!(output.status.success());
    let stdout = String::from_utf8_lossy(&output.stdout);
    assert_snapshot!(stdout, @r#"
    {
      "endpoint": "com.nobody.listens.nowhere",
      "domain": {
        "kind": "gui",
        "id": 501
      },
      "program_path": ""
    }
    "#);
    Ok(())
}

#[test]
fn missing_program_has_empty_identity() -> Result<(), Box<dyn std::error::Error>> {
    let output = cli()
        .args(["identity", "/nonexistent/program", "--format", "json"])
        .output()?;
    assert!(output.status.success());
    let identity: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(identity["path"], "/nonexistent/program");
    assert_eq!(identity["signing_id"], "");
    assert_eq!(identity["team_id"], "");
    Ok(())
}

#[test]
fn check_against_unresolved_owner_is_not_suspicious() -> Result<(), Box<dyn std::error::Error>> {
    let output = cli()
        .args([
            "check",
            "com.nobody.listens.nowhere",
            "--requester",
            "/nonexistent/client",
            "--domain",
            "user/501",
            "--format",
            "json",
        ])
        .output()?;
    assert!(output.status.success());

    let report: serde_json::Value = serde_json::from_slice(&output.stdout)?;
    assert_eq!(report["owner"]["path"], "");
    assert_eq!(report["suspicious"], false);
    assert_eq!(report["reason"], "unresolved_owner");
    Ok(())
}

#[test]
fn rejects_unknown_domain_kind() {
    cli()
        .args(["services", "--domain", "session/1"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Unknown domain kind: session"));
}

#[test]
fn rejects_domain_without_identifier() {
    cli()
        .args(["resolve", "com.example", "--domain", "gui"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("requires a numeric identifier"));
}

#[cfg(not(target_os = "macos"))]
#[test]
fn print_without_supervisor_fails() {
    cli()
        .args(["print", "--domain", "system"])
        .assert()
        .failure()
        .stderr(predicate::str::starts_with("Error:"));
}
