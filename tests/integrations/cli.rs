use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use tempfile::NamedTempFile;

fn promstatus() -> Command {
    let mut cmd = Command::cargo_bin("promstatus").unwrap();
    cmd.env("RUST_LOG", "off");
    cmd
}

#[test]
fn test_check_accepts_valid_format() {
    promstatus()
        .args(["check", "--label-format", "%m;%>s"])
        .assert()
        .success()
        .stdout(predicate::str::contains("(global)"));
}

#[test]
fn test_check_rejects_unknown_directive() {
    promstatus()
        .args(["check", "--label-format", "%m;%q"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("%q"));
}

#[test]
fn test_check_reports_bad_scope() {
    let mut file = NamedTempFile::new().unwrap();
    write!(
        file,
        r#"
        [[scopes]]
        path = "/api"
        label_format = "%m;%{{X-Id"
        "#
    )
    .unwrap();

    promstatus()
        .arg("--config")
        .arg(file.path())
        .arg("check")
        .assert()
        .failure()
        .stderr(predicate::str::contains("/api"));
}

#[test]
fn test_missing_config_file_fails() {
    promstatus()
        .args(["--config", "/nonexistent/promstatus.toml", "check"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("does not exist"));
}
