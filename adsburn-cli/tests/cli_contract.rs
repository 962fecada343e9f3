//! Integration tests for core CLI contract behavior.

use predicates::prelude::*;

fn cli_cmd() -> assert_cmd::Command {
    assert_cmd::Command::cargo_bin("adsburn").expect("binary should build")
}

#[test]
fn help_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("adsburn"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn version_exits_zero_and_writes_stdout_only() {
    let mut cmd = cli_cmd();
    cmd.arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("adsburn"))
        .stderr(predicate::str::is_empty());
}

#[test]
fn unknown_flag_fails_with_usage_on_stderr() {
    let mut cmd = cli_cmd();
    cmd.arg("--no-such-flag")
        .assert()
        .failure()
        .stderr(predicate::str::contains("--no-such-flag"));
}

#[test]
fn single_target_without_file_exits_one() {
    let mut cmd = cli_cmd();
    cmd.args(["--target", "AB-01", "--quiet"])
        .assert()
        .failure()
        .code(1);
}
