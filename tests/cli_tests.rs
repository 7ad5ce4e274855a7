//! CLI smoke tests.

use assert_cmd::Command;
use predicates::prelude::*;

fn clamban() -> Command {
    Command::cargo_bin("clamban").unwrap()
}

#[test]
fn help_describes_the_server() {
    clamban()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("Kanban board server"))
        .stdout(predicate::str::contains("--port"));
}

#[test]
fn version_prints() {
    clamban().arg("--version").assert().success();
}

#[test]
fn unknown_flag_fails() {
    clamban().arg("--bogus").assert().failure();
}
