//! Smoke coverage for the CLI surface.

use assert_cmd::Command;
use predicates::prelude::*;

fn podforge() -> Command {
    Command::cargo_bin("podforge").expect("binary should build")
}

#[test]
fn help_lists_the_build_subcommand() {
    podforge()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("build"));
}

#[test]
fn no_arguments_shows_help_and_fails() {
    podforge().assert().failure();
}

#[test]
fn build_requires_a_project_argument() {
    podforge()
        .arg("build")
        .assert()
        .failure()
        .stderr(predicate::str::contains("PROJECT"));
}

#[test]
fn build_flags_are_documented() {
    podforge()
        .args(["build", "--help"])
        .assert()
        .success()
        .stdout(predicate::str::contains("--skip-ui"))
        .stdout(predicate::str::contains("--force"))
        .stdout(predicate::str::contains("--flush"));
}
