use assert_cmd::Command;
use predicates::prelude::*;

#[test]
fn help_lists_all_commands() {
    Command::cargo_bin("hostforge-backup")
        .unwrap()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("snapshot"))
        .stdout(predicate::str::contains("restore"))
        .stdout(predicate::str::contains("list-snapshots"))
        .stdout(predicate::str::contains("delete-snapshot"))
        .stdout(predicate::str::contains("test-connection"))
        .stdout(predicate::str::contains("status"));
}

#[test]
fn version_includes_build_timestamp() {
    Command::cargo_bin("hostforge-backup")
        .unwrap()
        .arg("--version")
        .assert()
        .success()
        .stdout(predicate::str::contains("built:"));
}

#[test]
fn restore_requires_a_target() {
    Command::cargo_bin("hostforge-backup")
        .unwrap()
        .arg("restore")
        .assert()
        .failure();
}

#[test]
fn unknown_subcommand_is_rejected() {
    Command::cargo_bin("hostforge-backup")
        .unwrap()
        .arg("frobnicate")
        .assert()
        .failure();
}
