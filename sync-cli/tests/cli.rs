//! End-to-end tests of the `classsync` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn classsync(data_dir: &std::path::Path) -> Command {
    let mut cmd = Command::cargo_bin("classsync").unwrap();
    cmd.arg("--data-dir").arg(data_dir);
    cmd
}

#[test]
fn init_then_status() {
    let dir = tempdir().unwrap();

    classsync(dir.path())
        .args(["init", "--name", "Room 12 laptop"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Device initialized"));

    classsync(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Room 12 laptop"))
        .stdout(predicate::str::contains("Paired:        0 device(s)"));
}

#[test]
fn second_init_fails() {
    let dir = tempdir().unwrap();

    classsync(dir.path()).args(["init", "--name", "A"]).assert().success();
    classsync(dir.path())
        .args(["init", "--name", "B"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already initialized"));
}

#[test]
fn edit_shows_in_status_clock() {
    let dir = tempdir().unwrap();

    classsync(dir.path()).args(["init", "--name", "A"]).assert().success();
    classsync(dir.path())
        .args(["edit", "students", "s1", "name", "Ada"])
        .assert()
        .success()
        .stdout(predicate::str::contains("students/s1.name"));

    classsync(dir.path())
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Local changes: 1"));
}

#[test]
fn garbage_qr_fails_without_pairing() {
    let dir = tempdir().unwrap();

    classsync(dir.path()).args(["init", "--name", "A"]).assert().success();
    classsync(dir.path())
        .args(["pair", "definitely-not-a-qr-code"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("Pairing failed"));

    classsync(dir.path())
        .arg("devices")
        .assert()
        .success()
        .stdout(predicate::str::contains("No paired devices"));
}
