//! Smoke tests for the `chatsync` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

fn chatsync() -> Command {
    let mut cmd = Command::cargo_bin("chatsync").unwrap();
    cmd.env_remove("RUST_LOG");
    cmd
}

#[test]
fn status_reports_counts() {
    let dir = tempdir().unwrap();
    let db = dir.path().join("chat.db");

    chatsync()
        .arg("--db")
        .arg(&db)
        .arg("status")
        .assert()
        .success()
        .stdout(predicate::str::contains("Messages:"))
        .stdout(predicate::str::contains("Outbox:        0"))
        .stdout(predicate::str::contains("read-write"));
}

#[test]
fn empty_outbox() {
    let dir = tempdir().unwrap();

    chatsync()
        .arg("--db")
        .arg(dir.path().join("chat.db"))
        .arg("outbox")
        .assert()
        .success()
        .stdout(predicate::str::contains("Outbox is empty"));
}

#[test]
fn forced_checkpoint_empties_wal() {
    let dir = tempdir().unwrap();

    chatsync()
        .arg("--db")
        .arg(dir.path().join("chat.db"))
        .args(["checkpoint", "--force"])
        .assert()
        .success()
        .stdout(predicate::str::contains("-> 0 B"));
}

#[test]
fn demo_delivers_offline_sends() {
    chatsync()
        .args(["demo", "--messages", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("send #1: queued"))
        .stdout(predicate::str::contains("Pending in outbox: 0"))
        .stdout(predicate::str::contains("Remote rows: 3"));
}

#[test]
fn missing_config_file_fails() {
    let dir = tempdir().unwrap();

    chatsync()
        .arg("--config")
        .arg(dir.path().join("missing.toml"))
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to load configuration"));
}

#[test]
fn database_path_must_not_be_a_directory() {
    let dir = tempdir().unwrap();

    chatsync()
        .arg("--db")
        .arg(dir.path())
        .arg("status")
        .assert()
        .failure()
        .stderr(predicate::str::contains("Failed to open"));
}
