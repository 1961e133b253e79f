use assert_cmd::Command;
use predicates::prelude::*;
use std::fs;
use std::path::Path;
use tempfile::tempdir;

/// Helper: a command wired to an isolated data directory.
fn permlock(data_dir: &Path) -> Command {
    let mut cmd = Command::cargo_bin("permlock-cli").unwrap();
    cmd.env("PERMLOCK_DATA_DIR", data_dir);
    cmd
}

#[test]
fn help_lists_the_hardening_surface() {
    let mut cmd = Command::cargo_bin("permlock-cli").unwrap();
    cmd.arg("--help");
    cmd.assert().success().stdout(
        predicate::str::contains("harden")
            .and(predicate::str::contains("encrypt"))
            .and(predicate::str::contains("audit-log"))
            .and(predicate::str::contains("verify-audit")),
    );
}

#[test]
fn gen_password_respects_length() {
    let output = Command::cargo_bin("permlock-cli")
        .unwrap()
        .args(["gen-password", "--length", "24"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let password = String::from_utf8(output.stdout).unwrap();
    assert_eq!(password.trim_end().len(), 24);
}

#[test]
fn check_password_reads_the_environment() {
    let mut cmd = Command::cargo_bin("permlock-cli").unwrap();
    cmd.env("PERMLOCK_PASSWORD", "abc");
    cmd.arg("check-password");
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("(1/6)"));
}

#[test]
fn scan_reports_current_and_suggested_modes() {
    let dir = tempdir().unwrap();
    let file = dir.path().join("a.txt");
    fs::write(&file, "x").unwrap();

    let mut cmd = Command::cargo_bin("permlock-cli").unwrap();
    cmd.arg("scan").arg(&file);
    cmd.assert()
        .success()
        .stdout(predicate::str::contains("a.txt"));
}

#[cfg(unix)]
#[test]
fn harden_changes_modes_then_revert_undoes_them() {
    use std::os::unix::fs::PermissionsExt;

    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let file = dir.path().join("loose.sh");
    fs::write(&file, "#!/bin/sh\n").unwrap();
    fs::set_permissions(&file, fs::Permissions::from_mode(0o777)).unwrap();

    permlock(&data)
        .arg("harden")
        .arg(&file)
        .args(["--mode", "600"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"));
    let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o600);

    permlock(&data)
        .arg("audit-log")
        .assert()
        .success()
        .stdout(predicate::str::contains("permission_changed"));
    permlock(&data)
        .arg("verify-audit")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tampered"));
    permlock(&data).arg("status").assert().success();

    // The change history feeds the revert path.
    permlock(&data)
        .args(["history", "--risk", "medium"])
        .assert()
        .success()
        .stdout(predicate::str::contains("777 -> 600"));
    permlock(&data).args(["revert", "1"]).assert().success();
    let mode = fs::metadata(&file).unwrap().permissions().mode() & 0o7777;
    assert_eq!(mode, 0o777);
}

#[test]
fn backup_validate_and_list_round_trip() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    let file = dir.path().join("doc.txt");
    fs::write(&file, "hello").unwrap();

    let output = permlock(&data)
        .arg("backup")
        .arg(&file)
        .args(["--note", "cli test"])
        .output()
        .unwrap();
    assert!(output.status.success());
    let archive = String::from_utf8(output.stdout).unwrap().trim().to_string();
    assert!(archive.ends_with(".tar.gz"));

    permlock(&data)
        .args(["validate-backup", &archive])
        .assert()
        .success()
        .stdout(predicate::str::contains("checksum ok"));
    permlock(&data)
        .arg("list-backups")
        .assert()
        .success()
        .stdout(predicate::str::contains("cli test"));
}

#[test]
fn restore_rejects_missing_archive() {
    let dir = tempdir().unwrap();
    let data = dir.path().join("data");
    permlock(&data)
        .args(["restore", "/nonexistent/backup.tar.gz", "/tmp/out"])
        .assert()
        .failure();
}
