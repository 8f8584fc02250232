mod common;

use assert_cmd::cargo_bin;
use assert_cmd::prelude::*;
use common::{MEETING_POINT_KEY, commit_hash, write_payments_csv};
use predicates::prelude::*;
use std::process::Command;
use tempfile::tempdir;

#[test]
fn test_cli_routes_matching_pair() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let payments = dir.path().join("payments.csv");
    write_payments_csv(&payments, &[("receiver", 1, "0.5"), ("sender", 1, "0.5")])?;

    let hash = commit_hash(1).to_string();
    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(&payments)
        .args(["--meeting-point-key", MEETING_POINT_KEY]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains("commit_hash,side,amount,status"))
        .stdout(predicate::str::contains(format!("{hash},receiver,0.5,routed")))
        .stdout(predicate::str::contains(format!("{hash},sender,0.5,routed")));

    Ok(())
}

#[test]
fn test_cli_reports_unmatched_legs() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let payments = dir.path().join("payments.csv");
    write_payments_csv(
        &payments,
        &[("receiver", 2, "1.0"), ("sender", 2, "3.0"), ("sender", 3, "1.0")],
    )?;

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(&payments).args([
        "--meeting-point-key",
        MEETING_POINT_KEY,
        "--strict-amounts",
        "--route-timeout-ms",
        "200",
    ]);

    cmd.assert()
        .success()
        .stdout(predicate::str::contains(format!("{},receiver,1.0,timed_out", commit_hash(2))))
        .stdout(predicate::str::contains(format!("{},sender,3.0,timed_out", commit_hash(2))))
        .stdout(predicate::str::contains(format!("{},sender,1.0,timed_out", commit_hash(3))))
        .stdout(predicate::str::contains("routed").not());

    Ok(())
}

#[test]
fn test_cli_skips_malformed_rows() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;
    let payments = dir.path().join("payments.csv");
    std::fs::write(
        &payments,
        "side,commit_hash,amount,meeting_point\nsender,abcd,1.0,00\n",
    )?;

    let mut cmd = Command::new(cargo_bin!());
    cmd.arg(&payments);

    cmd.assert()
        .success()
        .stdout(predicate::eq("commit_hash,side,amount,status\n"))
        .stderr(predicate::str::contains("skipping payment row"));

    Ok(())
}

#[test]
fn test_cli_rejects_invalid_key() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args(["--meeting-point-key", "not-hex"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("meeting point key"));
}

#[test]
fn test_cli_listening_requires_node_key() {
    let mut cmd = Command::new(cargo_bin!());
    cmd.args(["--listen", "127.0.0.1:0", "--run-for-secs", "1"]);

    cmd.assert()
        .failure()
        .stderr(predicate::str::contains("node key"));
}
