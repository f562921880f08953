use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::tempdir;

#[test]
fn stress_counts_every_increment() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    #[allow(deprecated)]
    Command::cargo_bin("strand")?
        .current_dir(dir.path())
        .args(["stress", "--threads", "3", "--increments", "20"])
        .assert()
        .success()
        .stdout(predicate::str::contains("final count: 60"))
        .stdout(predicate::str::contains("history length: 5"));
    Ok(())
}

#[test]
fn stress_json_summary() -> Result<(), Box<dyn std::error::Error>> {
    let dir = tempdir()?;

    #[allow(deprecated)]
    let assert = Command::cargo_bin("strand")?
        .current_dir(dir.path())
        .args(["stress", "--threads", "2", "--increments", "10", "--history", "3", "--json"])
        .assert()
        .success();

    let output = String::from_utf8(assert.get_output().stdout.clone())?;
    let json: serde_json::Value = serde_json::from_str(&output)?;
    assert_eq!(json["final_count"], 20);
    assert_eq!(json["history_length"], 3);
    assert_eq!(json["threads"], 2);
    Ok(())
}
