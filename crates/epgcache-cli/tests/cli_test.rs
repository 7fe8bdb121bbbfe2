#![allow(clippy::unwrap_used)]
#![allow(missing_docs)]

use std::path::Path;

use assert_cmd::cargo_bin_cmd;
use predicates::prelude::{PredicateBooleanExt, predicate};

const GUIDE: &str = r#"<?xml version="1.0" encoding="UTF-8"?>
<tv>
  <programme start="19700101001640 +0000" stop="19700101003320 +0000" channel="7">
    <title lang="en">A</title>
  </programme>
  <programme start="19700101003320 +0000" stop="19700101005000 +0000" channel="7">
    <title lang="en">B</title>
    <desc lang="en">Documentary about rivers</desc>
  </programme>
  <programme start="19700101005000 +0000" stop="19700101010640 +0000" channel="7">
    <title lang="en">C</title>
  </programme>
</tv>"#;

fn write_guide(dir: &Path) -> String {
    let path = dir.join("guide.xml");
    std::fs::write(&path, GUIDE).unwrap();
    path.to_str().unwrap().to_owned()
}

fn dir_arg(dir: &Path) -> String {
    dir.to_str().unwrap().to_owned()
}

#[test]
fn test_health_prints_ok() {
    // Arrange & Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.arg("health")
        .assert()
        .success()
        .stdout(predicate::eq("OK\n"));
}

#[test]
fn test_help_lists_commands() {
    // Arrange & Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("import"))
        .stdout(predicate::str::contains("watch"))
        .stdout(predicate::str::contains("guide"));
}

#[test]
fn test_completions_bash() {
    // Arrange & Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.args(["completions", "bash"])
        .assert()
        .success()
        .stdout(predicate::str::contains("epgcache"));
}

#[test]
fn test_range_rejects_bad_time() {
    // Arrange & Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.args(["range", "--channel", "7", "--start", "yesterday", "--end", "10"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("expected epoch seconds or RFC 3339"));
}

#[test]
fn test_import_requires_feed() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();

    // Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.args(["--dir", &dir_arg(dir.path()), "import"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no feed configured"));
}

#[test]
fn test_query_before_import_reports_warming_up() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();

    // Act & Assert
    let mut cmd = cargo_bin_cmd!("epgcache");
    cmd.args(["--dir", &dir_arg(dir.path()), "now", "--channel", "7", "--at", "0"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("no active generation"));
}

#[test]
fn test_range_end_before_start_fails() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let feed = write_guide(dir.path());
    let data = dir_arg(dir.path());
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "import", "--feed", &feed])
        .assert()
        .success();

    // Act & Assert
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "range", "--channel", "7", "--start", "3000", "--end", "1000"])
        .assert()
        .failure()
        .stderr(predicate::str::contains("invalid range"));
}

#[test]
fn test_import_then_query() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let feed = write_guide(dir.path());
    let data = dir_arg(dir.path());

    // Act
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "import", "--feed", &feed])
        .assert()
        .success();

    // Assert
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "range", "--channel", "7", "--start", "1500", "--end", "3500"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "found""#))
        .stdout(predicate::str::contains(r#""title": "A""#))
        .stdout(predicate::str::contains(r#""title": "C""#));

    cargo_bin_cmd!("epgcache")
        .args([
            "--dir",
            &data,
            "now",
            "--channel",
            "7",
            "--at",
            "1970-01-01T00:41:40Z",
        ])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""title": "B""#));

    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "now", "--channel", "99", "--at", "2500"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "channelNotFound""#));

    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "search", "--query", "rivers"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""start": 2000"#));

    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "status"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""generation": "A""#))
        .stdout(predicate::str::contains(r#""entries": 3"#));
}

#[test]
fn test_now_reports_last_started_program() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let feed = write_guide(dir.path());
    let data = dir_arg(dir.path());
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "import", "--feed", &feed])
        .assert()
        .success();

    // Act & Assert
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "now", "--channel", "7", "--at", "4500"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""status": "found""#))
        .stdout(predicate::str::contains(r#""title": "C""#))
        .stdout(predicate::str::contains("previous").not());

    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "now", "--channel", "7", "--at", "4500", "--around"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""previous""#))
        .stdout(predicate::str::contains(r#""title": "B""#))
        .stdout(predicate::str::contains(r#""title": "C""#));
}

#[test]
fn test_feed_from_config_file() {
    // Arrange
    let dir = tempfile::tempdir().unwrap();
    let feed = write_guide(dir.path());
    std::fs::write(
        dir.path().join("config.toml"),
        format!("[feed]\nsource = {feed:?}\n\n[search]\nenabled = false\n"),
    )
    .unwrap();
    let data = dir_arg(dir.path());

    // Act
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "import"])
        .assert()
        .success();

    // Assert
    cargo_bin_cmd!("epgcache")
        .args(["--dir", &data, "guide", "--channels", "7,8", "--at", "2500"])
        .assert()
        .success()
        .stdout(predicate::str::contains(r#""title": "B""#))
        .stdout(predicate::str::contains(r#""status": "channelNotFound""#));
}
