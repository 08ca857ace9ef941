//! 命令行端到端测试（不需要硬件）

use assert_cmd::Command;
use predicates::prelude::*;

fn cli() -> Command {
    Command::cargo_bin("openk-cli").unwrap()
}

#[test]
fn test_help_lists_subcommands() {
    cli()
        .arg("--help")
        .assert()
        .success()
        .stdout(predicate::str::contains("calibrate"))
        .stdout(predicate::str::contains("teleop"))
        .stdout(predicate::str::contains("record"))
        .stdout(predicate::str::contains("replay"));
}

#[test]
fn test_config_init_and_check() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("teleop.toml");

    cli()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();
    assert!(path.exists());

    cli()
        .args(["config", "check", "--config"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("openk_leader"));

    // 不带 --force 时不覆盖
    cli()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .failure();
}

#[test]
fn test_teleop_without_config_fails() {
    let dir = tempfile::tempdir().unwrap();
    cli()
        .args(["teleop", "--yes", "--config"])
        .arg(dir.path().join("missing.toml"))
        .assert()
        .failure()
        .stderr(predicate::str::contains("config init"));
}

#[test]
fn test_replay_without_dataset_fails_before_motion() {
    let dir = tempfile::tempdir().unwrap();
    let path = dir.path().join("teleop.toml");
    cli()
        .args(["config", "init", "--config"])
        .arg(&path)
        .assert()
        .success();

    cli()
        .args(["replay", "--episode", "0", "--yes", "--root"])
        .arg(dir.path().join("no-dataset"))
        .arg("--config")
        .arg(&path)
        .assert()
        .failure()
        .stderr(predicate::str::contains("no-dataset"));
}
