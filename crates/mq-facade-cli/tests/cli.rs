//! Command-line tests running the `mq-facade` binary.

use assert_cmd::Command;
use predicates::prelude::*;
use std::io::Write;
use std::time::Duration;

fn mq_facade() -> Command {
    let mut cmd = Command::cargo_bin("mq-facade").unwrap();
    cmd.env_remove("RUST_LOG").env_remove("MQ_CONFIG");
    cmd
}

fn config_file(contents: &str) -> tempfile::NamedTempFile {
    let mut file = tempfile::Builder::new().suffix(".toml").tempfile().unwrap();
    file.write_all(contents.as_bytes()).unwrap();
    file
}

#[test]
fn test_check_config_defaults() {
    mq_facade()
        .arg("check-config")
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn test_check_config_prints_file_values() {
    let file = config_file("[consumer]\nreceive_timeout_ms = 750\n");

    mq_facade()
        .arg("--config")
        .arg(file.path())
        .args(["check-config", "--print"])
        .assert()
        .success()
        .stdout(predicate::str::contains("receive_timeout_ms = 750"));
}

#[test]
fn test_invalid_config_exits_with_configuration_code() {
    let file = config_file("[shutdown]\npoll_interval_ms = 0\n");

    mq_facade()
        .arg("--config")
        .arg(file.path())
        .arg("check-config")
        .assert()
        .code(3)
        .stderr(predicate::str::contains("poll_interval_ms"));
}

/// Verify that the relay echoes stdin through an in-process broker and
/// exits once input ends.
#[test]
fn test_relay_echoes_stdin() {
    let file = config_file("[consumer]\nreceive_timeout_ms = 100\n\n[shutdown]\npoll_interval_ms = 10\n");

    mq_facade()
        .arg("--config")
        .arg(file.path())
        .args(["relay", "--name", "echo", "--url", "vm://cli-echo"])
        .write_stdin("alpha\nbeta\n")
        .timeout(Duration::from_secs(20))
        .assert()
        .success()
        .stdout(predicate::eq("alpha\nbeta\n"));
}

#[test]
fn test_relay_unknown_scheme_fails() {
    mq_facade()
        .args(["relay", "--name", "echo", "--url", "tcp://broker:61616"])
        .write_stdin("")
        .timeout(Duration::from_secs(20))
        .assert()
        .code(2)
        .stderr(predicate::str::contains("tcp"));
}
