//! CLI integration tests using assert_cmd

use std::fs;
use std::path::PathBuf;

use assert_cmd::Command;
use predicates::prelude::*;
use tempfile::TempDir;

fn taskmill() -> Command {
    Command::cargo_bin("taskmill").unwrap()
}

/// Write a minimal config rooted in the temp dir and return its path
fn write_config(dir: &TempDir) -> PathBuf {
    let path = dir.path().join("config.toml");
    let workdir = dir.path().join("work");
    fs::write(
        &path,
        format!(
            r#"
[engine]
default_queue = "localhost"
workdir = "{}"
poll_initial_ms = 50
poll_max_ms = 200

[hosts.localhost]
kind = "local"
"#,
            workdir.display()
        ),
    )
    .unwrap();
    path
}

#[test]
fn version_prints_build_info() {
    taskmill()
        .arg("version")
        .assert()
        .success()
        .stdout(predicate::str::contains("taskmill"))
        .stdout(predicate::str::contains("Build Information:"));
}

#[test]
fn config_init_and_validate() {
    let dir = TempDir::new().unwrap();
    let path = dir.path().join("config.toml");

    taskmill()
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration written"));

    // Refuses to overwrite without --force
    taskmill()
        .args(["config", "init", "--path"])
        .arg(&path)
        .assert()
        .failure()
        .code(10);

    taskmill()
        .arg("--config")
        .arg(&path)
        .args(["config", "validate"])
        .assert()
        .success()
        .stdout(predicate::str::contains("Configuration OK"));
}

#[test]
fn config_show_renders_toml() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["config", "show"])
        .assert()
        .success()
        .stdout(predicate::str::contains("default_queue = \"localhost\""));
}

#[test]
fn explicit_missing_config_is_a_config_error() {
    taskmill()
        .args(["--config", "/nonexistent/taskmill.toml", "status"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("E100"));
}

#[test]
fn run_bare_command_to_completion() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "echo from-the-host"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"));
}

#[test]
fn failing_command_exits_nonzero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "exit 5"])
        .assert()
        .code(1)
        .stdout(predicate::str::contains("failed: 1"));
}

#[test]
fn status_reports_the_finished_task() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "echo status-me"])
        .assert()
        .success();

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "-d", "2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed"))
        .stdout(predicate::str::contains("echo status-me"));

    // Detail 0 prints nothing; a healthy record set exits zero
    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "-d", "0"])
        .assert()
        .success()
        .stdout(predicate::str::is_empty());
}

#[test]
fn status_detail_zero_reports_through_the_exit_code() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "exit 7"])
        .assert()
        .code(1);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "-d", "0"])
        .assert()
        .code(1)
        .stdout(predicate::str::is_empty());
}

#[test]
fn status_filters_by_fingerprint() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "echo filter-me"])
        .assert()
        .success();

    // A fingerprint nothing matches leaves the report empty
    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "-d", "1", "deadbeef"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tasks"));
}

#[test]
fn status_html_contains_table_ids() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "echo html-me"])
        .assert()
        .success();

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "--html", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("<table class=\"task\" id=\"table_localhost_"));
}

#[test]
fn rerun_is_skipped_and_purge_clears_it() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);
    let out = dir.path().join("work/hosts/localhost/made.txt");

    let command = "echo made > made.txt";
    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", command])
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"));
    assert!(out.exists());

    // Second run skips on the recorded signature
    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", command])
        .assert()
        .success()
        .stdout(predicate::str::contains("skipped: 1"));

    taskmill()
        .arg("--config")
        .arg(&config)
        .arg("purge")
        .assert()
        .success()
        .stdout(predicate::str::contains("1 record(s) purged"));

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["status", "-d", "1", "--all"])
        .assert()
        .success()
        .stdout(predicate::str::contains("0 tasks"));
}

#[test]
fn submit_does_not_wait() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["submit", "-e", "sleep 0.2"])
        .assert()
        .success()
        .stdout(predicate::str::contains("submitted"));
}

#[test]
fn run_accepts_task_descriptor_files() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    let task_file = dir.path().join("task.toml");
    fs::write(&task_file, "command = \"echo from-descriptor\"\n").unwrap();

    taskmill()
        .arg("--config")
        .arg(&config)
        .arg("run")
        .arg(&task_file)
        .assert()
        .success()
        .stdout(predicate::str::contains("completed: 1"));
}

#[test]
fn hosts_lists_configured_targets() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .arg("hosts")
        .assert()
        .success()
        .stdout(predicate::str::contains("localhost"));
}

#[test]
fn unknown_queue_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "true", "--queue", "cluster9"])
        .assert()
        .failure()
        .code(10)
        .stderr(predicate::str::contains("cluster9"));
}

#[test]
fn kill_without_live_tasks_reports_zero() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .arg("kill")
        .assert()
        .success()
        .stdout(predicate::str::contains("0 task(s) killed"));
}

#[test]
fn bad_sig_mode_is_rejected() {
    let dir = TempDir::new().unwrap();
    let config = write_config(&dir);

    taskmill()
        .arg("--config")
        .arg(&config)
        .args(["run", "-e", "true", "--sig-mode", "sometimes"])
        .assert()
        .failure()
        .code(10);
}
