#[path = "common/mod.rs"]
mod common;

use std::{fs, path::Path};

use assert_cmd::Command;
use common::{TestService, health_server, read_pid, wait_for_process_exit, write_config};
use predicates::prelude::*;
use serde_json::Value;
use stagehand::runtime::STATE_DIR_ENV;
use tempfile::tempdir;

fn stagehand(state_dir: &Path) -> Command {
    let mut cmd = Command::new(assert_cmd::cargo::cargo_bin!("stagehand"));
    cmd.env(STATE_DIR_ENV, state_dir).env("RUST_LOG", "warn");
    cmd
}

#[test]
fn cyclic_config_fails_without_starting_anything() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let marker = dir.join("spawned");
    let touch = format!("touch {}; exec sleep 30", marker.display());

    let config_path = write_config(
        dir,
        &[
            TestService {
                id: "a",
                port: 9401,
                depends_on: &["b"],
                command: touch.clone(),
            },
            TestService {
                id: "b",
                port: 9402,
                depends_on: &["a"],
                command: touch,
            },
        ],
    );

    stagehand(dir)
        .args(["start", "--detach", "--config"])
        .arg(&config_path)
        .assert()
        .failure()
        .code(1)
        .stderr(predicate::str::contains("cycle"));

    assert!(!marker.exists());
}

#[test]
fn detached_start_then_status_then_stop() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let db = health_server(200);
    let api = health_server(200);

    let config_path = write_config(
        dir,
        &[
            TestService::sleeper("db", db.port(), &[], dir),
            TestService::sleeper("api", api.port(), &["db"], dir),
        ],
    );
    let config = config_path.to_str().unwrap();

    stagehand(dir)
        .args(["start", "--detach", "--config", config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Started 2 service(s)"));

    let pids = [read_pid(dir, "db"), read_pid(dir, "api")];

    stagehand(dir)
        .args(["start", "--detach", "--config", config])
        .assert()
        .failure()
        .stderr(predicate::str::contains("already running"));

    let output = stagehand(dir)
        .args(["status", "--json", "--config", config])
        .output()
        .expect("failed to run status");
    assert!(output.status.success());
    let report: Value = serde_json::from_slice(&output.stdout).expect("status is not JSON");
    let services = report["services"].as_array().unwrap();
    assert_eq!(services.len(), 2);
    for service in services {
        assert_eq!(service["running"], Value::Bool(true), "{service}");
        assert_eq!(service["lifecycle"], "healthy", "{service}");
    }

    stagehand(dir)
        .args(["stop", "--config", config])
        .assert()
        .success();
    for pid in pids {
        wait_for_process_exit(pid);
    }

    let output = stagehand(dir)
        .args(["status", "--json", "--config", config])
        .output()
        .expect("failed to run status");
    let report: Value = serde_json::from_slice(&output.stdout).expect("status is not JSON");
    for service in report["services"].as_array().unwrap() {
        assert_eq!(service["running"], Value::Bool(false), "{service}");
        assert_eq!(service["lifecycle"], "stopped", "{service}");
    }
}

#[test]
fn failed_startup_names_the_service_and_reason() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let good = health_server(200);
    let bad = health_server(500);

    let config_path = write_config(
        dir,
        &[
            TestService::sleeper("cache", good.port(), &[], dir),
            TestService::sleeper("search", bad.port(), &["cache"], dir),
        ],
    );

    stagehand(dir)
        .args(["start", "--detach", "--config"])
        .arg(&config_path)
        .assert()
        .code(1)
        .stderr(
            predicate::str::contains("'search'")
                .and(predicate::str::contains("health_check_unhealthy")),
        );

    for id in ["cache", "search"] {
        wait_for_process_exit(read_pid(dir, id));
    }
}

#[test]
fn logs_prints_captured_output() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let logs = dir.join("logs");
    fs::create_dir_all(&logs).unwrap();
    fs::write(logs.join("api.stdout.log"), "booting\nlistening on 8080\n").unwrap();

    stagehand(dir)
        .args(["logs", "api", "--lines", "1"])
        .assert()
        .success()
        .stdout("listening on 8080\n");
}

#[test]
fn restart_replaces_detached_services() {
    let temp = tempdir().expect("failed to create tempdir");
    let dir = temp.path();
    let server = health_server(200);
    let config_path = write_config(dir, &[TestService::sleeper("web", server.port(), &[], dir)]);
    let config = config_path.to_str().unwrap();

    stagehand(dir)
        .args(["start", "--detach", "--config", config])
        .assert()
        .success();
    let first_pid = read_pid(dir, "web");
    fs::remove_file(dir.join("web.pid")).unwrap();

    stagehand(dir)
        .args(["restart", "--detach", "--config", config])
        .assert()
        .success()
        .stdout(predicate::str::contains("Restarted 1 service(s)"));
    wait_for_process_exit(first_pid);
    let second_pid = read_pid(dir, "web");
    assert_ne!(first_pid, second_pid);

    let output = stagehand(dir)
        .args(["status", "--json", "--config", config])
        .output()
        .expect("failed to run status");
    let report: Value = serde_json::from_slice(&output.stdout).expect("status is not JSON");
    let web = &report["services"][0];
    assert_eq!(web["running"], Value::Bool(true), "{web}");
    assert_eq!(web["restart_count"], 1, "{web}");

    stagehand(dir)
        .args(["stop", "--config", config])
        .assert()
        .success();
    wait_for_process_exit(second_pid);
}
