#[path = "common/mod.rs"]
mod common;

use std::fs;

use common::{TestService, health_server, read_pid, wait_for_process_exit, write_config};
use stagehand::{
    config::load_config,
    error::{FailureKind, InvalidRegistry, LifecycleError},
    lifecycle::{LifecycleStatus, Owner},
    supervisor::Supervisor,
};
use tempfile::tempdir;

#[test]
fn healthy_chain_comes_up_phase_by_phase() {
    let dir = tempdir().unwrap();
    let db = health_server(200);
    let api = health_server(200);

    let config_path = write_config(
        dir.path(),
        &[
            TestService::sleeper("db", db.port(), &[], dir.path()),
            TestService::sleeper("api", api.port(), &["db"], dir.path()),
        ],
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());

    let healthy = supervisor.start().unwrap();
    assert_eq!(healthy.len(), 2);

    for id in ["db", "api"] {
        let (status, owner, first_healthy) = supervisor
            .table()
            .with_state(id, |state| {
                (state.status, state.owner, state.first_healthy_at.is_some())
            })
            .unwrap();
        assert_eq!(status, LifecycleStatus::Healthy, "{id}");
        assert_eq!(owner, Owner::Monitor, "{id}");
        assert!(first_healthy, "{id}");
    }

    // The dependency was healthy before the dependent was spawned.
    let db_healthy_at = supervisor
        .table()
        .with_state("db", |state| state.first_healthy_at)
        .unwrap()
        .unwrap();
    let api_started_at = supervisor
        .table()
        .with_state("api", |state| state.process.as_ref().map(|p| p.started_at()))
        .unwrap()
        .unwrap();
    assert!(db_healthy_at <= api_started_at);

    let pids = [read_pid(dir.path(), "db"), read_pid(dir.path(), "api")];
    let report = supervisor.stop().unwrap();
    assert!(report.is_clean());
    assert_eq!(report.stopped, vec!["api", "db"]);
    for pid in pids {
        wait_for_process_exit(pid);
    }
}

#[test]
fn unhealthy_phase_rolls_back_everything_started() {
    let dir = tempdir().unwrap();
    let a = health_server(200);
    let b = health_server(200);
    let c = health_server(500);
    let d = health_server(200);
    let marker = dir.path().join("d-started");

    let mut services = vec![
        TestService::sleeper("a", a.port(), &[], dir.path()),
        TestService::sleeper("b", b.port(), &[], dir.path()),
        TestService::sleeper("c", c.port(), &["a", "b"], dir.path()),
    ];
    services.push(TestService {
        id: "d",
        port: d.port(),
        depends_on: &["c"],
        command: format!("touch {}; exec sleep 30", marker.display()),
    });
    let config_path = write_config(dir.path(), &services);

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());
    assert_eq!(
        supervisor.registry().phases(),
        &[
            vec!["a".to_string(), "b".to_string()],
            vec!["c".to_string()],
            vec!["d".to_string()],
        ]
    );

    let err = supervisor.start().unwrap_err();
    let aborted = match err {
        LifecycleError::StartupAborted(aborted) => aborted,
        other => panic!("expected startup abort, got {other}"),
    };
    assert_eq!(aborted.service, "c");
    assert_eq!(aborted.kind, FailureKind::HealthCheckUnhealthy);
    assert_eq!(aborted.rolled_back, vec!["c", "a", "b"]);

    for id in ["a", "b", "c", "d"] {
        assert_eq!(
            supervisor.table().status(id).unwrap(),
            LifecycleStatus::Stopped,
            "{id}"
        );
    }
    for id in ["a", "b", "c"] {
        wait_for_process_exit(read_pid(dir.path(), id));
    }
    assert!(!marker.exists(), "d must never be spawned");
    assert!(supervisor.running_services().unwrap().is_empty());

    let c_failure = supervisor
        .table()
        .with_state("c", |state| state.last_failure)
        .unwrap();
    assert_eq!(c_failure, Some(FailureKind::HealthCheckUnhealthy));
}

#[test]
fn cyclic_config_is_rejected_before_anything_runs() {
    let dir = tempdir().unwrap();
    let marker = dir.path().join("spawned");
    let touch = format!("touch {}; exec sleep 30", marker.display());

    let config_path = write_config(
        dir.path(),
        &[
            TestService {
                id: "a",
                port: 9301,
                depends_on: &["c"],
                command: touch.clone(),
            },
            TestService {
                id: "b",
                port: 9302,
                depends_on: &["a"],
                command: touch.clone(),
            },
            TestService {
                id: "c",
                port: 9303,
                depends_on: &["b"],
                command: touch,
            },
        ],
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();

    match Supervisor::from_config(&config) {
        Err(LifecycleError::InvalidRegistry(InvalidRegistry::DependencyCycle { cycle })) => {
            for id in ["a", "b", "c"] {
                assert!(cycle.contains(id), "{cycle}");
            }
        }
        Err(other) => panic!("expected a dependency cycle, got {other}"),
        Ok(_) => panic!("cyclic registry must be rejected"),
    }
    assert!(!marker.exists());
    assert!(!dir.path().join("state.json").exists());
}

#[test]
fn failing_build_aborts_before_the_service_starts() {
    let dir = tempdir().unwrap();
    let server = health_server(200);
    let marker = dir.path().join("started");

    let yaml = format!(
        r#"version: "1"
{settings}services:
  - id: web
    port: {port}
    build:
      command: "echo compiling; exit 3"
    start:
      command: "touch {marker}; exec sleep 30"
"#,
        settings = common::FAST_SETTINGS,
        port = server.port(),
        marker = marker.display(),
    );
    let config_path = dir.path().join("stagehand.yaml");
    fs::write(&config_path, yaml).unwrap();

    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());

    match supervisor.start() {
        Err(LifecycleError::StartupAborted(aborted)) => {
            assert_eq!(aborted.service, "web");
            assert_eq!(aborted.kind, FailureKind::BuildFailure);
        }
        other => panic!("expected build failure, got {other:?}"),
    }
    assert!(!marker.exists());
    assert_eq!(
        supervisor.table().status("web").unwrap(),
        LifecycleStatus::Stopped
    );
}
