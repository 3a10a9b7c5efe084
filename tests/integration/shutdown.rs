#[path = "common/mod.rs"]
mod common;

use std::time::{Duration, Instant};

use common::{TestService, health_server, read_pid, wait_for_process_exit, write_config};
use stagehand::{
    config::load_config, lifecycle::LifecycleStatus, process::StopOutcome,
    shutdown::ShutdownCoordinator, supervisor::Supervisor,
};
use tempfile::tempdir;

fn supervisor_for(dir: &std::path::Path, services: &[TestService<'_>]) -> Supervisor {
    let config_path = write_config(dir, services);
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir)
}

#[test]
fn stubborn_service_is_killed_after_the_grace_period() {
    let dir = tempdir().unwrap();
    let db = health_server(200);
    let api = health_server(200);
    let pid_file = dir.path().join("api.pid");

    let supervisor = supervisor_for(
        dir.path(),
        &[
            TestService::sleeper("db", db.port(), &[], dir.path()),
            TestService {
                id: "api",
                port: api.port(),
                depends_on: &["db"],
                command: format!(
                    "trap '' TERM; echo $$ > {}; while true; do sleep 0.1; done",
                    pid_file.display()
                ),
            },
        ],
    );
    supervisor.start().unwrap();
    let api_pid = read_pid(dir.path(), "api");
    let db_pid = read_pid(dir.path(), "db");

    let started = Instant::now();
    let report = supervisor.stop().unwrap();
    let elapsed = started.elapsed();

    assert!(report.is_clean(), "{:?}", report.failures);
    assert_eq!(report.stopped, vec!["api", "db"]);
    assert_eq!(report.escalated.len(), 1);
    assert_eq!(report.escalated[0].service, "api");
    assert_eq!(report.escalated[0].grace, Duration::from_secs(1));
    assert!(elapsed >= Duration::from_secs(1), "{elapsed:?}");

    wait_for_process_exit(api_pid);
    wait_for_process_exit(db_pid);
    for id in ["api", "db"] {
        assert_eq!(
            supervisor.table().status(id).unwrap(),
            LifecycleStatus::Stopped
        );
    }
}

#[test]
fn stopping_twice_is_a_no_op() {
    let dir = tempdir().unwrap();
    let server = health_server(200);
    let supervisor = supervisor_for(
        dir.path(),
        &[TestService::sleeper("web", server.port(), &[], dir.path())],
    );
    supervisor.start().unwrap();
    let pid = read_pid(dir.path(), "web");

    let first = supervisor.stop().unwrap();
    assert_eq!(first.stopped, vec!["web"]);
    wait_for_process_exit(pid);

    let second = supervisor.stop().unwrap();
    assert!(second.is_clean());
    assert!(second.escalated.is_empty());

    let coordinator = ShutdownCoordinator::new(supervisor.table(), Duration::from_secs(1));
    assert_eq!(
        coordinator.stop_service("web").unwrap(),
        StopOutcome::AlreadyExited
    );
    assert_eq!(
        supervisor.table().status("web").unwrap(),
        LifecycleStatus::Stopped
    );
}

#[test]
fn service_that_already_died_is_reported_stopped() {
    let dir = tempdir().unwrap();
    let server = health_server(200);
    let supervisor = supervisor_for(
        dir.path(),
        &[TestService::sleeper("worker", server.port(), &[], dir.path())],
    );
    supervisor.start().unwrap();
    let pid = read_pid(dir.path(), "worker");

    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    let report = supervisor.stop().unwrap();
    assert!(report.is_clean());
    assert!(report.escalated.is_empty());
    assert_eq!(report.stopped, vec!["worker"]);
    assert!(supervisor.running_services().unwrap().is_empty());
}
