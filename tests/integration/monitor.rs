#[path = "common/mod.rs"]
mod common;

use std::{sync::mpsc, time::Duration};

use common::{
    TestService, health_server, read_pid, wait_for_process_exit, wait_until, write_config,
};
use httpmock::prelude::*;
use stagehand::{config::load_config, lifecycle::LifecycleStatus, supervisor::Supervisor};
use tempfile::tempdir;

fn healthy_mock(server: &MockServer) -> httpmock::Mock<'_> {
    server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(200)
            .header("content-type", "application/json")
            .body(r#"{"status": "healthy"}"#);
    })
}

#[test]
fn monitor_flips_status_with_the_endpoint() {
    let dir = tempdir().unwrap();
    let server = MockServer::start();
    let mut healthy = healthy_mock(&server);

    let config_path = write_config(
        dir.path(),
        &[TestService::sleeper("api", server.port(), &[], dir.path())],
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());
    supervisor.start().unwrap();

    let (tx, rx) = mpsc::channel();
    let monitor = supervisor.spawn_monitor(Some(tx));

    let first = rx.recv_timeout(Duration::from_secs(5)).unwrap();
    assert!(first.snapshots["api"].request_count >= 1);
    assert_eq!(
        supervisor.table().status("api").unwrap(),
        LifecycleStatus::Healthy
    );

    healthy.delete();
    let mut failing = server.mock(|when, then| {
        when.method(GET).path("/health");
        then.status(503);
    });
    wait_until("api to turn unhealthy", || {
        supervisor.table().status("api").unwrap() == LifecycleStatus::Unhealthy
    });

    failing.delete();
    let _recovered = healthy_mock(&server);
    wait_until("api to recover", || {
        supervisor.table().status("api").unwrap() == LifecycleStatus::Healthy
    });

    monitor.stop();
    let snapshot = supervisor.metrics().snapshot("api");
    assert!(snapshot.error_count >= 1);
    assert!(snapshot.request_count > snapshot.error_count);

    let pid = read_pid(dir.path(), "api");
    supervisor.stop().unwrap();
    wait_for_process_exit(pid);
}

#[test]
fn monitor_marks_a_dead_process_failed() {
    let dir = tempdir().unwrap();
    let server = health_server(200);
    let config_path = write_config(
        dir.path(),
        &[TestService::sleeper("worker", server.port(), &[], dir.path())],
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());
    supervisor.start().unwrap();
    let pid = read_pid(dir.path(), "worker");

    let monitor = supervisor.spawn_monitor(None);
    nix::sys::signal::kill(
        nix::unistd::Pid::from_raw(pid as i32),
        nix::sys::signal::Signal::SIGKILL,
    )
    .unwrap();

    wait_until("worker to be marked failed", || {
        supervisor.table().status("worker").unwrap() == LifecycleStatus::Failed
    });
    monitor.stop();

    let report = supervisor.stop().unwrap();
    assert!(report.is_clean());
    assert_eq!(
        supervisor.table().status("worker").unwrap(),
        LifecycleStatus::Stopped
    );
}

#[test]
fn cancelling_the_session_ends_the_monitor() {
    let dir = tempdir().unwrap();
    let server = health_server(200);
    let config_path = write_config(
        dir.path(),
        &[TestService::sleeper("web", server.port(), &[], dir.path())],
    );
    let config = load_config(Some(config_path.to_str().unwrap())).unwrap();
    let supervisor = Supervisor::from_config(&config)
        .unwrap()
        .with_state_dir(dir.path());
    supervisor.start().unwrap();

    let monitor = supervisor.spawn_monitor(None);
    supervisor.cancellation_token().cancel();
    wait_until("monitor thread to finish", || monitor.is_finished());
    monitor.join();

    supervisor.stop().unwrap();
}
