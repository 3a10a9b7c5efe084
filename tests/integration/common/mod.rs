#![allow(dead_code)]

use std::{
    fs,
    path::{Path, PathBuf},
    thread,
    time::{Duration, Instant},
};

use httpmock::prelude::*;

/// Settings that keep startup and teardown fast in tests.
pub const FAST_SETTINGS: &str = r#"settings:
  probe_timeout: 500ms
  probe_interval: 50ms
  probe_attempts: 4
  settle_delay: 100ms
  grace_period: 1s
  monitor_interval: 100ms
"#;

/// One service entry for [`write_config`].
pub struct TestService<'a> {
    pub id: &'a str,
    pub port: u16,
    pub depends_on: &'a [&'a str],
    pub command: String,
}

impl<'a> TestService<'a> {
    /// A service that records its PID in `<dir>/<id>.pid` and then sleeps.
    pub fn sleeper(id: &'a str, port: u16, depends_on: &'a [&'a str], dir: &Path) -> Self {
        Self {
            id,
            port,
            depends_on,
            command: format!(
                "echo $$ > {}; exec sleep 30",
                dir.join(format!("{id}.pid")).display()
            ),
        }
    }
}

/// Writes `stagehand.yaml` into `dir` and returns its path.
pub fn write_config(dir: &Path, services: &[TestService<'_>]) -> PathBuf {
    let mut yaml = String::from("version: \"1\"\n");
    yaml.push_str(FAST_SETTINGS);
    yaml.push_str("services:\n");
    for service in services {
        let deps = service
            .depends_on
            .iter()
            .map(|dep| format!("\"{dep}\""))
            .collect::<Vec<_>>()
            .join(", ");
        yaml.push_str(&format!(
            "  - id: {}\n    port: {}\n    depends_on: [{deps}]\n    start:\n      command: \"{}\"\n",
            service.id, service.port, service.command
        ));
    }

    let path = dir.join("stagehand.yaml");
    fs::write(&path, yaml).expect("failed to write config");
    path
}

/// Mock health endpoint answering `status` with a JSON body.
pub fn health_server(status: u16) -> MockServer {
    let server = MockServer::start();
    server.mock(|when, then| {
        when.method(GET).path("/health");
        let body = if status == 200 { "healthy" } else { "failing" };
        then.status(status)
            .header("content-type", "application/json")
            .body(format!(r#"{{"status": "{body}"}}"#));
    });
    server
}

pub fn read_pid(dir: &Path, id: &str) -> u32 {
    let path = dir.join(format!("{id}.pid"));
    wait_for_path(&path);
    let deadline = Instant::now() + Duration::from_secs(5);
    loop {
        if let Ok(contents) = fs::read_to_string(&path)
            && let Ok(pid) = contents.trim().parse::<u32>()
        {
            return pid;
        }
        if Instant::now() >= deadline {
            panic!("Timed out reading PID from {:?}", path);
        }
        thread::sleep(Duration::from_millis(50));
    }
}

pub fn wait_for_path(path: &Path) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if path.exists() {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }
    panic!("Timed out waiting for {:?} to exist", path);
}

pub fn wait_for_process_exit(pid: u32) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if !stagehand::process::pid_exists(pid) {
            return;
        }
        thread::sleep(Duration::from_millis(100));
    }

    panic!("Timed out waiting for PID {} to exit", pid);
}

/// Polls `check` until it holds or five seconds pass.
pub fn wait_until(what: &str, mut check: impl FnMut() -> bool) {
    let deadline = Instant::now() + Duration::from_secs(5);
    while Instant::now() < deadline {
        if check() {
            return;
        }
        thread::sleep(Duration::from_millis(50));
    }
    panic!("Timed out waiting for {what}");
}
