//! Spawning, observing and terminating service processes.
use std::{
    fs::{self, File, OpenOptions},
    io,
    os::unix::process::CommandExt,
    path::Path,
    process::{Child, Command, ExitStatus, Stdio},
    thread,
    time::{Duration, Instant},
};

use chrono::{DateTime, Utc};
use nix::{
    errno::Errno,
    sys::signal::{self, Signal},
    unistd::Pid,
};
use tracing::{debug, error, warn};

use crate::{
    cancel::CancellationToken,
    error::{FailureKind, LifecycleError, ServiceFailure, ShutdownTimeout},
    registry::{Directive, ServiceId},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);
const REAP_TIMEOUT: Duration = Duration::from_secs(2);

/// How a process ended when asked to stop.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum StopOutcome {
    /// The process was already gone before any signal was sent.
    AlreadyExited,
    /// The process exited within the grace period after SIGTERM.
    Graceful,
    /// The grace period elapsed and SIGKILL was sent.
    Escalated,
}

/// A running (or recently running) service process.
///
/// Handles created by [`ProcessHandle::start`] own the [`Child`] and reap it; handles
/// re-attached with [`ProcessHandle::adopt`] only know the PID.
#[derive(Debug)]
pub struct ProcessHandle {
    service: ServiceId,
    pid: u32,
    started_at: DateTime<Utc>,
    child: Option<Child>,
}

impl ProcessHandle {
    /// Spawns `sh -c <command>` in its own process group.
    pub fn start(
        service: &str,
        directive: &Directive,
        log_dir: Option<&Path>,
    ) -> Result<Self, ServiceFailure> {
        debug!(
            "Launching service '{service}' with command: `{}`",
            directive.command
        );

        let child = spawn_command(service, directive, log_dir).map_err(|err| {
            error!("Failed to start service '{service}': {err}");
            ServiceFailure::new(service, FailureKind::StartFailure, err.to_string())
        })?;

        let pid = child.id();
        debug!("Service '{service}' started with PID: {pid}");

        Ok(Self {
            service: service.to_string(),
            pid,
            started_at: Utc::now(),
            child: Some(child),
        })
    }

    /// Re-attaches to a process started by an earlier invocation.
    pub fn adopt(service: &str, pid: u32, started_at: DateTime<Utc>) -> Self {
        Self {
            service: service.to_string(),
            pid,
            started_at,
            child: None,
        }
    }

    pub fn pid(&self) -> u32 {
        self.pid
    }

    pub fn started_at(&self) -> DateTime<Utc> {
        self.started_at
    }

    /// Whether the process still exists. Owned children are reaped as a side effect.
    pub fn is_alive(&mut self) -> bool {
        if let Some(child) = self.child.as_mut() {
            match child.try_wait() {
                Ok(Some(status)) => {
                    debug!("Service '{}' exited with {status}", self.service);
                    return false;
                }
                Ok(None) => return true,
                Err(err) => {
                    debug!("try_wait failed for '{}': {err}", self.service);
                }
            }
        }
        pid_exists(self.pid)
    }

    /// Exit status of an owned child that has already been reaped or just exited.
    pub fn exit_status(&mut self) -> Option<ExitStatus> {
        self.child
            .as_mut()
            .and_then(|child| child.try_wait().ok().flatten())
    }

    /// Sends `signal` to the process group, then to the PID itself. A process that has
    /// already exited is not an error.
    pub fn terminate(&self, signal: Signal) -> Result<(), LifecycleError> {
        let pid = Pid::from_raw(self.pid as i32);
        let own_pgid = unsafe { libc::getpgid(0) };
        let child_pgid = unsafe { libc::getpgid(pid.as_raw()) };

        if child_pgid >= 0 && child_pgid != own_pgid {
            let result = unsafe { libc::killpg(child_pgid, signal as libc::c_int) };
            if result < 0 {
                let err = io::Error::last_os_error();
                match err.raw_os_error() {
                    Some(code) if code == libc::ESRCH => {
                        debug!(
                            "Process group for '{}' missing; falling back to direct signal",
                            self.service
                        );
                    }
                    Some(code) if code == libc::EPERM => {
                        warn!(
                            "Insufficient permissions to signal process group {child_pgid} for '{}'",
                            self.service
                        );
                    }
                    _ => {
                        return Err(LifecycleError::ServiceStopError {
                            service: self.service.clone(),
                            source: err,
                        });
                    }
                }
            } else {
                debug!(
                    "Sent {signal} to process group {child_pgid} for '{}'",
                    self.service
                );
            }
        }

        match signal::kill(pid, Some(signal)) {
            Ok(()) | Err(Errno::ESRCH) => Ok(()),
            Err(err) => Err(LifecycleError::ServiceStopError {
                service: self.service.clone(),
                source: io::Error::from_raw_os_error(err as i32),
            }),
        }
    }

    /// SIGTERM, wait up to `grace`, then SIGKILL.
    pub fn stop_gracefully(&mut self, grace: Duration) -> Result<StopOutcome, LifecycleError> {
        if !self.is_alive() {
            debug!("Service '{}' no longer has a live process", self.service);
            return Ok(StopOutcome::AlreadyExited);
        }

        debug!("Stopping service '{}' (PID {})", self.service, self.pid);
        self.terminate(Signal::SIGTERM)?;
        if self.wait_for_exit(grace) {
            return Ok(StopOutcome::Graceful);
        }

        let timeout = ShutdownTimeout {
            service: self.service.clone(),
            grace,
        };
        warn!("{timeout}");
        self.terminate(Signal::SIGKILL)?;
        if !self.wait_for_exit(REAP_TIMEOUT) {
            error!(
                "Service '{}' (PID {}) survived SIGKILL",
                self.service, self.pid
            );
        }
        Ok(StopOutcome::Escalated)
    }

    /// Polls until the process is gone or `timeout` elapses.
    fn wait_for_exit(&mut self, timeout: Duration) -> bool {
        let deadline = Instant::now() + timeout;
        loop {
            if !self.is_alive() {
                return true;
            }
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                return false;
            }
            thread::sleep(remaining.min(POLL_INTERVAL));
        }
    }
}

/// Runs a build directive to completion, bounded by `timeout` and `cancel`.
pub fn run_directive(
    service: &str,
    directive: &Directive,
    timeout: Duration,
    cancel: &CancellationToken,
    log_dir: Option<&Path>,
) -> Result<(), ServiceFailure> {
    debug!(
        "Running build for '{service}': `{}` in {}",
        directive.command,
        directive.working_dir.display()
    );

    let child = spawn_command(service, directive, log_dir).map_err(|err| {
        ServiceFailure::new(service, FailureKind::BuildFailure, err.to_string())
    })?;
    let mut handle = ProcessHandle {
        service: service.to_string(),
        pid: child.id(),
        started_at: Utc::now(),
        child: Some(child),
    };

    let deadline = Instant::now() + timeout;
    loop {
        if let Some(status) = handle.exit_status() {
            if status.success() {
                debug!("Build for '{service}' finished");
                return Ok(());
            }
            return Err(ServiceFailure::new(
                service,
                FailureKind::BuildFailure,
                format!("build command exited with {status}"),
            ));
        }

        let failure = if cancel.is_cancelled() {
            Some(ServiceFailure::new(
                service,
                FailureKind::Cancelled,
                "build interrupted",
            ))
        } else if Instant::now() >= deadline {
            Some(ServiceFailure::new(
                service,
                FailureKind::BuildFailure,
                format!("build timed out after {timeout:?}"),
            ))
        } else {
            None
        };

        if let Some(failure) = failure {
            if let Err(err) = handle.terminate(Signal::SIGKILL) {
                warn!("Failed to kill build for '{service}': {err}");
            }
            handle.wait_for_exit(REAP_TIMEOUT);
            return Err(failure);
        }

        thread::sleep(POLL_INTERVAL);
    }
}

/// `kill(pid, 0)`: `ESRCH` means gone, anything else (including `EPERM`) means present.
/// Zombies count as gone.
pub fn pid_exists(pid: u32) -> bool {
    match signal::kill(Pid::from_raw(pid as i32), None) {
        Ok(()) | Err(Errno::EPERM) => proc_state(pid) != Some('Z'),
        Err(_) => false,
    }
}

/// Single-letter state from `/proc/<pid>/stat`, where available.
fn proc_state(pid: u32) -> Option<char> {
    let contents = fs::read_to_string(format!("/proc/{pid}/stat")).ok()?;
    // The command name is parenthesised and may contain spaces.
    let (_, rest) = contents.rsplit_once(')')?;
    rest.split_whitespace().next()?.chars().next()
}

fn spawn_command(
    service: &str,
    directive: &Directive,
    log_dir: Option<&Path>,
) -> io::Result<Child> {
    let mut cmd = Command::new("sh");
    cmd.arg("-c").arg(&directive.command);
    cmd.current_dir(&directive.working_dir);
    cmd.stdin(Stdio::null());
    cmd.process_group(0);

    if !directive.env.is_empty() {
        let keys: Vec<_> = directive.env.keys().collect();
        debug!("Setting environment variables: {keys:?}");
        cmd.envs(&directive.env);
    }

    match log_dir {
        Some(dir) => {
            fs::create_dir_all(dir)?;
            cmd.stdout(append_log(dir, service, "stdout")?);
            cmd.stderr(append_log(dir, service, "stderr")?);
        }
        None => {
            cmd.stdout(Stdio::null()).stderr(Stdio::null());
        }
    }

    debug!("Executing command: {cmd:?}");
    cmd.spawn()
}

fn append_log(dir: &Path, service: &str, stream: &str) -> io::Result<File> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(dir.join(format!("{service}.{stream}.log")))
}
