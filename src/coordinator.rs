//! Phased startup: each dependency layer must be fully healthy before the next one starts.
use std::{path::Path, sync::mpsc, thread};

use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancellationToken,
    config::LifecycleSettings,
    error::{FailureKind, LifecycleError, ServiceFailure, StartupAborted},
    lifecycle::{LifecycleStatus, Owner, RuntimeTable, ServiceRuntimeState},
    probe::{HealthOutcome, HealthProber, HealthSample},
    process::{self, ProcessHandle},
    registry::{Registry, ServiceId, ServiceSpec},
    shutdown::ShutdownCoordinator,
};

/// Every service came up healthy; ownership now belongs to the monitor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HealthyServiceSet {
    pub phases: Vec<Vec<ServiceId>>,
}

impl HealthyServiceSet {
    pub fn ids(&self) -> impl Iterator<Item = &ServiceId> {
        self.phases.iter().flatten()
    }

    pub fn len(&self) -> usize {
        self.phases.iter().map(Vec::len).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }
}

/// Brings services up phase by phase and rolls everything back on the first failure.
pub struct StartupCoordinator<'a> {
    registry: &'a Registry,
    table: &'a RuntimeTable,
    prober: &'a dyn HealthProber,
    settings: &'a LifecycleSettings,
    log_dir: Option<&'a Path>,
    cancel: CancellationToken,
}

impl<'a> StartupCoordinator<'a> {
    pub fn new(
        registry: &'a Registry,
        table: &'a RuntimeTable,
        prober: &'a dyn HealthProber,
        settings: &'a LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            table,
            prober,
            settings,
            log_dir: None,
            cancel: CancellationToken::new(),
        }
    }

    /// Appends service output to `<dir>/<id>.stdout.log` and `<dir>/<id>.stderr.log`.
    pub fn with_log_dir(mut self, dir: &'a Path) -> Self {
        self.log_dir = Some(dir);
        self
    }

    /// Aborts startup (with rollback) once `token` is cancelled.
    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn start_all(&self) -> Result<HealthyServiceSet, StartupAborted> {
        let ids: Vec<ServiceId> = self.registry.ids().cloned().collect();
        if let Err(err) = self.table.hand_off(&ids, Owner::Coordinator) {
            let service = ids.first().cloned().unwrap_or_default();
            return Err(StartupAborted::from_failure(
                ServiceFailure::new(&service, FailureKind::StartFailure, err.to_string()),
                Vec::new(),
            ));
        }

        let phases = self.registry.phases();
        for (index, phase) in phases.iter().enumerate() {
            info!("Starting phase {index}: {}", phase.join(", "));
            if let Some(failure) = self.run_phase(phase) {
                return Err(self.roll_back(failure, &phases[..=index]));
            }
            info!("Phase {index} healthy");
        }

        if let Err(err) = self.table.hand_off(&ids, Owner::Monitor) {
            warn!("Failed to hand services to the monitor: {err}");
        }
        Ok(HealthyServiceSet {
            phases: phases.to_vec(),
        })
    }

    /// Runs one worker per service and returns the first failure, after every worker
    /// has been joined.
    fn run_phase(&self, phase: &[ServiceId]) -> Option<ServiceFailure> {
        let token = self.cancel.child();
        let (tx, rx) = mpsc::channel();

        thread::scope(|scope| {
            for id in phase {
                let tx = tx.clone();
                let token = &token;
                scope.spawn(move || {
                    let result = self.bring_up(id, token);
                    let _ = tx.send((id, result));
                });
            }
            drop(tx);

            let mut first_failure = None;
            for (id, result) in rx {
                match result {
                    Ok(()) => debug!("Service '{id}' passed startup"),
                    Err(failure) if first_failure.is_none() => {
                        error!("{failure}");
                        token.cancel();
                        first_failure = Some(failure);
                    }
                    Err(failure) => debug!("Sibling failure after abort: {failure}"),
                }
            }
            first_failure
        })
    }

    fn bring_up(&self, id: &str, token: &CancellationToken) -> Result<(), ServiceFailure> {
        let spec = self.registry.get(id).ok_or_else(|| {
            ServiceFailure::new(id, FailureKind::StartFailure, "service is not registered")
        })?;

        if let Some(build) = &spec.build {
            process::run_directive(id, build, self.settings.build_timeout, token, self.log_dir)
                .inspect_err(|failure| self.note_failure(id, failure.kind))?;
        }
        if token.is_cancelled() {
            return Err(cancelled(id));
        }

        self.update(id, |state| state.transition(id, LifecycleStatus::Starting))?;
        let handle = match ProcessHandle::start(id, &spec.start, self.log_dir) {
            Ok(handle) => handle,
            Err(failure) => {
                self.update(id, |state| state.fail(id, FailureKind::StartFailure))?;
                return Err(failure);
            }
        };
        self.update(id, |state| {
            state.process = Some(handle);
            Ok(())
        })?;

        if !token.sleep(self.settings.settle_delay) {
            return Err(cancelled(id));
        }
        self.ensure_running(id)?;

        self.update(id, |state| state.transition(id, LifecycleStatus::HealthChecking))?;
        self.await_healthy(spec, token)
    }

    /// Bounded probe loop. The process is re-checked after every failed attempt.
    fn await_healthy(
        &self,
        spec: &ServiceSpec,
        token: &CancellationToken,
    ) -> Result<(), ServiceFailure> {
        let id = spec.id.as_str();
        let attempts = self.settings.probe_attempts;
        let mut last: Option<HealthSample> = None;

        for attempt in 1..=attempts {
            if token.is_cancelled() {
                return Err(cancelled(id));
            }

            let sample = self.prober.probe(spec, self.settings.probe_timeout);
            debug!(
                "Health check {attempt}/{attempts} for '{id}': {} ({:.1}ms)",
                sample.outcome, sample.latency_ms
            );
            let healthy = sample.is_healthy();
            self.update(id, |state| {
                state.last_health = Some(sample.clone());
                state.record_probe(healthy);
                if healthy {
                    state.transition(id, LifecycleStatus::Healthy)
                } else {
                    Ok(())
                }
            })?;
            if healthy {
                info!("Service '{id}' is healthy after {attempt} attempt(s)");
                return Ok(());
            }

            self.ensure_running(id)?;
            last = Some(sample);
            if attempt < attempts && !token.sleep(self.settings.probe_interval) {
                return Err(cancelled(id));
            }
        }

        let (kind, detail) = exhausted(attempts, last.as_ref());
        self.update(id, |state| {
            state.transition(id, LifecycleStatus::Unhealthy)?;
            state.last_failure = Some(kind);
            Ok(())
        })?;
        Err(ServiceFailure::new(id, kind, detail))
    }

    fn ensure_running(&self, id: &str) -> Result<(), ServiceFailure> {
        let exited = self.update(id, |state| {
            let alive = state.process.as_mut().is_some_and(ProcessHandle::is_alive);
            if !alive {
                state.fail(id, FailureKind::StartFailure)?;
            }
            Ok(!alive)
        })?;

        if exited {
            return Err(ServiceFailure::new(
                id,
                FailureKind::StartFailure,
                "process exited during startup",
            ));
        }
        Ok(())
    }

    fn update<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ServiceRuntimeState) -> Result<R, LifecycleError>,
    ) -> Result<R, ServiceFailure> {
        self.table
            .with_state(id, f)
            .and_then(|result| result)
            .map_err(|err| ServiceFailure::new(id, FailureKind::StartFailure, err.to_string()))
    }

    fn note_failure(&self, id: &str, kind: FailureKind) {
        if let Err(err) = self.table.with_state(id, |state| state.last_failure = Some(kind)) {
            warn!("Failed to record failure for '{id}': {err}");
        }
    }

    /// Stops every service of `phases` that got past `Stopped`, newest phase first.
    fn roll_back(&self, failure: ServiceFailure, phases: &[Vec<ServiceId>]) -> StartupAborted {
        let touched: Vec<Vec<ServiceId>> = phases
            .iter()
            .map(|phase| {
                phase
                    .iter()
                    .filter(|id| {
                        self.table
                            .status(id)
                            .is_ok_and(|status| status != LifecycleStatus::Stopped)
                    })
                    .cloned()
                    .collect()
            })
            .collect();

        let count: usize = touched.iter().map(Vec::len).sum();
        warn!(
            "Startup aborted by '{}' ({}); rolling back {count} service(s)",
            failure.service, failure.kind
        );

        let report = ShutdownCoordinator::new(self.table, self.settings.grace_period)
            .stop_all(&touched);
        for (service, err) in &report.failures {
            error!("Rollback of '{service}' failed: {err}");
        }
        StartupAborted::from_failure(failure, report.stopped)
    }
}

fn cancelled(id: &str) -> ServiceFailure {
    ServiceFailure::new(id, FailureKind::Cancelled, "startup cancelled")
}

/// Classifies a service that never reported healthy from its last sample.
fn exhausted(attempts: u32, last: Option<&HealthSample>) -> (FailureKind, String) {
    match last {
        Some(sample) if sample.outcome == HealthOutcome::Unhealthy => {
            let status = sample
                .status_code
                .map(|code| format!("HTTP {code}"))
                .unwrap_or_else(|| "unhealthy body".to_string());
            (
                FailureKind::HealthCheckUnhealthy,
                format!("not healthy after {attempts} attempt(s), last response {status}"),
            )
        }
        Some(sample) => (
            FailureKind::HealthCheckTimeout,
            format!(
                "no response after {attempts} attempt(s), last outcome {}",
                sample.outcome
            ),
        ),
        None => (
            FailureKind::HealthCheckTimeout,
            format!("no probe completed in {attempts} attempt(s)"),
        ),
    }
}
