//! One operator session: a registry, its runtime table and the components that drive it.
use std::{
    path::{Path, PathBuf},
    sync::{Arc, mpsc},
    thread,
};

use chrono::Utc;
use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancellationToken,
    config::{Config, LifecycleSettings},
    coordinator::{HealthyServiceSet, StartupCoordinator},
    error::LifecycleError,
    lifecycle::{LifecycleStatus, RuntimeTable},
    metrics::MetricsStore,
    monitor::{ContinuousMonitor, MonitorHandle, MonitorReport},
    probe::{HealthProber, HttpProber},
    process::ProcessHandle,
    registry::{Registry, ServiceId},
    runtime,
    shutdown::{ShutdownCoordinator, ShutdownReport},
    state::{ServiceStateEntry, StateFile},
    status::StatusReport,
};

/// Facade used by the CLI: start, monitor, stop, restart and report on a fixed set of services.
pub struct Supervisor {
    registry: Arc<Registry>,
    table: Arc<RuntimeTable>,
    prober: Arc<dyn HealthProber>,
    metrics: Arc<MetricsStore>,
    settings: LifecycleSettings,
    log_dir: PathBuf,
    state_path: PathBuf,
    cancel: CancellationToken,
}

impl Supervisor {
    /// Builds a session probing over HTTP.
    pub fn from_config(config: &Config) -> Result<Self, LifecycleError> {
        let prober: Arc<dyn HealthProber> = Arc::new(HttpProber::new()?);
        Self::with_prober(config, prober)
    }

    /// Builds a session with a custom prober.
    pub fn with_prober(
        config: &Config,
        prober: Arc<dyn HealthProber>,
    ) -> Result<Self, LifecycleError> {
        let settings = LifecycleSettings::from_config(&config.settings)?;
        let registry = Arc::new(Registry::load(config)?);
        let table = Arc::new(RuntimeTable::new(&registry));
        let metrics = Arc::new(MetricsStore::new(
            registry.ids().cloned(),
            settings.sample_capacity,
        ));

        Ok(Self {
            registry,
            table,
            prober,
            metrics,
            settings,
            log_dir: runtime::log_dir(),
            state_path: runtime::state_file(),
            cancel: CancellationToken::new(),
        })
    }

    /// Keeps the state file and service logs under `dir` instead of the runtime default.
    pub fn with_state_dir(mut self, dir: &Path) -> Self {
        self.log_dir = dir.join("logs");
        self.state_path = dir.join("state.json");
        self
    }

    pub fn registry(&self) -> &Registry {
        &self.registry
    }

    pub fn table(&self) -> &RuntimeTable {
        &self.table
    }

    pub fn metrics(&self) -> &MetricsStore {
        &self.metrics
    }

    pub fn settings(&self) -> &LifecycleSettings {
        &self.settings
    }

    pub fn log_dir(&self) -> &Path {
        &self.log_dir
    }

    /// Token that aborts startup and stops the monitor when cancelled.
    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    /// Runs the phased startup. The outcome is persisted either way.
    pub fn start(&self) -> Result<HealthyServiceSet, LifecycleError> {
        info!(
            "Starting {} service(s) in {} phase(s)",
            self.registry.len(),
            self.registry.phases().len()
        );

        let result = StartupCoordinator::new(
            &self.registry,
            &self.table,
            self.prober.as_ref(),
            &self.settings,
        )
        .with_log_dir(&self.log_dir)
        .with_cancellation(self.cancel.clone())
        .start_all();

        match (result, self.persist_state()) {
            (Ok(healthy), Ok(())) => {
                let ids: Vec<&str> = healthy.ids().map(String::as_str).collect();
                info!("All {} service(s) healthy: {}", healthy.len(), ids.join(", "));
                Ok(healthy)
            }
            (Ok(_), Err(err)) => Err(err),
            (Err(aborted), persisted) => {
                if let Err(err) = persisted {
                    error!("Failed to record aborted startup: {err}");
                }
                Err(aborted.into())
            }
        }
    }

    /// Starts the continuous monitor on its own thread.
    pub fn spawn_monitor(&self, reports: Option<mpsc::Sender<MonitorReport>>) -> MonitorHandle {
        let monitor = ContinuousMonitor::new(
            Arc::clone(&self.registry),
            Arc::clone(&self.table),
            Arc::clone(&self.prober),
            Arc::clone(&self.metrics),
            self.settings.clone(),
        );
        let monitor = match reports {
            Some(sender) => monitor.with_reports(sender),
            None => monitor,
        };
        monitor.spawn(self.cancel.clone())
    }

    /// Stops every tracked service, including ones started by an earlier invocation.
    pub fn stop(&self) -> Result<ShutdownReport, LifecycleError> {
        self.adopt_persisted()?;
        let report = ShutdownCoordinator::new(&self.table, self.settings.grace_period)
            .stop_all(self.registry.phases());
        self.persist_state()?;

        if report.is_clean() {
            info!("Stopped {} service(s)", report.stopped.len());
        } else {
            warn!(
                "Stopped with {} failure(s): {:?}",
                report.failures.len(),
                report.failures
            );
        }
        Ok(report)
    }

    pub fn restart(&self) -> Result<HealthyServiceSet, LifecycleError> {
        self.stop()?;
        self.start()
    }

    /// Re-probes every running service once and reports the result.
    pub fn status(&self) -> Result<StatusReport, LifecycleError> {
        self.adopt_persisted()?;

        let running: Vec<&ServiceId> = self
            .registry
            .ids()
            .filter(|id| {
                self.table
                    .with_state(id, |state| {
                        state.process.as_mut().is_some_and(ProcessHandle::is_alive)
                    })
                    .unwrap_or(false)
            })
            .collect();

        let timeout = self.settings.probe_timeout;
        let samples: Vec<_> = thread::scope(|scope| {
            let workers: Vec<_> = running
                .iter()
                .filter_map(|id| self.registry.get(id))
                .map(|spec| {
                    let prober = &self.prober;
                    (&spec.id, scope.spawn(move || prober.probe(spec, timeout)))
                })
                .collect();
            workers
                .into_iter()
                .filter_map(|(id, worker)| worker.join().ok().map(|sample| (id, sample)))
                .collect()
        });

        for (id, sample) in samples {
            self.metrics.record(id, sample.clone());
            self.table
                .with_state(id, |state| state.last_health = Some(sample))?;
        }

        StatusReport::collect(&self.registry, &self.table, Some(&self.metrics))
    }

    /// Ids whose persisted PID is still alive.
    pub fn running_services(&self) -> Result<Vec<ServiceId>, LifecycleError> {
        let state = StateFile::load_from(&self.state_path)?;
        Ok(state
            .running()
            .into_iter()
            .filter(|id| self.registry.get(id).is_some())
            .cloned()
            .collect())
    }

    /// Re-attaches to processes recorded by an earlier invocation. Returns how many were adopted.
    pub fn adopt_persisted(&self) -> Result<usize, LifecycleError> {
        let state = StateFile::load_from(&self.state_path)?;
        let mut adopted = 0;

        for (id, entry) in state.services() {
            if self.registry.get(id).is_none() {
                debug!("Ignoring persisted state for unknown service '{id}'");
                continue;
            }

            let restored = self.table.with_state(id, |runtime| {
                if runtime.process.is_some() {
                    return false;
                }
                match entry.pid.filter(|_| entry.is_running()) {
                    Some(pid) => {
                        let started_at = entry.started_at.unwrap_or_else(Utc::now);
                        let status = if entry.status.expects_process() {
                            entry.status
                        } else {
                            LifecycleStatus::Unhealthy
                        };
                        runtime.restore(
                            ProcessHandle::adopt(id, pid, started_at),
                            status,
                            entry.restart_count,
                        );
                        true
                    }
                    None => {
                        runtime.restart_count = entry.restart_count;
                        false
                    }
                }
            })?;

            if restored {
                debug!("Adopted running service '{id}'");
                adopted += 1;
            }
        }

        Ok(adopted)
    }

    /// Writes the current runtime table to the state file.
    pub fn persist_state(&self) -> Result<(), LifecycleError> {
        let mut state = StateFile::load_from(&self.state_path)?;
        for id in self.registry.ids() {
            let entry = self.table.with_state(id, |runtime| ServiceStateEntry {
                pid: runtime.pid(),
                started_at: runtime.process.as_ref().map(ProcessHandle::started_at),
                status: runtime.status,
                restart_count: runtime.restart_count,
            })?;
            state.set(id, entry);
        }
        state.save()?;
        Ok(())
    }
}
