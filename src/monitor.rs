//! Steady-state health monitoring after a successful startup.
use std::{
    collections::BTreeMap,
    sync::{Arc, mpsc},
    thread,
};

use chrono::{DateTime, Utc};
use serde::Serialize;
use tracing::{debug, error, info, warn};

use crate::{
    cancel::CancellationToken,
    config::LifecycleSettings,
    error::LifecycleError,
    lifecycle::{LifecycleStatus, Owner, RuntimeTable, ServiceRuntimeState},
    metrics::{AggregateSnapshot, MetricsSnapshot, MetricsStore},
    probe::{HealthProber, HealthSample},
    registry::{Registry, ServiceId},
};

/// Metrics published after every monitor tick.
#[derive(Debug, Clone, Serialize)]
pub struct MonitorReport {
    pub at: DateTime<Utc>,
    pub snapshots: BTreeMap<ServiceId, MetricsSnapshot>,
    pub aggregate: AggregateSnapshot,
}

/// Periodically probes every service, feeds the metrics store and flips services between
/// `Healthy` and `Unhealthy`.
pub struct ContinuousMonitor {
    registry: Arc<Registry>,
    table: Arc<RuntimeTable>,
    prober: Arc<dyn HealthProber>,
    metrics: Arc<MetricsStore>,
    settings: LifecycleSettings,
    reports: Option<mpsc::Sender<MonitorReport>>,
}

impl ContinuousMonitor {
    pub fn new(
        registry: Arc<Registry>,
        table: Arc<RuntimeTable>,
        prober: Arc<dyn HealthProber>,
        metrics: Arc<MetricsStore>,
        settings: LifecycleSettings,
    ) -> Self {
        Self {
            registry,
            table,
            prober,
            metrics,
            settings,
            reports: None,
        }
    }

    /// Sends a [`MonitorReport`] to `sender` after each tick.
    pub fn with_reports(mut self, sender: mpsc::Sender<MonitorReport>) -> Self {
        self.reports = Some(sender);
        self
    }

    /// Runs ticks on a dedicated thread until `cancel` fires or the handle is stopped.
    pub fn spawn(self, cancel: CancellationToken) -> MonitorHandle {
        let token = cancel.child();
        let worker_token = token.clone();

        let handle = thread::spawn(move || {
            debug!(
                "Monitor started with interval {:?}",
                self.settings.monitor_interval
            );
            while !worker_token.is_cancelled() {
                let report = self.tick();
                if let Some(sender) = &self.reports
                    && sender.send(report).is_err()
                {
                    debug!("Monitor report receiver dropped");
                }
                if !worker_token.sleep(self.settings.monitor_interval) {
                    break;
                }
            }
            debug!("Monitor stopped");
        });

        MonitorHandle {
            token,
            handle: Some(handle),
        }
    }

    /// One pass: probe every service concurrently, record, update statuses, summarise.
    pub fn tick(&self) -> MonitorReport {
        let timeout = self.settings.probe_timeout;
        let samples: Vec<(&ServiceId, HealthSample)> = thread::scope(|scope| {
            let workers: Vec<_> = self
                .registry
                .services()
                .iter()
                .map(|spec| {
                    let prober = &self.prober;
                    (&spec.id, scope.spawn(move || prober.probe(spec, timeout)))
                })
                .collect();

            workers
                .into_iter()
                .filter_map(|(id, worker)| match worker.join() {
                    Ok(sample) => Some((id, sample)),
                    Err(_) => {
                        error!("Health probe worker for '{id}' panicked");
                        None
                    }
                })
                .collect()
        });

        for (id, sample) in samples {
            self.metrics.record(id, sample.clone());
            let applied = self
                .table
                .with_state(id, |state| self.apply(id, state, sample))
                .and_then(|result| result);
            if let Err(err) = applied {
                warn!("Monitor could not update '{id}': {err}");
            }
        }

        let snapshots: BTreeMap<_, _> = self.metrics.snapshots().into_iter().collect();
        let aggregate = self.metrics.global_snapshot();
        info!(
            "Monitor tick: {} requests, {:.1}% errors, avg latency {:.1}ms across {} service(s)",
            aggregate.total_requests,
            aggregate.error_rate * 100.0,
            aggregate.avg_latency_ms,
            aggregate.services_with_samples
        );

        MonitorReport {
            at: Utc::now(),
            snapshots,
            aggregate,
        }
    }

    fn apply(
        &self,
        id: &str,
        state: &mut ServiceRuntimeState,
        sample: HealthSample,
    ) -> Result<(), LifecycleError> {
        if state.owner != Owner::Monitor
            || matches!(
                state.status,
                LifecycleStatus::Starting | LifecycleStatus::Stopping
            )
        {
            return Ok(());
        }

        let healthy = sample.is_healthy();
        let outcome = sample.outcome;
        state.last_health = Some(sample);

        if matches!(
            state.status,
            LifecycleStatus::Healthy | LifecycleStatus::Unhealthy
        ) && let Some(process) = state.process.as_mut()
            && !process.is_alive()
        {
            error!("Service '{id}' (PID {}) exited unexpectedly", process.pid());
            return state.transition(id, LifecycleStatus::Failed);
        }

        state.record_probe(healthy);

        match state.status {
            LifecycleStatus::Healthy
                if state.consecutive_failures >= self.settings.failure_threshold =>
            {
                warn!(
                    "Service '{id}' became unhealthy ({outcome}, {} consecutive failure(s))",
                    state.consecutive_failures
                );
                state.transition(id, LifecycleStatus::Unhealthy)
            }
            LifecycleStatus::Unhealthy
                if state.consecutive_successes >= self.settings.success_threshold =>
            {
                info!(
                    "Service '{id}' recovered after {} healthy sample(s)",
                    state.consecutive_successes
                );
                state.transition(id, LifecycleStatus::Healthy)
            }
            _ => Ok(()),
        }
    }
}

/// Running monitor thread. Dropping the handle stops it.
pub struct MonitorHandle {
    token: CancellationToken,
    handle: Option<thread::JoinHandle<()>>,
}

impl MonitorHandle {
    pub fn stop(mut self) {
        self.shutdown();
    }

    pub fn is_finished(&self) -> bool {
        self.handle
            .as_ref()
            .is_none_or(thread::JoinHandle::is_finished)
    }

    /// Blocks until the monitor thread exits on its own (its token was cancelled).
    pub fn join(mut self) {
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }

    fn shutdown(&mut self) {
        self.token.cancel();
        if let Some(handle) = self.handle.take() {
            let _ = handle.join();
        }
    }
}

impl Drop for MonitorHandle {
    fn drop(&mut self) {
        self.shutdown();
    }
}
