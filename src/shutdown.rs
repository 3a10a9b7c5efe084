//! Ordered teardown: reverse dependency layers, concurrent within a layer.
use std::{thread, time::Duration};

use tracing::{debug, error, info, warn};

use crate::{
    error::{LifecycleError, ShutdownTimeout},
    lifecycle::{LifecycleStatus, Owner, RuntimeTable, ServiceRuntimeState},
    process::StopOutcome,
    registry::ServiceId,
};

/// What happened while tearing services down. Never fatal.
#[derive(Debug, Default)]
pub struct ShutdownReport {
    /// Services handled, in teardown order.
    pub stopped: Vec<ServiceId>,
    /// Services that ignored SIGTERM and were killed.
    pub escalated: Vec<ShutdownTimeout>,
    /// Services whose stop raised an error, with the error message.
    pub failures: Vec<(ServiceId, String)>,
}

impl ShutdownReport {
    pub fn is_clean(&self) -> bool {
        self.failures.is_empty()
    }

    fn absorb(&mut self, id: &str, result: Result<StopOutcome, LifecycleError>, grace: Duration) {
        self.stopped.push(id.to_string());
        match result {
            Ok(StopOutcome::Escalated) => self.escalated.push(ShutdownTimeout {
                service: id.to_string(),
                grace,
            }),
            Ok(_) => {}
            Err(err) => {
                error!("Failed to stop '{id}': {err}");
                self.failures.push((id.to_string(), err.to_string()));
            }
        }
    }
}

/// Stops services and resets their runtime state to `Stopped`.
pub struct ShutdownCoordinator<'a> {
    table: &'a RuntimeTable,
    grace: Duration,
}

impl<'a> ShutdownCoordinator<'a> {
    pub fn new(table: &'a RuntimeTable, grace: Duration) -> Self {
        Self { table, grace }
    }

    /// Stops one service. A service without a live process is a successful no-op.
    pub fn stop_service(&self, id: &str) -> Result<StopOutcome, LifecycleError> {
        let process = {
            let mut state = self.table.lock(id)?;
            state.owner = Owner::Shutdown;
            let process = state.process.take();
            if process.is_some() && state.status.can_transition_to(LifecycleStatus::Stopping) {
                state.transition(id, LifecycleStatus::Stopping)?;
            }
            process
        };

        let outcome = match process {
            Some(mut process) => match process.stop_gracefully(self.grace) {
                Ok(outcome) => outcome,
                Err(err) => {
                    self.table.with_state(id, |state| state.process = Some(process))?;
                    return Err(err);
                }
            },
            None => {
                debug!("Service '{id}' has no running process");
                StopOutcome::AlreadyExited
            }
        };

        self.table.with_state(id, |state| reset_to_stopped(id, state))??;
        if outcome != StopOutcome::AlreadyExited {
            info!("Service '{id}' stopped");
        }
        Ok(outcome)
    }

    /// Tears down `phases` from the last layer to the first. Within a layer every service
    /// stops concurrently and escalates on its own.
    pub fn stop_all(&self, phases: &[Vec<ServiceId>]) -> ShutdownReport {
        let mut report = ShutdownReport::default();

        for (index, layer) in phases.iter().enumerate().rev() {
            if layer.is_empty() {
                continue;
            }
            debug!("Stopping phase {index}: {layer:?}");

            let results: Vec<_> = thread::scope(|scope| {
                let workers: Vec<_> = layer
                    .iter()
                    .map(|id| (id, scope.spawn(move || self.stop_service(id))))
                    .collect();

                workers
                    .into_iter()
                    .map(|(id, worker)| {
                        let result = worker.join().unwrap_or_else(|_| {
                            Err(LifecycleError::MutexPoisonError(format!(
                                "stop worker for '{id}' panicked"
                            )))
                        });
                        (id, result)
                    })
                    .collect()
            });

            for (id, result) in results {
                report.absorb(id, result, self.grace);
            }
        }

        for timeout in &report.escalated {
            warn!("{timeout}");
        }
        report
    }
}

/// Walks whatever status the service is in to `Stopped`.
fn reset_to_stopped(id: &str, state: &mut ServiceRuntimeState) -> Result<(), LifecycleError> {
    if state.status.can_transition_to(LifecycleStatus::Stopping) {
        state.transition(id, LifecycleStatus::Stopping)?;
    }
    if state.status != LifecycleStatus::Stopped {
        state.transition(id, LifecycleStatus::Stopped)?;
    }
    state.process = None;
    Ok(())
}
