//! Per-service runtime state and the lifecycle state machine that governs it.
use std::{
    collections::HashMap,
    sync::{Mutex, MutexGuard},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use tracing::{debug, info};

use crate::{
    error::{FailureKind, LifecycleError},
    probe::HealthSample,
    process::ProcessHandle,
    registry::{Registry, ServiceId},
};

/// Lifecycle status of a supervised service.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Default,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum LifecycleStatus {
    #[default]
    Stopped,
    Starting,
    HealthChecking,
    Healthy,
    Unhealthy,
    Stopping,
    Failed,
}

impl LifecycleStatus {
    /// Whether the state machine allows moving from `self` to `next`.
    pub fn can_transition_to(self, next: LifecycleStatus) -> bool {
        use LifecycleStatus::*;

        matches!(
            (self, next),
            (Stopped | Failed, Starting)
                | (Starting, HealthChecking)
                | (HealthChecking, Healthy | Unhealthy)
                | (Healthy, Unhealthy)
                | (Unhealthy, Healthy | Stopped)
                | (Starting | HealthChecking | Healthy | Unhealthy, Stopping)
                | (Starting | HealthChecking | Healthy | Unhealthy, Failed)
                | (Stopping, Stopped)
                | (Failed, Stopped)
        )
    }

    /// Statuses in which a process is expected to exist.
    pub fn expects_process(self) -> bool {
        matches!(
            self,
            LifecycleStatus::Starting
                | LifecycleStatus::HealthChecking
                | LifecycleStatus::Healthy
                | LifecycleStatus::Unhealthy
                | LifecycleStatus::Stopping
        )
    }
}

/// The component currently allowed to drive a service's transitions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, AsRefStr, Display)]
#[strum(serialize_all = "snake_case")]
pub enum Owner {
    #[default]
    Coordinator,
    Monitor,
    Shutdown,
}

/// Mutable runtime state of one service.
#[derive(Debug, Default)]
pub struct ServiceRuntimeState {
    pub status: LifecycleStatus,
    pub owner: Owner,
    pub process: Option<ProcessHandle>,
    pub last_health: Option<HealthSample>,
    pub first_healthy_at: Option<DateTime<Utc>>,
    pub restart_count: u32,
    pub consecutive_failures: u32,
    pub consecutive_successes: u32,
    pub last_failure: Option<FailureKind>,
    ever_started: bool,
}

impl ServiceRuntimeState {
    /// Applies a transition, rejecting anything the state machine does not allow.
    pub fn transition(
        &mut self,
        service: &str,
        next: LifecycleStatus,
    ) -> Result<(), LifecycleError> {
        if !self.status.can_transition_to(next) {
            return Err(LifecycleError::InvalidTransition {
                service: service.to_string(),
                from: self.status,
                to: next,
            });
        }

        match next {
            LifecycleStatus::Starting => {
                if self.ever_started {
                    self.restart_count += 1;
                }
                self.ever_started = true;
                self.first_healthy_at = None;
                self.consecutive_failures = 0;
                self.consecutive_successes = 0;
                self.last_failure = None;
            }
            LifecycleStatus::Healthy if self.first_healthy_at.is_none() => {
                self.first_healthy_at = Some(Utc::now());
            }
            LifecycleStatus::Stopped => {
                self.process = None;
            }
            _ => {}
        }

        match next {
            LifecycleStatus::Healthy | LifecycleStatus::Stopped | LifecycleStatus::Failed => {
                info!("Service '{service}': {} -> {next}", self.status)
            }
            _ => debug!("Service '{service}': {} -> {next}", self.status),
        }
        self.status = next;
        Ok(())
    }

    /// Marks the state as `Failed` with `kind`.
    pub fn fail(&mut self, service: &str, kind: FailureKind) -> Result<(), LifecycleError> {
        self.transition(service, LifecycleStatus::Failed)?;
        self.last_failure = Some(kind);
        Ok(())
    }

    /// Extends the current streak of healthy or failing probes and resets the other.
    pub fn record_probe(&mut self, healthy: bool) {
        if healthy {
            self.consecutive_successes += 1;
            self.consecutive_failures = 0;
        } else {
            self.consecutive_failures += 1;
            self.consecutive_successes = 0;
        }
    }

    /// Records that a process started by an earlier invocation is being tracked again.
    pub fn restore(
        &mut self,
        process: ProcessHandle,
        status: LifecycleStatus,
        restart_count: u32,
    ) {
        self.first_healthy_at = matches!(status, LifecycleStatus::Healthy | LifecycleStatus::Unhealthy)
            .then(|| process.started_at());
        self.process = Some(process);
        self.status = status;
        self.restart_count = restart_count;
        self.ever_started = true;
    }

    pub fn pid(&self) -> Option<u32> {
        self.process.as_ref().map(ProcessHandle::pid)
    }
}

/// One mutex-guarded [`ServiceRuntimeState`] per registered service.
#[derive(Debug)]
pub struct RuntimeTable {
    states: HashMap<ServiceId, Mutex<ServiceRuntimeState>>,
}

impl RuntimeTable {
    /// Creates a `Stopped` state for every registered service.
    pub fn new(registry: &Registry) -> Self {
        let states = registry
            .ids()
            .map(|id| (id.clone(), Mutex::new(ServiceRuntimeState::default())))
            .collect();
        Self { states }
    }

    /// Locks the state of `id`.
    pub fn lock(&self, id: &str) -> Result<MutexGuard<'_, ServiceRuntimeState>, LifecycleError> {
        let state = self
            .states
            .get(id)
            .ok_or_else(|| LifecycleError::UnknownService(id.to_string()))?;
        Ok(state.lock()?)
    }

    /// Runs `f` with the state of `id` locked.
    pub fn with_state<R>(
        &self,
        id: &str,
        f: impl FnOnce(&mut ServiceRuntimeState) -> R,
    ) -> Result<R, LifecycleError> {
        let mut guard = self.lock(id)?;
        Ok(f(&mut guard))
    }

    /// Current status of `id`.
    pub fn status(&self, id: &str) -> Result<LifecycleStatus, LifecycleError> {
        self.with_state(id, |state| state.status)
    }

    /// Transfers ownership of every listed service to `owner`.
    pub fn hand_off<'a>(
        &self,
        ids: impl IntoIterator<Item = &'a ServiceId>,
        owner: Owner,
    ) -> Result<(), LifecycleError> {
        for id in ids {
            self.with_state(id, |state| state.owner = owner)?;
        }
        Ok(())
    }
}
