//! Error handling for stagehand.
use std::time::Duration;

use serde::{Deserialize, Serialize};
use strum_macros::{AsRefStr, Display, EnumString};
use thiserror::Error;

use crate::lifecycle::LifecycleStatus;

/// Defines all crate-level errors that can occur while managing a service session.
#[derive(Debug, Error)]
pub enum LifecycleError {
    /// Error reading or accessing a configuration file.
    #[error("Failed to read config file: {0}")]
    ConfigReadError(#[from] std::io::Error),

    /// Error parsing YAML configuration.
    #[error("Invalid YAML format: {0}")]
    ConfigParseError(#[from] serde_yaml::Error),

    /// A duration string in the configuration could not be parsed.
    #[error("Invalid duration value: '{0}'")]
    InvalidDuration(String),

    /// The configuration references an environment variable that is not set.
    #[error("Missing environment variable: {0}")]
    MissingEnvVar(String),

    /// The declared services do not form a valid registry.
    #[error(transparent)]
    InvalidRegistry(#[from] InvalidRegistry),

    /// A phased startup was aborted and rolled back.
    #[error(transparent)]
    StartupAborted(#[from] StartupAborted),

    /// A service id was not found in the registry.
    #[error("Unknown service '{0}'")]
    UnknownService(String),

    /// A lifecycle transition violated the state machine.
    #[error("Service '{service}' cannot move from {from} to {to}")]
    InvalidTransition {
        /// The service whose state was being changed.
        service: String,
        /// The current status.
        from: LifecycleStatus,
        /// The rejected target status.
        to: LifecycleStatus,
    },

    /// Error signalling or reaping a service process.
    #[error("Failed to stop service '{service}': {source}")]
    ServiceStopError {
        /// The service name that failed to stop.
        service: String,
        /// The underlying error that occurred.
        #[source]
        source: std::io::Error,
    },

    /// The HTTP client used for health probes could not be constructed.
    #[error("Failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),

    /// Error for poisoned mutex.
    #[error("Mutex is poisoned: {0}")]
    MutexPoisonError(String),

    /// Error for the persisted session state file.
    #[error("Service state error: {0}")]
    StateFileError(#[from] StateFileError),
}

impl<T> From<std::sync::PoisonError<T>> for LifecycleError {
    fn from(err: std::sync::PoisonError<T>) -> Self {
        LifecycleError::MutexPoisonError(err.to_string())
    }
}

/// Reasons a set of service declarations is rejected at load time.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum InvalidRegistry {
    /// A service was declared without an id.
    #[error("Service at position {index} has an empty id")]
    EmptyId {
        /// Zero-based declaration index.
        index: usize,
    },

    /// Two services share the same id.
    #[error("Duplicate service id '{service}'")]
    DuplicateService {
        /// The repeated id.
        service: String,
    },

    /// A dependency reference is undefined in the configuration.
    #[error("Service '{service}' declares unknown dependency '{dependency}'")]
    UnknownDependency {
        /// The service with an invalid dependency reference.
        service: String,
        /// The missing dependency id.
        dependency: String,
    },

    /// The dependency graph contains a cycle.
    #[error("Detected dependency cycle: {cycle}")]
    DependencyCycle {
        /// Human-readable cycle description (e.g. `a -> b -> a`).
        cycle: String,
    },
}

/// Classifies why a single service failed to come up.
#[derive(
    Debug,
    Clone,
    Copy,
    PartialEq,
    Eq,
    Hash,
    Serialize,
    Deserialize,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "snake_case")]
#[strum(serialize_all = "snake_case")]
pub enum FailureKind {
    /// The build directive exited unsuccessfully or timed out.
    BuildFailure,
    /// The process could not be spawned or exited during startup.
    StartFailure,
    /// The health endpoint never answered within the retry window.
    HealthCheckTimeout,
    /// The health endpoint answered but never reported healthy.
    HealthCheckUnhealthy,
    /// Startup was interrupted before the service finished.
    Cancelled,
}

/// A per-service startup failure with its classification.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service '{service}' failed ({kind}): {detail}")]
pub struct ServiceFailure {
    /// The service that failed.
    pub service: String,
    /// Failure classification.
    pub kind: FailureKind,
    /// Human-readable context.
    pub detail: String,
}

impl ServiceFailure {
    /// Builds a failure for `service`.
    pub fn new(service: &str, kind: FailureKind, detail: impl Into<String>) -> Self {
        Self {
            service: service.to_string(),
            kind,
            detail: detail.into(),
        }
    }
}

/// Returned by the startup coordinator when a phase could not fully come up.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("startup aborted: service '{service}' failed ({kind}): {detail}")]
pub struct StartupAborted {
    /// The first service whose failure aborted the phase.
    pub service: String,
    /// The failure classification recorded for that service.
    pub kind: FailureKind,
    /// Human-readable context.
    pub detail: String,
    /// Services stopped during rollback, in the order they were torn down.
    pub rolled_back: Vec<String>,
}

impl StartupAborted {
    /// Wraps the failure that aborted the phase.
    pub fn from_failure(failure: ServiceFailure, rolled_back: Vec<String>) -> Self {
        Self {
            service: failure.service,
            kind: failure.kind,
            detail: failure.detail,
            rolled_back,
        }
    }
}

/// A process ignored the termination signal and had to be killed.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("service '{service}' did not exit within {grace:?}; sent SIGKILL")]
pub struct ShutdownTimeout {
    /// The service that was escalated.
    pub service: String,
    /// The grace period that elapsed.
    pub grace: Duration,
}

/// Error type for persistent session state file operations.
#[derive(Debug, Error)]
pub enum StateFileError {
    /// Error reading or writing the state file.
    #[error("Failed to access service state file: {0}")]
    Io(#[from] std::io::Error),

    /// Error parsing JSON contents of the state file.
    #[error("Failed to parse service state file: {0}")]
    Parse(#[from] serde_json::Error),
}
