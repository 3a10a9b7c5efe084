//! Stagehand brings up a fixed set of interdependent network services in dependency-safe
//! phases, confirms each one is serving traffic before its dependents start, keeps probing
//! their health while they run, and tears everything down in reverse order.

/// Cooperative cancellation.
pub mod cancel;

/// CLI interface.
pub mod cli;

/// Configuration management.
pub mod config;

/// Phased startup coordinator.
pub mod coordinator;

/// Error handling.
pub mod error;

/// Lifecycle state machine and runtime state table.
pub mod lifecycle;

/// Captured service output.
pub mod logs;

/// Health sample aggregation.
pub mod metrics;

/// Continuous health monitor.
pub mod monitor;

/// Health probes.
pub mod probe;

/// Service process handles.
pub mod process;

/// Service registry and dependency layering.
pub mod registry;

/// Runtime directories.
pub mod runtime;

/// Ordered teardown.
pub mod shutdown;

/// Persisted session state.
pub mod state;

/// Status reporting.
pub mod status;

/// Session facade used by the CLI.
pub mod supervisor;

#[doc(hidden)]
pub mod test_utils;
