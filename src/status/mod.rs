#![allow(missing_docs)]
//! Point-in-time status report for every registered service.
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::{
    error::{FailureKind, LifecycleError},
    lifecycle::{LifecycleStatus, RuntimeTable},
    metrics::{AggregateSnapshot, MetricsSnapshot, MetricsStore},
    probe::HealthOutcome,
    registry::{Registry, ServiceId},
};

const GREEN_BOLD: &str = "\x1b[1;32m";
const RED_BOLD: &str = "\x1b[1;31m";
const MAGENTA_BOLD: &str = "\x1b[1;35m";
const YELLOW_BOLD: &str = "\x1b[1;33m";
const RESET: &str = "\x1b[0m";

/// Version identifier for the machine-readable status payload.
pub const STATUS_SCHEMA_VERSION: &str = "status.v1";

/// Overall health of the supervised session.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum OverallHealth {
    Healthy,
    Degraded,
    Failing,
}

/// Health classification for a single service.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum UnitHealth {
    Healthy,
    Degraded,
    Failing,
    Inactive, // stopped on purpose; does not count against overall health
}

/// Captures how long a process has been running.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct UptimeInfo {
    pub seconds: u64,
    pub human: String,
    pub started_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ServiceStatus {
    pub id: ServiceId,
    pub name: String,
    pub endpoint: String,
    pub lifecycle: LifecycleStatus,
    pub health: UnitHealth,
    pub running: bool,
    pub healthy: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pid: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uptime: Option<UptimeInfo>,
    pub restart_count: u32,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_probe: Option<HealthOutcome>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_failure: Option<FailureKind>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metrics: Option<MetricsSnapshot>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StatusReport {
    pub schema_version: String,
    pub captured_at: DateTime<Utc>,
    pub overall_health: OverallHealth,
    pub services: Vec<ServiceStatus>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub aggregate: Option<AggregateSnapshot>,
}

impl StatusReport {
    /// Builds a report from the runtime table. Services appear in declaration order.
    pub fn collect(
        registry: &Registry,
        table: &RuntimeTable,
        metrics: Option<&MetricsStore>,
    ) -> Result<Self, LifecycleError> {
        let now = Utc::now();
        let mut services = Vec::with_capacity(registry.len());

        for spec in registry.services() {
            let mut state = table.lock(&spec.id)?;
            let running = state
                .process
                .as_mut()
                .is_some_and(|process| process.is_alive());
            let last_probe = state.last_health.as_ref().map(|sample| sample.outcome);
            let healthy = running && last_probe == Some(HealthOutcome::Healthy);
            let uptime = state
                .process
                .as_ref()
                .filter(|_| running)
                .map(|process| uptime_since(process.started_at(), now));

            services.push(ServiceStatus {
                id: spec.id.clone(),
                name: spec.name.clone(),
                endpoint: spec.endpoint(),
                lifecycle: state.status,
                health: unit_health(state.status, running, healthy),
                running,
                healthy,
                pid: state.pid().filter(|_| running),
                uptime,
                restart_count: state.restart_count,
                last_probe,
                last_failure: state.last_failure,
                metrics: metrics
                    .map(|store| store.snapshot(&spec.id))
                    .filter(|snapshot| snapshot.request_count > 0),
            });
        }

        Ok(Self {
            schema_version: STATUS_SCHEMA_VERSION.to_string(),
            captured_at: now,
            overall_health: compute_overall_health(&services),
            services,
            aggregate: metrics
                .map(MetricsStore::global_snapshot)
                .filter(|aggregate| aggregate.total_requests > 0),
        })
    }

    pub fn to_json(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string_pretty(self)
    }

    /// Plain-text table, optionally with ANSI colours.
    pub fn render_table(&self, color: bool) -> String {
        let id_width = self
            .services
            .iter()
            .map(|service| service.id.len())
            .chain([7])
            .max()
            .unwrap_or(7);
        let endpoint_width = self
            .services
            .iter()
            .map(|service| service.endpoint.len())
            .chain([8])
            .max()
            .unwrap_or(8);

        let mut out = String::new();
        out.push_str(&format!(
            "{:<id_width$}  {:<endpoint_width$}  {:<15}  {:>7}  {:>10}  {:>8}  {:>9}  {:>9}  {:>6}\n",
            "SERVICE", "ENDPOINT", "STATE", "PID", "UPTIME", "RESTARTS", "P50", "P99", "ERR%"
        ));

        for service in &self.services {
            let state = format!("{:<15}", service.lifecycle.as_ref());
            let state = if color {
                format!("{}{state}{RESET}", health_color(service.health))
            } else {
                state
            };
            let pid = service
                .pid
                .map(|pid| pid.to_string())
                .unwrap_or_else(|| "-".into());
            let uptime = service
                .uptime
                .as_ref()
                .map(|uptime| uptime.human.clone())
                .unwrap_or_else(|| "-".into());
            let (p50, p99, errors) = match &service.metrics {
                Some(metrics) => (
                    format!("{:.1}ms", metrics.p50_latency_ms),
                    format!("{:.1}ms", metrics.p99_latency_ms),
                    format!("{:.1}", metrics.error_rate * 100.0),
                ),
                None => ("-".into(), "-".into(), "-".into()),
            };

            out.push_str(&format!(
                "{:<id_width$}  {:<endpoint_width$}  {state}  {pid:>7}  {uptime:>10}  {:>8}  {p50:>9}  {p99:>9}  {errors:>6}\n",
                service.id, service.endpoint, service.restart_count
            ));
            if let Some(kind) = service.last_failure {
                out.push_str(&format!("{:<id_width$}  last failure: {kind}\n", ""));
            }
        }

        let overall = match self.overall_health {
            OverallHealth::Healthy => "healthy",
            OverallHealth::Degraded => "degraded",
            OverallHealth::Failing => "failing",
        };
        if color {
            let paint = match self.overall_health {
                OverallHealth::Healthy => GREEN_BOLD,
                OverallHealth::Degraded => YELLOW_BOLD,
                OverallHealth::Failing => RED_BOLD,
            };
            out.push_str(&format!("\nOverall: {paint}{overall}{RESET}\n"));
        } else {
            out.push_str(&format!("\nOverall: {overall}\n"));
        }
        out
    }
}

fn unit_health(status: LifecycleStatus, running: bool, healthy: bool) -> UnitHealth {
    match status {
        LifecycleStatus::Failed | LifecycleStatus::Unhealthy => UnitHealth::Failing,
        LifecycleStatus::Stopped if !running => UnitHealth::Inactive,
        LifecycleStatus::Healthy if healthy => UnitHealth::Healthy,
        _ => UnitHealth::Degraded,
    }
}

fn health_color(health: UnitHealth) -> &'static str {
    match health {
        UnitHealth::Healthy => GREEN_BOLD,
        UnitHealth::Degraded => YELLOW_BOLD,
        UnitHealth::Failing => RED_BOLD,
        UnitHealth::Inactive => MAGENTA_BOLD,
    }
}

pub fn compute_overall_health(services: &[ServiceStatus]) -> OverallHealth {
    if services
        .iter()
        .any(|service| matches!(service.health, UnitHealth::Failing))
    {
        return OverallHealth::Failing;
    }

    if services
        .iter()
        .any(|service| matches!(service.health, UnitHealth::Degraded))
    {
        return OverallHealth::Degraded;
    }

    OverallHealth::Healthy
}

fn uptime_since(started_at: DateTime<Utc>, now: DateTime<Utc>) -> UptimeInfo {
    let seconds = now
        .signed_duration_since(started_at)
        .to_std()
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or(0);
    UptimeInfo {
        seconds,
        human: format_uptime(seconds),
        started_at,
    }
}

/// Compact uptime such as `42s`, `5m 3s`, `2h 10m` or `3d 4h`.
pub fn format_uptime(total_seconds: u64) -> String {
    let days = total_seconds / 86_400;
    let hours = (total_seconds % 86_400) / 3_600;
    let minutes = (total_seconds % 3_600) / 60;
    let seconds = total_seconds % 60;

    match total_seconds {
        0..=59 => format!("{seconds}s"),
        60..=3_599 => format!("{minutes}m {seconds}s"),
        3_600..=86_399 => format!("{hours}h {minutes}m"),
        _ => format!("{days}d {hours}h"),
    }
}
