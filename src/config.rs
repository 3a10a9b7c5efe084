//! Configuration management for stagehand.
use regex::Regex;
use serde::{Deserialize, Serialize};
use std::{
    collections::BTreeMap,
    env, fs,
    path::{Path, PathBuf},
    sync::LazyLock,
    time::Duration,
};
use strum_macros::{AsRefStr, Display, EnumString};

use crate::error::LifecycleError;

/// Default configuration file looked up when none is given.
pub const DEFAULT_CONFIG_FILE: &str = "stagehand.yaml";

const DEFAULT_PROBE_TIMEOUT: Duration = Duration::from_secs(5);
const DEFAULT_PROBE_INTERVAL: Duration = Duration::from_secs(2);
const DEFAULT_PROBE_ATTEMPTS: u32 = 30;
const DEFAULT_SETTLE_DELAY: Duration = Duration::from_millis(500);
const DEFAULT_GRACE_PERIOD: Duration = Duration::from_secs(3);
const DEFAULT_MONITOR_INTERVAL: Duration = Duration::from_secs(5);
const DEFAULT_SAMPLE_CAPACITY: usize = 1000;
const DEFAULT_BUILD_TIMEOUT: Duration = Duration::from_secs(600);
const DEFAULT_FAILURE_THRESHOLD: u32 = 1;
const DEFAULT_SUCCESS_THRESHOLD: u32 = 1;

/// Represents the structure of the configuration file.
#[derive(Debug, Deserialize)]
pub struct Config {
    /// Configuration version.
    pub version: String,
    /// Timing and retry knobs shared by every service.
    #[serde(default)]
    pub settings: SettingsConfig,
    /// Services in declaration order.
    pub services: Vec<ServiceConfig>,
    /// Root directory from which relative paths are resolved.
    pub project_dir: Option<String>,
}

impl Config {
    /// Base directory used to resolve relative working directories.
    pub fn project_root(&self) -> PathBuf {
        self.project_dir
            .as_deref()
            .map(str::trim)
            .filter(|dir| !dir.is_empty())
            .map(PathBuf::from)
            .unwrap_or_else(|| PathBuf::from("."))
    }
}

/// Raw, string-typed settings as they appear in YAML.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct SettingsConfig {
    pub probe_timeout: Option<String>,
    pub probe_interval: Option<String>,
    pub probe_attempts: Option<u32>,
    pub settle_delay: Option<String>,
    pub grace_period: Option<String>,
    pub monitor_interval: Option<String>,
    pub sample_capacity: Option<usize>,
    pub build_timeout: Option<String>,
    pub failure_threshold: Option<u32>,
    pub success_threshold: Option<u32>,
}

/// Resolved timing and retry policy for a deployment.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LifecycleSettings {
    /// Upper bound for a single health probe.
    pub probe_timeout: Duration,
    /// Pause between health probe attempts during startup.
    pub probe_interval: Duration,
    /// Number of health probe attempts before a service is declared unhealthy.
    pub probe_attempts: u32,
    /// Delay between spawning a process and confirming it is still alive.
    pub settle_delay: Duration,
    /// Time a process gets to exit after SIGTERM before SIGKILL.
    pub grace_period: Duration,
    /// Tick interval of the continuous monitor.
    pub monitor_interval: Duration,
    /// Number of health samples retained per service.
    pub sample_capacity: usize,
    /// Upper bound for a build directive.
    pub build_timeout: Duration,
    /// Consecutive failing samples before the monitor flips a service to unhealthy.
    pub failure_threshold: u32,
    /// Consecutive healthy samples before the monitor flips an unhealthy service back.
    pub success_threshold: u32,
}

impl Default for LifecycleSettings {
    fn default() -> Self {
        Self {
            probe_timeout: DEFAULT_PROBE_TIMEOUT,
            probe_interval: DEFAULT_PROBE_INTERVAL,
            probe_attempts: DEFAULT_PROBE_ATTEMPTS,
            settle_delay: DEFAULT_SETTLE_DELAY,
            grace_period: DEFAULT_GRACE_PERIOD,
            monitor_interval: DEFAULT_MONITOR_INTERVAL,
            sample_capacity: DEFAULT_SAMPLE_CAPACITY,
            build_timeout: DEFAULT_BUILD_TIMEOUT,
            failure_threshold: DEFAULT_FAILURE_THRESHOLD,
            success_threshold: DEFAULT_SUCCESS_THRESHOLD,
        }
    }
}

impl LifecycleSettings {
    /// Resolves raw settings, falling back to defaults for anything unset.
    pub fn from_config(raw: &SettingsConfig) -> Result<Self, LifecycleError> {
        let defaults = Self::default();
        let duration_or = |value: &Option<String>, fallback: Duration| match value {
            Some(raw) => parse_duration(raw),
            None => Ok(fallback),
        };

        Ok(Self {
            probe_timeout: duration_or(&raw.probe_timeout, defaults.probe_timeout)?,
            probe_interval: duration_or(&raw.probe_interval, defaults.probe_interval)?,
            probe_attempts: raw.probe_attempts.unwrap_or(defaults.probe_attempts).max(1),
            settle_delay: duration_or(&raw.settle_delay, defaults.settle_delay)?,
            grace_period: duration_or(&raw.grace_period, defaults.grace_period)?,
            monitor_interval: duration_or(
                &raw.monitor_interval,
                defaults.monitor_interval,
            )?,
            sample_capacity: raw
                .sample_capacity
                .unwrap_or(defaults.sample_capacity)
                .max(1),
            build_timeout: duration_or(&raw.build_timeout, defaults.build_timeout)?,
            failure_threshold: raw
                .failure_threshold
                .unwrap_or(defaults.failure_threshold)
                .max(1),
            success_threshold: raw
                .success_threshold
                .unwrap_or(defaults.success_threshold)
                .max(1),
        })
    }
}

/// Transport used to reach a service's health endpoint.
#[derive(
    Debug,
    Serialize,
    Deserialize,
    Clone,
    Copy,
    Default,
    PartialEq,
    Eq,
    AsRefStr,
    Display,
    EnumString,
)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum Protocol {
    #[default]
    Http,
    Https,
}

/// Configuration for an individual service.
#[derive(Debug, Deserialize, Clone)]
pub struct ServiceConfig {
    /// Unique identifier referenced by `depends_on`.
    pub id: String,
    /// Display name (defaults to the id).
    pub name: Option<String>,
    /// Host serving the health endpoint.
    #[serde(default = "default_host")]
    pub host: String,
    /// Port serving the health endpoint.
    pub port: u16,
    /// Path of the health endpoint.
    #[serde(default = "default_health_path")]
    pub health_path: String,
    /// Transport for the health endpoint.
    #[serde(default)]
    pub protocol: Protocol,
    /// Services that must be healthy before this one starts.
    #[serde(default)]
    pub depends_on: Vec<String>,
    /// How to launch the service.
    pub start: DirectiveConfig,
    /// Optional build step run before launch.
    pub build: Option<DirectiveConfig>,
    /// Environment variables passed to build and start directives.
    #[serde(default)]
    pub env: BTreeMap<String, String>,
}

/// A shell command plus the directory it runs in.
#[derive(Debug, Deserialize, Clone)]
pub struct DirectiveConfig {
    /// Command handed to `sh -c`.
    pub command: String,
    /// Working directory, relative to the project root unless absolute.
    pub working_dir: Option<String>,
}

impl DirectiveConfig {
    /// Resolves the working directory against `base`.
    pub fn working_dir(&self, base: &Path) -> PathBuf {
        match self.working_dir.as_deref() {
            Some(dir) if Path::new(dir).is_absolute() => PathBuf::from(dir),
            Some(dir) => base.join(dir),
            None => base.to_path_buf(),
        }
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_health_path() -> String {
    "/health".to_string()
}

/// Parses a user-facing duration string in the format `<number>[ms|s|m|h]`.
pub fn parse_duration(raw: &str) -> Result<Duration, LifecycleError> {
    let value = raw.trim();
    if value.is_empty() {
        return Err(LifecycleError::InvalidDuration(raw.to_string()));
    }

    let invalid = || LifecycleError::InvalidDuration(raw.to_string());

    if let Some(stripped) = value.strip_suffix("ms") {
        let amount: u64 = stripped.trim().parse().map_err(|_| invalid())?;
        return Ok(Duration::from_millis(amount));
    }

    let (amount_str, multiplier) = if let Some(stripped) = value.strip_suffix('s') {
        (stripped.trim(), 1)
    } else if let Some(stripped) = value.strip_suffix('m') {
        (stripped.trim(), 60)
    } else if let Some(stripped) = value.strip_suffix('h') {
        (stripped.trim(), 3600)
    } else {
        (value, 1)
    };

    let amount: u64 = amount_str.parse().map_err(|_| invalid())?;
    Ok(Duration::from_secs(amount.saturating_mul(multiplier)))
}

/// Expands `$VAR` and `${VAR}` references from the process environment.
fn expand_env_vars(input: &str) -> Result<String, LifecycleError> {
    static ENV_VAR: LazyLock<Regex> = LazyLock::new(|| {
        Regex::new(r"\$\{?([A-Za-z_][A-Za-z0-9_]*)\}?").expect("env var pattern is valid")
    });

    let mut missing = None;
    let result = ENV_VAR.replace_all(input, |caps: &regex::Captures| {
        let var_name = &caps[1];
        match env::var(var_name) {
            Ok(value) => value,
            Err(_) => {
                missing.get_or_insert_with(|| var_name.to_string());
                String::new()
            }
        }
    });

    match missing {
        Some(var) => Err(LifecycleError::MissingEnvVar(var)),
        None => Ok(result.to_string()),
    }
}

/// Loads and parses the configuration file, expanding environment variables.
pub fn load_config(config_path: Option<&str>) -> Result<Config, LifecycleError> {
    let config_path = Path::new(config_path.unwrap_or(DEFAULT_CONFIG_FILE));

    let content = fs::read_to_string(config_path).map_err(|e| {
        LifecycleError::ConfigReadError(std::io::Error::new(
            e.kind(),
            format!("{} ({})", e, config_path.display()),
        ))
    })?;

    let expanded_content = expand_env_vars(&content)?;
    let mut config: Config = serde_yaml::from_str(&expanded_content)?;

    let base_path = config_path
        .parent()
        .filter(|parent| !parent.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."))
        .to_path_buf();

    config.project_dir = Some(match config.project_dir.take() {
        Some(dir) if Path::new(&dir).is_absolute() => dir,
        Some(dir) => base_path.join(dir).to_string_lossy().to_string(),
        None => base_path.to_string_lossy().to_string(),
    });

    Ok(config)
}
