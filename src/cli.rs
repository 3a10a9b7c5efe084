//! Command-line interface for stagehand.
use std::{fmt, str::FromStr};

use clap::{Parser, Subcommand};
use tracing::level_filters::LevelFilter;

use crate::config::DEFAULT_CONFIG_FILE;

/// Wrapper around `LevelFilter` so clap can parse log levels from either
/// string names ("info", "debug", etc.) or numeric shorthands (0-5).
#[derive(Clone, Copy, Debug)]
pub struct LogLevelArg(LevelFilter);

impl LogLevelArg {
    /// String representation suitable for `RUST_LOG`.
    pub fn as_str(&self) -> &'static str {
        match self.0 {
            LevelFilter::OFF => "off",
            LevelFilter::ERROR => "error",
            LevelFilter::WARN => "warn",
            LevelFilter::INFO => "info",
            LevelFilter::DEBUG => "debug",
            LevelFilter::TRACE => "trace",
        }
    }
}

impl FromStr for LogLevelArg {
    type Err = String;

    fn from_str(value: &str) -> Result<Self, Self::Err> {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            return Err("log level cannot be empty".into());
        }

        if let Ok(number) = trimmed.parse::<u8>() {
            let level = match number {
                0 => LevelFilter::OFF,
                1 => LevelFilter::ERROR,
                2 => LevelFilter::WARN,
                3 => LevelFilter::INFO,
                4 => LevelFilter::DEBUG,
                5 => LevelFilter::TRACE,
                _ => {
                    return Err(format!(
                        "unsupported log level number '{number}' (expected 0-5)"
                    ));
                }
            };

            return Ok(LogLevelArg(level));
        }

        let level = match trimmed.to_ascii_lowercase().as_str() {
            "off" => Some(LevelFilter::OFF),
            "error" | "err" => Some(LevelFilter::ERROR),
            "warn" | "warning" => Some(LevelFilter::WARN),
            "info" | "information" => Some(LevelFilter::INFO),
            "debug" => Some(LevelFilter::DEBUG),
            "trace" => Some(LevelFilter::TRACE),
            _ => None,
        }
        .ok_or_else(|| format!("invalid log level '{trimmed}'"))?;

        Ok(LogLevelArg(level))
    }
}

/// Which captured output stream to display.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq)]
pub enum LogKind {
    /// Standard output logs
    #[default]
    Stdout,
    /// Standard error logs
    Stderr,
}

impl LogKind {
    /// String representation used in log file names.
    pub fn as_str(&self) -> &'static str {
        match self {
            LogKind::Stdout => "stdout",
            LogKind::Stderr => "stderr",
        }
    }
}

impl fmt::Display for LogKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

impl FromStr for LogKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_lowercase().as_str() {
            "stdout" => Ok(LogKind::Stdout),
            "stderr" => Ok(LogKind::Stderr),
            _ => Err(format!(
                "invalid log kind '{s}', must be one of: stdout, stderr"
            )),
        }
    }
}

/// Command-line interface for stagehand.
#[derive(Parser)]
#[command(name = "stagehand", version, author)]
#[command(
    about = "Start interdependent services in dependency order, watch their health, tear them down cleanly",
    long_about = None
)]
pub struct Cli {
    /// Override the logging verbosity for this invocation only.
    #[arg(long, value_name = "LEVEL", global = true)]
    pub log_level: Option<LogLevelArg>,

    /// The command to execute.
    #[command(subcommand)]
    pub command: Commands,
}

/// Available commands for stagehand.
#[derive(Subcommand)]
pub enum Commands {
    /// Start every service phase by phase, then monitor them until interrupted.
    Start {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Return as soon as startup succeeds instead of monitoring in the foreground.
        #[arg(long)]
        detach: bool,
    },

    /// Stop every tracked service in reverse dependency order.
    Stop {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,
    },

    /// Show lifecycle, health and latency of every service.
    Status {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Emit machine-readable JSON.
        #[arg(long)]
        json: bool,

        /// Disable ANSI colours in the table.
        #[arg(long)]
        no_color: bool,
    },

    /// Stop everything, then start it again.
    Restart {
        /// Path to the configuration file.
        #[arg(short, long, default_value = DEFAULT_CONFIG_FILE)]
        config: String,

        /// Return as soon as startup succeeds instead of monitoring in the foreground.
        #[arg(long)]
        detach: bool,
    },

    /// Print the tail of a service's captured output.
    Logs {
        /// Service id.
        service: String,

        /// Number of lines to show.
        #[arg(short, long, default_value_t = 50)]
        lines: usize,

        /// Which stream to show (stdout or stderr).
        #[arg(short, long, default_value = "stdout")]
        kind: LogKind,
    },
}

/// Parses command-line arguments and returns a `Cli` struct.
pub fn parse_args() -> Cli {
    Cli::parse()
}
