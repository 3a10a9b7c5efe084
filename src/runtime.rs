//! Runtime paths shared by separate CLI invocations.
use std::{env, path::PathBuf};

/// Overrides the directory holding the state file and logs.
pub const STATE_DIR_ENV: &str = "STAGEHAND_STATE_DIR";

/// `$STAGEHAND_STATE_DIR`, falling back to `~/.local/share/stagehand`.
pub fn state_dir() -> PathBuf {
    if let Some(dir) = env::var_os(STATE_DIR_ENV).filter(|dir| !dir.is_empty()) {
        return PathBuf::from(dir);
    }

    let home = env::var_os("HOME")
        .map(PathBuf::from)
        .unwrap_or_else(|| PathBuf::from("/"));
    home.join(".local/share/stagehand")
}

/// Directory receiving `<id>.stdout.log` / `<id>.stderr.log`.
pub fn log_dir() -> PathBuf {
    state_dir().join("logs")
}

pub fn state_file() -> PathBuf {
    state_dir().join("state.json")
}
