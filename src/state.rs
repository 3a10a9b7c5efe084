//! Session state persisted between CLI invocations.
use std::{
    collections::BTreeMap,
    fs,
    path::{Path, PathBuf},
};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::{error::StateFileError, lifecycle::LifecycleStatus, process, registry::ServiceId};

/// Last-known facts about one service process.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ServiceStateEntry {
    pub pid: Option<u32>,
    pub started_at: Option<DateTime<Utc>>,
    pub status: LifecycleStatus,
    #[serde(default)]
    pub restart_count: u32,
}

impl ServiceStateEntry {
    /// Whether the recorded PID still refers to a live process.
    pub fn is_running(&self) -> bool {
        self.pid.is_some_and(process::pid_exists)
    }
}

/// JSON map of service id to [`ServiceStateEntry`], stored at `<state_dir>/state.json`
/// (see [`crate::runtime::state_file`]).
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct StateFile {
    services: BTreeMap<ServiceId, ServiceStateEntry>,
    #[serde(skip)]
    path: PathBuf,
}

impl StateFile {
    /// Loads `path`, or returns an empty state bound to `path` when it does not exist.
    pub fn load_from(path: &Path) -> Result<Self, StateFileError> {
        if !path.exists() {
            return Ok(Self {
                services: BTreeMap::new(),
                path: path.to_path_buf(),
            });
        }

        let contents = fs::read_to_string(path)?;
        let mut state = serde_json::from_str::<Self>(&contents)?;
        state.path = path.to_path_buf();
        Ok(state)
    }

    pub fn save(&self) -> Result<(), StateFileError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&self.path, serde_json::to_string_pretty(self)?)?;
        debug!("Saved session state to {}", self.path.display());
        Ok(())
    }

    pub fn services(&self) -> &BTreeMap<ServiceId, ServiceStateEntry> {
        &self.services
    }

    pub fn get(&self, service: &str) -> Option<&ServiceStateEntry> {
        self.services.get(service)
    }

    pub fn set(&mut self, service: &str, entry: ServiceStateEntry) {
        self.services.insert(service.to_string(), entry);
    }

    /// Ids whose recorded process is still alive.
    pub fn running(&self) -> Vec<&ServiceId> {
        self.services
            .iter()
            .filter(|(_, entry)| entry.is_running())
            .map(|(id, _)| id)
            .collect()
    }
}
