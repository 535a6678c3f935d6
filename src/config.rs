use std::fs;
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::ledger::LedgerLimits;

#[derive(Debug, thiserror::Error)]
pub enum ConfigError {
    #[error("failed to read config file '{path}': {source}")]
    Read {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },
    #[error("failed to parse config JSON: {0}")]
    Parse(#[from] serde_json::Error),
    #[error("config validation failed: {message}")]
    Invalid { message: String },
}

#[derive(Clone, Debug, Serialize, Deserialize, PartialEq, Eq)]
#[serde(default, deny_unknown_fields)]
pub struct HostConfig {
    /// Snapshot file the host loads on start and writes after a replay.
    pub state_path: PathBuf,
    pub log_level: String,
    pub log_json: bool,
    pub limits: LedgerLimits,
}

impl Default for HostConfig {
    fn default() -> Self {
        Self {
            state_path: PathBuf::from("escrow-state.json"),
            log_level: "info".to_string(),
            log_json: false,
            limits: LedgerLimits::default(),
        }
    }
}

impl HostConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let raw = fs::read_to_string(path).map_err(|source| ConfigError::Read {
            path: path.to_path_buf(),
            source,
        })?;
        let config: HostConfig = serde_json::from_str(&raw)?;
        config.validate()?;
        Ok(config)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        let limits = [
            ("limits.max_title_len", self.limits.max_title_len),
            ("limits.max_description_len", self.limits.max_description_len),
            ("limits.max_account_len", self.limits.max_account_len),
            ("limits.max_milestones_per_job", self.limits.max_milestones_per_job),
        ];
        if let Some((name, _)) = limits.iter().find(|(_, value)| *value == 0) {
            return Err(ConfigError::Invalid {
                message: format!("{name} must be greater than zero"),
            });
        }
        if self.state_path.as_os_str().is_empty() {
            return Err(ConfigError::Invalid {
                message: "state_path must not be empty".into(),
            });
        }
        if self.log_level.trim().is_empty() {
            return Err(ConfigError::Invalid {
                message: "log_level must not be empty".into(),
            });
        }
        Ok(())
    }
}
