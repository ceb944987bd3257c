use anyhow::{Context, Result};
use log::warn;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use std::{fs, path::PathBuf, time::Duration};

pub const POLL_INTERVAL_ENV: &str = "PROFRELAY_POLL_INTERVAL_MS";
pub const AGENT_TIMEOUT_ENV: &str = "PROFRELAY_AGENT_TIMEOUT_MS";
pub const DATABASE_ENV: &str = "PROFRELAY_DB";

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase", default)]
pub struct RelayConfig {
    pub poll_interval_ms: u64,
    /// Upper bound on every agent call; a call that takes longer is a failure.
    pub agent_timeout_ms: u64,
    /// Stored allocation events per session before freed ones are pruned.
    pub allocation_count_limit: usize,
    /// `None` keeps the store in memory.
    pub database_path: Option<PathBuf>,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            poll_interval_ms: 250,
            agent_timeout_ms: 2000,
            allocation_count_limit: 5_000_000,
            database_path: None,
        }
    }
}

impl RelayConfig {
    pub fn poll_interval(&self) -> Duration {
        Duration::from_millis(self.poll_interval_ms.max(1))
    }

    pub fn agent_timeout(&self) -> Duration {
        Duration::from_millis(self.agent_timeout_ms.max(1))
    }

    /// Overlay values taken from `lookup` (normally the process environment).
    /// Unparsable values are ignored.
    pub fn apply_overrides<F>(&mut self, lookup: F)
    where
        F: Fn(&str) -> Option<String>,
    {
        if let Some(raw) = lookup(POLL_INTERVAL_ENV) {
            match raw.parse() {
                Ok(value) => self.poll_interval_ms = value,
                Err(_) => warn!("ignoring {POLL_INTERVAL_ENV}={raw}"),
            }
        }
        if let Some(raw) = lookup(AGENT_TIMEOUT_ENV) {
            match raw.parse() {
                Ok(value) => self.agent_timeout_ms = value,
                Err(_) => warn!("ignoring {AGENT_TIMEOUT_ENV}={raw}"),
            }
        }
        if let Some(raw) = lookup(DATABASE_ENV) {
            self.database_path = if raw.is_empty() {
                None
            } else {
                Some(PathBuf::from(raw))
            };
        }
    }
}

pub struct SettingsStore {
    path: PathBuf,
    data: RwLock<RelayConfig>,
}

impl SettingsStore {
    /// Load from `path` if it exists. A file that fails to parse falls back
    /// to defaults.
    pub fn new(path: PathBuf) -> Result<Self> {
        let data = if path.exists() {
            let contents = fs::read_to_string(&path)
                .with_context(|| format!("Failed to read settings from {}", path.display()))?;
            serde_json::from_str(&contents).unwrap_or_else(|err| {
                warn!("Invalid settings in {}: {err}, using defaults", path.display());
                RelayConfig::default()
            })
        } else {
            RelayConfig::default()
        };

        Ok(Self {
            path,
            data: RwLock::new(data),
        })
    }

    /// Stored configuration with environment overrides applied.
    pub fn config(&self) -> RelayConfig {
        let mut config = self.data.read().clone();
        config.apply_overrides(|key| std::env::var(key).ok());
        config
    }

    pub fn update(&self, config: RelayConfig) -> Result<()> {
        let mut guard = self.data.write();
        *guard = config;
        self.persist(&guard)
    }

    fn persist(&self, data: &RelayConfig) -> Result<()> {
        let serialized = serde_json::to_string_pretty(data)?;
        fs::write(&self.path, serialized)
            .with_context(|| format!("Failed to write settings to {}", self.path.display()))
    }

    pub fn reload(&self) -> Result<()> {
        let contents = fs::read_to_string(&self.path)?;
        let data: RelayConfig = serde_json::from_str(&contents)?;
        *self.data.write() = data;
        Ok(())
    }
}
