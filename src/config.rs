use serde::{Deserialize, Serialize};
use std::fs;
use std::path::{Path, PathBuf};
use std::time::Duration;
use tracing::debug;

use crate::{Error, Result};

const DEFAULT_SIGNAL_CAPACITY: usize = 256;
const DEFAULT_EVENT_CAPACITY: usize = 1024;

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Config {
    /// Cap on simultaneously running tasks; 0 means unlimited.
    #[serde(default)]
    pub max_concurrent: usize,
    /// Per-dispatch deadline layered over the device backend.
    #[serde(default)]
    pub dispatch_timeout_secs: Option<u64>,
    #[serde(default = "default_signal_capacity")]
    pub signal_capacity: usize,
    #[serde(default = "default_event_capacity")]
    pub event_capacity: usize,
}

fn default_signal_capacity() -> usize {
    DEFAULT_SIGNAL_CAPACITY
}

fn default_event_capacity() -> usize {
    DEFAULT_EVENT_CAPACITY
}

impl Default for Config {
    fn default() -> Self {
        Self {
            max_concurrent: 0,
            dispatch_timeout_secs: None,
            signal_capacity: DEFAULT_SIGNAL_CAPACITY,
            event_capacity: DEFAULT_EVENT_CAPACITY,
        }
    }
}

impl Config {
    pub fn constellation_dir() -> Result<PathBuf> {
        Ok(dirs::home_dir()
            .ok_or(Error::NoHomeDir)?
            .join(".constellation"))
    }

    pub fn config_path() -> Result<PathBuf> {
        Ok(Self::constellation_dir()?.join("constellation.toml"))
    }

    pub fn dispatch_timeout(&self) -> Option<Duration> {
        self.dispatch_timeout_secs.map(Duration::from_secs)
    }

    /// Capacity limit as an optional bound.
    pub fn concurrency_limit(&self) -> Option<usize> {
        (self.max_concurrent > 0).then_some(self.max_concurrent)
    }

    /// Load from the default location, falling back to defaults.
    pub fn load() -> Result<Self> {
        Self::load_from(&Self::config_path()?)
    }

    /// Load from an explicit path; a missing file yields defaults.
    pub fn load_from(path: &Path) -> Result<Self> {
        debug!(path = %path.display(), "loading config");
        if !path.exists() {
            debug!("config file not found, using defaults");
            return Ok(Self::default());
        }
        let config: Self = toml::from_str(&fs::read_to_string(path)?)?;
        if config.signal_capacity == 0 || config.event_capacity == 0 {
            return Err(Error::Validation(
                "signal_capacity and event_capacity must be positive".to_string(),
            ));
        }
        debug!(
            max_concurrent = config.max_concurrent,
            dispatch_timeout_secs = ?config.dispatch_timeout_secs,
            "config loaded"
        );
        Ok(config)
    }

    pub fn save_to(&self, path: &Path) -> Result<()> {
        if let Some(parent) = path.parent() {
            if !parent.exists() {
                fs::create_dir_all(parent)?;
            }
        }
        fs::write(path, toml::to_string_pretty(self)?)?;
        debug!(path = %path.display(), "config saved");
        Ok(())
    }
}
