//! Configuration
//!
//! Optional per-model settings read from `<root>/archstage.json`. Every field
//! has a default, so a missing file and an empty object behave the same.
//! Lock timings can also be overridden from the environment:
//!
//! - `ARCHSTAGE_LOCK_TIMEOUT_MS`
//! - `ARCHSTAGE_STALE_LOCK_MS`

use std::path::Path;
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::{ArchError, Result};
use crate::lock::{
    LockOptions, DEFAULT_LOCK_TIMEOUT, DEFAULT_RETRY_INTERVAL, DEFAULT_STALE_LOCK_THRESHOLD,
};
use crate::storage;

/// Configuration file name, relative to the model root.
pub const CONFIG_FILE: &str = "archstage.json";

pub const ENV_LOCK_TIMEOUT_MS: &str = "ARCHSTAGE_LOCK_TIMEOUT_MS";
pub const ENV_STALE_LOCK_MS: &str = "ARCHSTAGE_STALE_LOCK_MS";

/// Lock timings, in milliseconds.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct LockSettings {
    pub timeout_ms: u64,
    pub retry_interval_ms: u64,
    pub stale_lock_threshold_ms: u64,
    pub detect_stale_locks: bool,
}

impl Default for LockSettings {
    fn default() -> Self {
        Self {
            timeout_ms: DEFAULT_LOCK_TIMEOUT.as_millis() as u64,
            retry_interval_ms: DEFAULT_RETRY_INTERVAL.as_millis() as u64,
            stale_lock_threshold_ms: DEFAULT_STALE_LOCK_THRESHOLD.as_millis() as u64,
            detect_stale_locks: true,
        }
    }
}

impl LockSettings {
    pub fn to_options(&self) -> LockOptions {
        LockOptions {
            timeout: Duration::from_millis(self.timeout_ms),
            retry_interval: Duration::from_millis(self.retry_interval_ms),
            stale_lock_threshold: Duration::from_millis(self.stale_lock_threshold_ms),
            detect_stale_locks: self.detect_stale_locks,
        }
    }
}

/// Top-level configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct Config {
    pub lock: LockSettings,
}

impl Config {
    /// Load `<root>/archstage.json` (if present) and apply environment overrides.
    pub fn load(root: &Path) -> Result<Self> {
        let path = root.join(CONFIG_FILE);
        let mut config = match storage::read_json_opt::<Config>(&path)? {
            Some(parsed) => parsed.map_err(|e| ArchError::ConfigError {
                path: path.clone(),
                reason: e.to_string(),
            })?,
            None => Config::default(),
        };

        config.apply_overrides(|key| std::env::var(key).ok(), &path)?;
        Ok(config)
    }

    pub fn lock_options(&self) -> LockOptions {
        self.lock.to_options()
    }

    fn apply_overrides<F>(&mut self, lookup: F, path: &Path) -> Result<()>
    where
        F: Fn(&str) -> Option<String>,
    {
        let parse = |key: &str, raw: String| {
            raw.trim().parse::<u64>().map_err(|_| ArchError::ConfigError {
                path: path.to_path_buf(),
                reason: format!("{} must be a number of milliseconds, got '{}'", key, raw),
            })
        };

        if let Some(raw) = lookup(ENV_LOCK_TIMEOUT_MS) {
            self.lock.timeout_ms = parse(ENV_LOCK_TIMEOUT_MS, raw)?;
        }
        if let Some(raw) = lookup(ENV_STALE_LOCK_MS) {
            self.lock.stale_lock_threshold_ms = parse(ENV_STALE_LOCK_MS, raw)?;
        }
        Ok(())
    }
}
