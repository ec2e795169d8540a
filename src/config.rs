//! Core configuration.

use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{UniverseError, UniverseResult, ValidationError};

/// Worker pool sizing for the run scheduler.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SchedulerConfig {
    /// Number of worker threads executing runs.
    pub workers: usize,
    /// Maximum started runs waiting for a worker.
    pub queue_capacity: usize,
}

impl Default for SchedulerConfig {
    fn default() -> Self {
        Self {
            workers: 2,
            queue_capacity: 256,
        }
    }
}

/// Top-level configuration for a [`crate::Universe`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct UniverseConfig {
    /// Default keyframe cadence for runs that do not set one.
    pub keyframe_interval: u64,
    /// Attempts at the parent-version check before a fork gives up.
    pub fork_max_retries: u32,
    /// Attempts at a run status update before it gives up.
    pub run_update_max_retries: u32,
    /// Worker pool sizing.
    pub scheduler: SchedulerConfig,
}

impl Default for UniverseConfig {
    fn default() -> Self {
        Self {
            keyframe_interval: 10,
            fork_max_retries: 16,
            run_update_max_retries: 16,
            scheduler: SchedulerConfig::default(),
        }
    }
}

impl UniverseConfig {
    /// Checks every field and returns the config unchanged when valid.
    ///
    /// # Errors
    ///
    /// `ValidationError::InvalidConfig` naming the first bad field.
    pub fn validate(self) -> Result<Self, ValidationError> {
        let invalid = |reason: &str| ValidationError::InvalidConfig {
            reason: reason.to_string(),
        };
        if self.keyframe_interval == 0 {
            return Err(invalid("keyframe_interval must be at least 1"));
        }
        if self.fork_max_retries == 0 {
            return Err(invalid("fork_max_retries must be at least 1"));
        }
        if self.run_update_max_retries == 0 {
            return Err(invalid("run_update_max_retries must be at least 1"));
        }
        if self.scheduler.workers == 0 {
            return Err(invalid("scheduler.workers must be at least 1"));
        }
        if self.scheduler.queue_capacity == 0 {
            return Err(invalid("scheduler.queue_capacity must be at least 1"));
        }
        Ok(self)
    }

    /// Loads and validates a JSON config file. Missing fields take defaults.
    ///
    /// # Errors
    ///
    /// Fails if the file cannot be read, is not valid JSON, or does not validate.
    pub fn from_json_file(path: impl AsRef<Path>) -> UniverseResult<Self> {
        let path = path.as_ref();
        let raw = std::fs::read_to_string(path).map_err(|e| UniverseError::Storage {
            message: format!("failed to read config {}: {e}", path.display()),
        })?;
        let config: Self = serde_json::from_str(&raw).map_err(|e| ValidationError::InvalidConfig {
            reason: format!("{}: {e}", path.display()),
        })?;
        Ok(config.validate()?)
    }
}
