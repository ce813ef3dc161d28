//! Loop configuration.

use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::path::Path;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default, deny_unknown_fields)]
pub struct LoopConfig {
    /// Recorded on the loop's tracing span.
    pub name: String,
    /// Ancestors kept per task for failure diagnostics.
    pub causation_depth: usize,
    /// Cancelled timers tolerated in the timer heap before it is compacted.
    pub compaction_threshold: usize,
    /// Threads in the CPU offload pool, started on first use.
    pub worker_threads: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            name: "main".to_string(),
            causation_depth: 16,
            compaction_threshold: 64,
            worker_threads: 2,
        }
    }
}

impl LoopConfig {
    pub fn from_json_str(json: &str) -> Result<Self, ConfigError> {
        let config: LoopConfig = serde_json::from_str(json)?;
        config.validate()?;
        Ok(config)
    }

    pub fn from_json_file(path: impl AsRef<Path>) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let json = std::fs::read_to_string(path).map_err(|source| ConfigError::Io {
            path: path.to_path_buf(),
            source,
        })?;
        Self::from_json_str(&json)
    }

    pub fn validate(&self) -> Result<(), ConfigError> {
        if self.causation_depth == 0 {
            return Err(ConfigError::ZeroValue {
                field: "causation_depth",
            });
        }
        if self.worker_threads == 0 {
            return Err(ConfigError::ZeroValue {
                field: "worker_threads",
            });
        }
        Ok(())
    }
}
