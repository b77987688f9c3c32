//! Scheduler configuration structures

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use serde::{Deserialize, Serialize};
use ta_goal::{RetryPolicy, ScoringWeights};

use crate::allocator::{capability_pool, ResourceAllocator, GLOBAL_POOL};
use crate::error::SchedulerError;

/// Top-level scheduler configuration from .ta/scheduler.toml
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq)]
pub struct SchedulerConfig {
    /// Control loop settings
    #[serde(default)]
    pub scheduler: LoopConfig,

    /// Per-capability concurrency limits (capability name → max running).
    /// Capabilities not listed are unconstrained.
    #[serde(default)]
    pub capabilities: BTreeMap<String, usize>,

    /// Retry/backoff policy for failed attempts
    #[serde(default)]
    pub retry: RetryPolicy,

    /// Dispatch ordering weights
    #[serde(default)]
    pub scoring: ScoringWeights,
}

/// Control loop settings
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LoopConfig {
    /// Interval between ticks when no completion arrives
    #[serde(default = "default_tick_interval_ms")]
    pub tick_interval_ms: u64,

    /// Timeout applied to every dispatched execution
    #[serde(default = "default_execution_timeout_ms")]
    pub execution_timeout_ms: u64,

    /// Global cap on concurrently running subgoals
    #[serde(default = "default_max_concurrent")]
    pub max_concurrent: usize,
}

impl Default for LoopConfig {
    fn default() -> Self {
        Self {
            tick_interval_ms: default_tick_interval_ms(),
            execution_timeout_ms: default_execution_timeout_ms(),
            max_concurrent: default_max_concurrent(),
        }
    }
}

// Serde default functions
fn default_tick_interval_ms() -> u64 {
    500
}

fn default_execution_timeout_ms() -> u64 {
    10 * 60 * 1000
}

fn default_max_concurrent() -> usize {
    4
}

impl SchedulerConfig {
    /// Conventional location under a project root.
    pub fn path_for_project(project_root: &Path) -> PathBuf {
        project_root.join(".ta").join("scheduler.toml")
    }

    /// Load config from a TOML file.
    pub fn load(path: &Path) -> Result<Self, SchedulerError> {
        let content = std::fs::read_to_string(path).map_err(|source| SchedulerError::ConfigRead {
            path: path.to_path_buf(),
            source,
        })?;
        let config: Self = toml::from_str(&content).map_err(|source| SchedulerError::ConfigParse {
            path: path.to_path_buf(),
            source,
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Try to load config, returning default if the file doesn't exist.
    /// A file that exists but cannot be parsed is logged and ignored.
    pub fn load_or_default(path: &Path) -> Self {
        if !path.exists() {
            return Self::default();
        }
        Self::load(path).unwrap_or_else(|e| {
            tracing::warn!(path = %path.display(), error = %e, "using default scheduler config");
            Self::default()
        })
    }

    pub fn validate(&self) -> Result<(), SchedulerError> {
        if self.scheduler.max_concurrent == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scheduler.max_concurrent must be at least 1".into(),
            ));
        }
        if self.scheduler.tick_interval_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scheduler.tick_interval_ms must be at least 1".into(),
            ));
        }
        if self.scheduler.execution_timeout_ms == 0 {
            return Err(SchedulerError::InvalidConfig(
                "scheduler.execution_timeout_ms must be at least 1".into(),
            ));
        }
        if self.retry.max_attempts == 0 {
            return Err(SchedulerError::InvalidConfig(
                "retry.max_attempts must be at least 1".into(),
            ));
        }
        Ok(())
    }

    pub fn tick_interval(&self) -> Duration {
        Duration::from_millis(self.scheduler.tick_interval_ms)
    }

    pub fn execution_timeout(&self) -> Duration {
        Duration::from_millis(self.scheduler.execution_timeout_ms)
    }

    /// Build an allocator with the global pool and one pool per configured
    /// capability.
    pub fn allocator(&self) -> ResourceAllocator {
        let allocator = ResourceAllocator::new().with_pool(GLOBAL_POOL, self.scheduler.max_concurrent);
        for (capability, limit) in &self.capabilities {
            allocator.set_capacity(&capability_pool(capability), *limit);
        }
        allocator
    }
}
