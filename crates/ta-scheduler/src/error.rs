// error.rs — Error types for the scheduler and goal service.

use std::path::PathBuf;

use ta_goal::GoalError;
use thiserror::Error;

use crate::oracle::DecompositionError;

#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Validation, persistence, or state-machine errors from the goal model.
    #[error(transparent)]
    Goal(#[from] GoalError),

    #[error("decomposition failed: {0}")]
    Decomposition(#[from] DecompositionError),

    #[error("failed to read scheduler config {path}: {source}")]
    ConfigRead {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("invalid scheduler config {path}: {source}")]
    ConfigParse {
        path: PathBuf,
        #[source]
        source: toml::de::Error,
    },

    #[error("invalid scheduler config: {0}")]
    InvalidConfig(String),
}

impl SchedulerError {
    /// True for submission-time errors that reject a goal before any
    /// scheduling happens (the goal is never stored).
    pub fn is_rejection(&self) -> bool {
        match self {
            SchedulerError::Goal(e) => e.is_structural(),
            SchedulerError::Decomposition(_) => true,
            _ => false,
        }
    }
}
