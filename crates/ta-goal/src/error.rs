// error.rs — Error types for the goal lifecycle subsystem.
//
// The taxonomy splits into three groups:
//   - submission-time structural errors (Validation, UnknownDependency,
//     CircularDependency): the goal is rejected before anything is stored
//   - store errors (Persistence, Conflict, NotFound)
//   - internal consistency errors (InvalidTransition)
//
// Execution-time failures never show up here; they are absorbed by the
// retry policy and recorded on the subgoal as `last_error`.

use thiserror::Error;
use uuid::Uuid;

/// Errors that can occur during goal lifecycle operations.
#[derive(Debug, Error)]
pub enum GoalError {
    /// A goal or subgoal specification is structurally invalid.
    #[error("validation error: {0}")]
    Validation(String),

    /// A subgoal depends on an id that is not part of the same goal.
    #[error("subgoal '{subgoal_id}' depends on unknown subgoal '{dependency}'")]
    UnknownDependency {
        subgoal_id: String,
        dependency: String,
    },

    /// The dependency relation contains a cycle.
    #[error("circular dependency: {}", cycle.join(" -> "))]
    CircularDependency {
        /// The subgoal ids along the cycle, first id repeated at the end.
        cycle: Vec<String>,
    },

    /// Reading or writing durable state failed.
    #[error("persistence error at {path}: {source}")]
    Persistence {
        path: String,
        source: std::io::Error,
    },

    /// Failed to serialize/deserialize goal data.
    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Optimistic concurrency clash: the caller must re-read and retry.
    #[error("version conflict on goal {goal_id}: expected {expected}, stored {actual}")]
    Conflict {
        goal_id: Uuid,
        expected: u64,
        actual: u64,
    },

    /// The requested goal was not found.
    #[error("goal not found: {0}")]
    NotFound(Uuid),

    /// The requested subgoal was not found in the goal.
    #[error("subgoal '{subgoal_id}' not found in goal {goal_id}")]
    SubGoalNotFound { goal_id: Uuid, subgoal_id: String },

    /// A goal with this id already exists.
    #[error("goal already exists: {0}")]
    AlreadyExists(Uuid),

    /// Illegal status transition. Always an internal consistency error.
    #[error("invalid transition from {from} to {to} for {entity}")]
    InvalidTransition {
        entity: String,
        from: String,
        to: String,
    },

    /// A notification dispatch failed (non-fatal).
    #[error("notification error: {0}")]
    Notification(String),
}

impl GoalError {
    /// Structural errors reject a goal at submission time.
    pub fn is_structural(&self) -> bool {
        matches!(
            self,
            GoalError::Validation(_)
                | GoalError::UnknownDependency { .. }
                | GoalError::CircularDependency { .. }
        )
    }

    pub(crate) fn io(path: impl std::fmt::Display, source: std::io::Error) -> Self {
        GoalError::Persistence {
            path: path.to_string(),
            source,
        }
    }
}
