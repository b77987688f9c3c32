// state.rs — Status enums and the legal transition table.
//
// Subgoal lifecycle:
//   Pending → Running → Completed
//                     → Pending   (retry, or requeue after a crash)
//                     → Failed
//   Pending → Blocked             (a dependency failed permanently)
//   Pending | Running | Blocked → Cancelled
//
// Goal status is never mutated directly. It is derived from the subgoal
// statuses every time one of them changes (see `GoalStatus::derive`).

use std::fmt;

use serde::{Deserialize, Serialize};

/// Status of a single subgoal. Ordered by lifecycle position.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[serde(rename_all = "snake_case")]
pub enum SubGoalStatus {
    /// Waiting for dependencies, capacity, or a backoff delay.
    Pending,
    /// Dispatched to the executor.
    Running,
    /// Finished successfully.
    Completed,
    /// Failed permanently (retries exhausted or non-retryable error).
    Failed,
    /// A transitive dependency failed; this subgoal will never run.
    Blocked,
    /// The owning goal was cancelled (or failed) before this subgoal ran.
    Cancelled,
}

impl fmt::Display for SubGoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SubGoalStatus::Pending => write!(f, "pending"),
            SubGoalStatus::Running => write!(f, "running"),
            SubGoalStatus::Completed => write!(f, "completed"),
            SubGoalStatus::Failed => write!(f, "failed"),
            SubGoalStatus::Blocked => write!(f, "blocked"),
            SubGoalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl SubGoalStatus {
    /// Check whether moving from this status to `next` is legal.
    ///
    /// Staying in the same status is not a transition; callers treat it as
    /// a no-op before consulting this table.
    pub fn can_transition_to(&self, next: SubGoalStatus) -> bool {
        use SubGoalStatus::*;
        matches!(
            (self, next),
            (Pending, Running)
                | (Pending, Blocked)
                | (Pending, Cancelled)
                | (Running, Completed)
                | (Running, Pending)
                | (Running, Failed)
                | (Running, Cancelled)
                | (Blocked, Cancelled)
        )
    }

    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            SubGoalStatus::Completed | SubGoalStatus::Failed | SubGoalStatus::Cancelled
        )
    }
}

/// Status of a goal, derived from its subgoals.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
#[serde(rename_all = "snake_case")]
pub enum GoalStatus {
    /// Stored but not yet picked up by the scheduler.
    Pending,
    /// The scheduler is driving its subgoals.
    Active,
    /// Every subgoal completed.
    Completed,
    /// A subgoal failed permanently, so the goal can never complete.
    Failed,
    /// Cancelled on request.
    Cancelled,
}

impl fmt::Display for GoalStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            GoalStatus::Pending => write!(f, "pending"),
            GoalStatus::Active => write!(f, "active"),
            GoalStatus::Completed => write!(f, "completed"),
            GoalStatus::Failed => write!(f, "failed"),
            GoalStatus::Cancelled => write!(f, "cancelled"),
        }
    }
}

impl std::str::FromStr for GoalStatus {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "pending" => Ok(GoalStatus::Pending),
            "active" => Ok(GoalStatus::Active),
            "completed" => Ok(GoalStatus::Completed),
            "failed" => Ok(GoalStatus::Failed),
            "cancelled" => Ok(GoalStatus::Cancelled),
            other => Err(format!("unknown goal status '{}'", other)),
        }
    }
}

impl GoalStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(
            self,
            GoalStatus::Completed | GoalStatus::Failed | GoalStatus::Cancelled
        )
    }

    /// Compute a goal's status from its subgoal statuses.
    ///
    /// Precedence: cancellation, then permanent failure (every subgoal is
    /// required, so one FAILED or BLOCKED subgoal leaves no path to
    /// completion), then completion, then pending/active.
    pub fn derive<'a>(
        cancel_requested: bool,
        activated: bool,
        statuses: impl IntoIterator<Item = &'a SubGoalStatus>,
    ) -> GoalStatus {
        if cancel_requested {
            return GoalStatus::Cancelled;
        }
        let mut all_completed = true;
        let mut any = false;
        for status in statuses {
            any = true;
            match status {
                SubGoalStatus::Failed | SubGoalStatus::Blocked => return GoalStatus::Failed,
                SubGoalStatus::Completed => {}
                _ => all_completed = false,
            }
        }
        if any && all_completed {
            GoalStatus::Completed
        } else if activated {
            GoalStatus::Active
        } else {
            GoalStatus::Pending
        }
    }
}
