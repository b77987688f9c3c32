// lifecycle.rs — Status transitions applied to a GoalRecord.
//
// Every subgoal transition goes through `set_status`, which enforces the
// transition table in state.rs and appends to the goal's history. Every
// public operation ends by refreshing the derived goal status, so callers
// never see a record whose cached status disagrees with its subgoals.
//
// These functions are pure over the record (no I/O). The scheduler calls
// them inside `GoalStore::modify`, which serializes them per goal.

use chrono::{DateTime, Duration as ChronoDuration, Utc};

use crate::error::GoalError;
use crate::goal::{GoalFailure, GoalRecord, HistoryEntry};
use crate::retry::{FailureKind, RetryDecision, RetryPolicy};
use crate::state::{GoalStatus, SubGoalStatus};

/// What a failed attempt turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FailureOutcome {
    /// Requeued as Pending; eligible again at `not_before`.
    Retry {
        attempt: u32,
        not_before: DateTime<Utc>,
    },
    /// Permanently failed. `blocked` lists transitive dependents that were
    /// moved to Blocked as a consequence.
    Failed { blocked: Vec<String> },
    /// The goal was cancelled; the subgoal was marked Cancelled.
    Cancelled,
    /// The subgoal was no longer Running (duplicate or stale event).
    Ignored,
}

/// A goal status change produced by `refresh_status`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct StatusChange {
    pub from: GoalStatus,
    pub to: GoalStatus,
}

impl GoalRecord {
    /// Move the goal from Pending to Active. Returns false if it was
    /// already activated.
    pub fn activate(&mut self, now: DateTime<Utc>) -> bool {
        if self.goal.activated_at.is_some() {
            return false;
        }
        self.goal.activated_at = Some(now);
        self.refresh_status(now);
        true
    }

    /// Pending → Running. Counts as the start of a new attempt.
    pub fn start_subgoal(&mut self, id: &str, now: DateTime<Utc>) -> Result<u32, GoalError> {
        if self.goal.cancel_requested || self.goal.status.is_terminal() {
            return Err(self.goal_transition_error(GoalStatus::Active));
        }
        self.set_status(id, SubGoalStatus::Running, None, now)?;
        let subgoal = self.subgoal_mut(id)?;
        subgoal.attempt_count += 1;
        subgoal.started_at = Some(now);
        subgoal.not_before = None;
        let attempt = subgoal.attempt_count;
        self.refresh_status(now);
        Ok(attempt)
    }

    /// Running → Completed with the attempt's output.
    ///
    /// Applying the same completion twice is a no-op: returns `Ok(false)`
    /// and leaves the record untouched.
    pub fn complete_subgoal(
        &mut self,
        id: &str,
        output: serde_json::Value,
        now: DateTime<Utc>,
    ) -> Result<bool, GoalError> {
        if !self.set_status(id, SubGoalStatus::Completed, None, now)? {
            return Ok(false);
        }
        let subgoal = self.subgoal_mut(id)?;
        subgoal.result = Some(output);
        subgoal.finished_at = Some(now);
        self.refresh_status(now);
        Ok(true)
    }

    /// Apply a failed attempt: retry with backoff, or fail permanently and
    /// cascade Blocked to every transitive dependent.
    pub fn fail_subgoal(
        &mut self,
        id: &str,
        kind: FailureKind,
        error: &str,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<FailureOutcome, GoalError> {
        let current = self
            .subgoal(id)
            .ok_or_else(|| GoalError::SubGoalNotFound {
                goal_id: self.goal.id,
                subgoal_id: id.to_string(),
            })?
            .status;
        if current != SubGoalStatus::Running {
            tracing::debug!(
                goal_id = %self.goal.id,
                subgoal_id = id,
                status = %current,
                "ignoring failure for subgoal that is not running"
            );
            return Ok(FailureOutcome::Ignored);
        }

        self.subgoal_mut(id)?.last_error = Some(error.to_string());

        if self.goal.cancel_requested {
            self.set_status(id, SubGoalStatus::Cancelled, Some(error), now)?;
            self.subgoal_mut(id)?.finished_at = Some(now);
            self.refresh_status(now);
            return Ok(FailureOutcome::Cancelled);
        }

        let attempt = self.subgoal(id).map(|s| s.attempt_count).unwrap_or(0);
        // A goal that already failed will never dispatch again, so retrying
        // one of its stragglers is pointless.
        let decision = if self.goal.failure.is_some() {
            RetryDecision::GiveUp
        } else {
            policy.decide(attempt, kind)
        };

        match decision {
            RetryDecision::Retry { after } => {
                let not_before = now
                    + ChronoDuration::from_std(after).unwrap_or_else(|_| ChronoDuration::zero());
                let note = format!("{} failure, retry after {:?}", kind, after);
                self.set_status(id, SubGoalStatus::Pending, Some(&note), now)?;
                self.subgoal_mut(id)?.not_before = Some(not_before);
                self.refresh_status(now);
                Ok(FailureOutcome::Retry {
                    attempt,
                    not_before,
                })
            }
            RetryDecision::GiveUp => {
                let note = format!("{} failure after {} attempt(s)", kind, attempt);
                self.set_status(id, SubGoalStatus::Failed, Some(&note), now)?;
                self.subgoal_mut(id)?.finished_at = Some(now);
                let blocked = self.cascade_failure(id, now)?;
                self.refresh_status(now);
                Ok(FailureOutcome::Failed { blocked })
            }
        }
    }

    /// Running → Cancelled for an execution that stopped because its goal
    /// was cancelled.
    pub fn cancel_running_subgoal(
        &mut self,
        id: &str,
        now: DateTime<Utc>,
    ) -> Result<bool, GoalError> {
        let changed = self.set_status(id, SubGoalStatus::Cancelled, Some("cancelled"), now)?;
        if changed {
            self.subgoal_mut(id)?.finished_at = Some(now);
            self.refresh_status(now);
        }
        Ok(changed)
    }

    /// Requeue every subgoal persisted as Running after a restart.
    ///
    /// The attempt's outcome is unknown, so it is counted as an attempt that
    /// failed with `Interrupted` and run through the retry policy. Completed
    /// subgoals are never touched.
    pub fn recover_interrupted(
        &mut self,
        policy: &RetryPolicy,
        now: DateTime<Utc>,
    ) -> Result<Vec<(String, FailureOutcome)>, GoalError> {
        let running = self.ids_with_status(SubGoalStatus::Running);
        let mut outcomes = Vec::with_capacity(running.len());
        for id in running {
            let outcome = self.fail_subgoal(
                &id,
                FailureKind::Interrupted,
                "execution interrupted: scheduler restarted while running",
                policy,
                now,
            )?;
            outcomes.push((id, outcome));
        }
        Ok(outcomes)
    }

    /// Request cancellation of the whole goal.
    ///
    /// Pending and Blocked subgoals become Cancelled immediately. Running
    /// subgoals are returned so the caller can signal them; their outcome is
    /// recorded when they finish. Completed results are kept.
    pub fn request_cancel(&mut self, now: DateTime<Utc>) -> Result<Vec<String>, GoalError> {
        if self.goal.status.is_terminal() {
            return Err(self.goal_transition_error(GoalStatus::Cancelled));
        }
        self.goal.cancel_requested = true;
        for id in self.ids_with_status(SubGoalStatus::Pending) {
            self.set_status(&id, SubGoalStatus::Cancelled, Some("goal cancelled"), now)?;
        }
        for id in self.ids_with_status(SubGoalStatus::Blocked) {
            self.set_status(&id, SubGoalStatus::Cancelled, Some("goal cancelled"), now)?;
        }
        self.refresh_status(now);
        Ok(self.ids_with_status(SubGoalStatus::Running))
    }

    /// Pending subgoals whose dependencies are all Completed and whose
    /// backoff (if any) has elapsed, in topological order.
    pub fn ready_subgoals(&self, now: DateTime<Utc>) -> Result<Vec<String>, GoalError> {
        if self.goal.status != GoalStatus::Active {
            return Ok(Vec::new());
        }
        let graph = self.graph()?;
        let completed = self.completed_ids();
        Ok(graph
            .ready_set(&completed)
            .into_iter()
            .filter(|id| {
                self.subgoal(id).is_some_and(|s| {
                    s.status == SubGoalStatus::Pending && !s.is_backing_off(now)
                })
            })
            .map(str::to_string)
            .collect())
    }

    /// Recompute the cached goal status from the subgoals.
    ///
    /// Returns the change, if any, and records it in the history.
    pub fn refresh_status(&mut self, now: DateTime<Utc>) -> Option<StatusChange> {
        let derived = self.derived_status();
        let previous = self.goal.status;
        if derived == previous {
            return None;
        }
        self.goal.status = derived;
        self.goal.updated_at = now;
        self.goal.history.push(HistoryEntry {
            at: now,
            subgoal_id: None,
            from: previous.to_string(),
            to: derived.to_string(),
            note: self
                .goal
                .failure
                .as_ref()
                .filter(|_| derived == GoalStatus::Failed)
                .map(|f| format!("subgoal '{}' failed: {}", f.subgoal_id, f.last_error)),
        });
        Some(StatusChange {
            from: previous,
            to: derived,
        })
    }

    /// Move every transitive dependent of `failed_id` to Blocked, record the
    /// goal failure, and cancel the remaining Pending subgoals so nothing
    /// else is dispatched for this goal.
    fn cascade_failure(
        &mut self,
        failed_id: &str,
        now: DateTime<Utc>,
    ) -> Result<Vec<String>, GoalError> {
        let graph = self.graph()?;
        let reason = format!("blocked by failed dependency '{}'", failed_id);
        let mut blocked = Vec::new();
        for dependent in graph.transitive_dependents(failed_id) {
            let status = self.subgoal(dependent).map(|s| s.status);
            if status == Some(SubGoalStatus::Pending) {
                self.set_status(dependent, SubGoalStatus::Blocked, Some(&reason), now)?;
                self.subgoal_mut(dependent)?.last_error = Some(reason.clone());
                blocked.push(dependent.to_string());
            }
        }

        if self.goal.failure.is_none() {
            let last_error = self
                .subgoal(failed_id)
                .and_then(|s| s.last_error.clone())
                .unwrap_or_default();
            self.goal.failure = Some(GoalFailure {
                subgoal_id: failed_id.to_string(),
                last_error,
            });
        }

        for id in self.ids_with_status(SubGoalStatus::Pending) {
            self.set_status(
                &id,
                SubGoalStatus::Cancelled,
                Some("goal failed before this subgoal ran"),
                now,
            )?;
        }
        Ok(blocked)
    }

    /// Apply one subgoal transition.
    ///
    /// Returns `Ok(false)` when the subgoal is already in `next` (idempotent
    /// re-application). Illegal transitions are logged and rejected.
    fn set_status(
        &mut self,
        id: &str,
        next: SubGoalStatus,
        note: Option<&str>,
        now: DateTime<Utc>,
    ) -> Result<bool, GoalError> {
        let goal_id = self.goal.id;
        let subgoal = self.subgoal_mut(id)?;
        let current = subgoal.status;
        if current == next {
            return Ok(false);
        }
        if !current.can_transition_to(next) {
            tracing::error!(
                goal_id = %goal_id,
                subgoal_id = id,
                from = %current,
                to = %next,
                "rejected illegal subgoal transition"
            );
            return Err(GoalError::InvalidTransition {
                entity: format!("subgoal '{}' of goal {}", id, goal_id),
                from: current.to_string(),
                to: next.to_string(),
            });
        }
        subgoal.status = next;
        subgoal.updated_at = now;
        self.goal.updated_at = now;
        self.goal.history.push(HistoryEntry {
            at: now,
            subgoal_id: Some(id.to_string()),
            from: current.to_string(),
            to: next.to_string(),
            note: note.map(str::to_string),
        });
        Ok(true)
    }

    fn goal_transition_error(&self, to: GoalStatus) -> GoalError {
        GoalError::InvalidTransition {
            entity: format!("goal {}", self.goal.id),
            from: self.goal.status.to_string(),
            to: to.to_string(),
        }
    }
}
