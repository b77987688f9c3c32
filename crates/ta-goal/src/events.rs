// events.rs — Lifecycle events and notification dispatch.
//
// The store and scheduler emit events at key lifecycle points. Notification
// sinks (log files, webhooks, dashboards) subscribe to them. Sinks observe;
// they cannot influence scheduling, and a failing sink never stops it.

use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GoalError;
use crate::state::{GoalStatus, SubGoalStatus};

/// Events emitted at key goal/subgoal lifecycle points.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "event_type", rename_all = "snake_case")]
pub enum GoalEvent {
    /// A goal passed validation and was stored.
    GoalSubmitted {
        goal_id: Uuid,
        description: String,
        subgoal_count: usize,
        timestamp: DateTime<Utc>,
    },

    /// A goal's derived status changed.
    GoalStatusChanged {
        goal_id: Uuid,
        from_status: GoalStatus,
        to_status: GoalStatus,
        timestamp: DateTime<Utc>,
    },

    /// A subgoal moved between statuses.
    SubGoalTransitioned {
        goal_id: Uuid,
        subgoal_id: String,
        from_status: SubGoalStatus,
        to_status: SubGoalStatus,
        attempt: u32,
        timestamp: DateTime<Utc>,
    },

    /// A failed attempt was requeued with a backoff delay.
    SubGoalRetryScheduled {
        goal_id: Uuid,
        subgoal_id: String,
        attempt: u32,
        not_before: DateTime<Utc>,
        error: String,
        timestamp: DateTime<Utc>,
    },

    /// The consistency pass corrected stored state on load.
    InvariantRepaired {
        goal_id: Uuid,
        detail: String,
        timestamp: DateTime<Utc>,
    },
}

impl GoalEvent {
    /// Get the event type name as a string.
    pub fn event_type(&self) -> &str {
        match self {
            GoalEvent::GoalSubmitted { .. } => "goal_submitted",
            GoalEvent::GoalStatusChanged { .. } => "goal_status_changed",
            GoalEvent::SubGoalTransitioned { .. } => "sub_goal_transitioned",
            GoalEvent::SubGoalRetryScheduled { .. } => "sub_goal_retry_scheduled",
            GoalEvent::InvariantRepaired { .. } => "invariant_repaired",
        }
    }

    pub fn goal_id(&self) -> Uuid {
        match self {
            GoalEvent::GoalSubmitted { goal_id, .. }
            | GoalEvent::GoalStatusChanged { goal_id, .. }
            | GoalEvent::SubGoalTransitioned { goal_id, .. }
            | GoalEvent::SubGoalRetryScheduled { goal_id, .. }
            | GoalEvent::InvariantRepaired { goal_id, .. } => *goal_id,
        }
    }

    pub fn goal_status_changed(goal_id: Uuid, from: GoalStatus, to: GoalStatus) -> Self {
        GoalEvent::GoalStatusChanged {
            goal_id,
            from_status: from,
            to_status: to,
            timestamp: Utc::now(),
        }
    }

    pub fn subgoal_transitioned(
        goal_id: Uuid,
        subgoal_id: &str,
        from: SubGoalStatus,
        to: SubGoalStatus,
        attempt: u32,
    ) -> Self {
        GoalEvent::SubGoalTransitioned {
            goal_id,
            subgoal_id: subgoal_id.to_string(),
            from_status: from,
            to_status: to,
            attempt,
            timestamp: Utc::now(),
        }
    }
}

/// Trait for receiving goal events.
pub trait NotificationSink: Send + Sync {
    /// Handle an event. Errors are logged but don't stop the system.
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError>;
}

/// Logs events as JSONL to a file.
pub struct LogSink {
    path: PathBuf,
}

impl LogSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl NotificationSink for LogSink {
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).map_err(|source| GoalError::io(parent.display(), source))?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .map_err(|source| GoalError::io(self.path.display(), source))?;

        let json = serde_json::to_string(event)?;
        writeln!(file, "{}", json).map_err(|source| GoalError::io(self.path.display(), source))?;

        Ok(())
    }
}

/// Collects events in memory. Handy for tests and for embedding callers
/// that poll instead of subscribing.
#[derive(Default)]
pub struct MemorySink {
    events: Mutex<Vec<GoalEvent>>,
}

impl MemorySink {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn events(&self) -> Vec<GoalEvent> {
        self.events
            .lock()
            .map(|events| events.clone())
            .unwrap_or_default()
    }
}

impl NotificationSink for MemorySink {
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError> {
        self.events
            .lock()
            .map_err(|_| GoalError::Notification("memory sink lock poisoned".into()))?
            .push(event.clone());
        Ok(())
    }
}

impl<T: NotificationSink + ?Sized> NotificationSink for std::sync::Arc<T> {
    fn send(&self, event: &GoalEvent) -> Result<(), GoalError> {
        (**self).send(event)
    }
}

/// Dispatches events to multiple sinks.
///
/// Errors from individual sinks are logged (via tracing) but don't
/// prevent other sinks from receiving the event.
pub struct EventDispatcher {
    sinks: Vec<Box<dyn NotificationSink>>,
}

impl EventDispatcher {
    /// Create a new dispatcher with no sinks.
    pub fn new() -> Self {
        Self { sinks: Vec::new() }
    }

    /// Add a notification sink.
    pub fn add_sink(&mut self, sink: Box<dyn NotificationSink>) {
        self.sinks.push(sink);
    }

    /// Dispatch an event to all sinks.
    pub fn dispatch(&self, event: &GoalEvent) {
        for sink in &self.sinks {
            if let Err(e) = sink.send(event) {
                tracing::warn!(event_type = event.event_type(), "notification sink error: {}", e);
            }
        }
    }
}

impl Default for EventDispatcher {
    fn default() -> Self {
        Self::new()
    }
}
