// goal.rs — Goal, SubGoal, and the GoalRecord that persists them together.
//
// A goal and all of its subgoals are stored as one record so that a single
// atomic replace keeps them consistent with each other. The goal's status
// field is a cached copy of `GoalStatus::derive` over the subgoals; it is
// recomputed on every transition and on every load, never set directly.

use std::collections::{BTreeMap, HashSet};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::GoalError;
use crate::graph::{DependencyGraph, GraphNode};
use crate::state::{GoalStatus, SubGoalStatus};

/// Goal identifier.
pub type GoalId = Uuid;

/// One subgoal as produced by the decomposition step.
///
/// This is the only shape a decomposition result takes; everything the
/// scheduler stores about a subgoal is derived from it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubGoalSpec {
    /// Unique within the goal (e.g. "fetch-data").
    pub id: String,

    pub description: String,

    /// Ids of subgoals in the same goal that must complete first.
    #[serde(default)]
    pub dependencies: Vec<String>,

    /// Opaque capability identifiers, resolved by the executor.
    #[serde(default)]
    pub required_capabilities: Vec<String>,

    /// Expected run time in seconds, if the decomposer estimated one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,

    /// Higher runs earlier among equally ready subgoals.
    #[serde(default)]
    pub priority: i32,

    /// Free-form executor hints (e.g. a `command` for the process executor).
    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,
}

impl SubGoalSpec {
    pub fn new(id: impl Into<String>, description: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            description: description.into(),
            dependencies: Vec::new(),
            required_capabilities: Vec::new(),
            estimated_duration_secs: None,
            priority: 0,
            metadata: BTreeMap::new(),
        }
    }

    pub fn depends_on<I, S>(mut self, ids: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.dependencies.extend(ids.into_iter().map(Into::into));
        self
    }

    pub fn with_capability(mut self, capability: impl Into<String>) -> Self {
        self.required_capabilities.push(capability.into());
        self
    }

    pub fn with_priority(mut self, priority: i32) -> Self {
        self.priority = priority;
        self
    }
}

impl GraphNode for SubGoalSpec {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn node_dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// An atomic unit of work inside a goal's dependency graph.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct SubGoal {
    pub id: String,
    pub goal_id: GoalId,
    pub description: String,
    pub dependencies: Vec<String>,
    pub required_capabilities: Vec<String>,
    pub priority: i32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub estimated_duration_secs: Option<u64>,

    pub status: SubGoalStatus,

    /// Attempts started so far. Incremented on every Pending → Running.
    pub attempt_count: u32,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_error: Option<String>,

    /// Output of the successful attempt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<serde_json::Value>,

    /// Earliest time a retry may be dispatched (set by backoff).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub not_before: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, String>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub started_at: Option<DateTime<Utc>>,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub finished_at: Option<DateTime<Utc>>,
}

impl SubGoal {
    pub fn from_spec(goal_id: GoalId, spec: SubGoalSpec, now: DateTime<Utc>) -> Self {
        Self {
            id: spec.id,
            goal_id,
            description: spec.description,
            dependencies: spec.dependencies,
            required_capabilities: spec.required_capabilities,
            priority: spec.priority,
            estimated_duration_secs: spec.estimated_duration_secs,
            status: SubGoalStatus::Pending,
            attempt_count: 0,
            last_error: None,
            result: None,
            not_before: None,
            metadata: spec.metadata,
            created_at: now,
            updated_at: now,
            started_at: None,
            finished_at: None,
        }
    }

    /// Whether a backoff delay still holds this subgoal back at `now`.
    pub fn is_backing_off(&self, now: DateTime<Utc>) -> bool {
        self.not_before.is_some_and(|t| t > now)
    }
}

impl GraphNode for SubGoal {
    fn node_id(&self) -> &str {
        &self.id
    }
    fn node_dependencies(&self) -> &[String] {
        &self.dependencies
    }
}

/// Where a failed goal failed.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct GoalFailure {
    /// The subgoal whose permanent failure doomed the goal.
    pub subgoal_id: String,
    pub last_error: String,
}

/// One entry in a goal's execution history.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct HistoryEntry {
    pub at: DateTime<Utc>,

    /// None for goal-level entries.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub subgoal_id: Option<String>,

    pub from: String,
    pub to: String,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

/// A goal: a description plus the ordered set of subgoals that achieve it.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Goal {
    pub id: GoalId,
    pub description: String,

    /// Subgoal ids in submission order.
    pub subgoal_ids: Vec<String>,

    /// Cached derived status. See `GoalRecord::refresh_status`.
    pub status: GoalStatus,

    #[serde(default, skip_serializing_if = "BTreeMap::is_empty")]
    pub metadata: BTreeMap<String, serde_json::Value>,

    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,

    /// When the scheduler first picked the goal up.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub activated_at: Option<DateTime<Utc>>,

    #[serde(default)]
    pub cancel_requested: bool,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failure: Option<GoalFailure>,

    /// Optimistic concurrency stamp, bumped on every persisted write.
    #[serde(default)]
    pub version: u64,

    #[serde(default)]
    pub history: Vec<HistoryEntry>,
}

/// A goal together with its subgoals: the unit of persistence.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct GoalRecord {
    pub goal: Goal,
    pub subgoals: Vec<SubGoal>,
}

impl GoalRecord {
    /// Create a validated record in the Pending state.
    ///
    /// Fails with a structural error (empty goal, bad ids, unknown
    /// dependency, cycle) before anything is allocated for scheduling.
    pub fn new(
        description: impl Into<String>,
        metadata: BTreeMap<String, serde_json::Value>,
        specs: Vec<SubGoalSpec>,
    ) -> Result<Self, GoalError> {
        let description = description.into();
        if description.trim().is_empty() {
            return Err(GoalError::Validation("goal description is empty".into()));
        }
        if specs.is_empty() {
            return Err(GoalError::Validation(
                "goal has no subgoals to execute".into(),
            ));
        }
        DependencyGraph::build(&specs)?;

        let now = Utc::now();
        let id = Uuid::new_v4();
        let subgoal_ids = specs.iter().map(|s| s.id.clone()).collect();
        let subgoals = specs
            .into_iter()
            .map(|spec| SubGoal::from_spec(id, spec, now))
            .collect();

        Ok(Self {
            goal: Goal {
                id,
                description,
                subgoal_ids,
                status: GoalStatus::Pending,
                metadata,
                created_at: now,
                updated_at: now,
                activated_at: None,
                cancel_requested: false,
                failure: None,
                version: 0,
                history: Vec::new(),
            },
            subgoals,
        })
    }

    pub fn id(&self) -> GoalId {
        self.goal.id
    }

    pub fn status(&self) -> GoalStatus {
        self.goal.status
    }

    pub fn subgoal(&self, id: &str) -> Option<&SubGoal> {
        self.subgoals.iter().find(|s| s.id == id)
    }

    pub(crate) fn subgoal_mut(&mut self, id: &str) -> Result<&mut SubGoal, GoalError> {
        let goal_id = self.goal.id;
        self.subgoals
            .iter_mut()
            .find(|s| s.id == id)
            .ok_or_else(|| GoalError::SubGoalNotFound {
                goal_id,
                subgoal_id: id.to_string(),
            })
    }

    /// Rebuild the dependency graph from the stored subgoals.
    pub fn graph(&self) -> Result<DependencyGraph, GoalError> {
        DependencyGraph::build(&self.subgoals)
    }

    pub fn ids_with_status(&self, status: SubGoalStatus) -> Vec<String> {
        self.subgoals
            .iter()
            .filter(|s| s.status == status)
            .map(|s| s.id.clone())
            .collect()
    }

    pub fn completed_ids(&self) -> HashSet<String> {
        self.ids_with_status(SubGoalStatus::Completed)
            .into_iter()
            .collect()
    }

    /// The status this record's subgoals imply right now.
    pub fn derived_status(&self) -> GoalStatus {
        GoalStatus::derive(
            self.goal.cancel_requested,
            self.goal.activated_at.is_some(),
            self.subgoals.iter().map(|s| &s.status),
        )
    }

    /// Per-status subgoal counts for status output.
    pub fn counts(&self) -> BTreeMap<SubGoalStatus, usize> {
        let mut counts = BTreeMap::new();
        for s in &self.subgoals {
            *counts.entry(s.status).or_insert(0) += 1;
        }
        counts
    }
}
