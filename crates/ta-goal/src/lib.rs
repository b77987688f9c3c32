//! # ta-goal
//!
//! Goal/subgoal lifecycle model for Trusted Autonomy's goal engine.
//!
//! A goal is decomposed into subgoals that form a dependency graph. This
//! crate validates that graph, defines the legal status transitions, decides
//! retries, and stores goals durably. It is synchronous; the async control
//! loop that drives execution lives in `ta-scheduler`.
//!
//! ## Key components
//!
//! - [`DependencyGraph`] — validation (unknown ids, cycles) and ordering
//! - [`SubGoalStatus`] / [`GoalStatus`] — transition table and derived goal status
//! - [`GoalRecord`] — a goal plus its subgoals; lifecycle transitions live here
//! - [`RetryPolicy`] — retry-with-backoff vs. permanent failure
//! - [`GoalStore`] — durable CRUD with optimistic concurrency and a derived index
//! - [`GoalEvent`] / [`EventDispatcher`] — lifecycle notifications

pub mod backend;
pub mod error;
pub mod events;
pub mod goal;
pub mod graph;
pub mod lifecycle;
pub mod retry;
pub mod scoring;
pub mod state;
pub mod store;

pub use backend::{GoalBackend, JsonFileBackend, MemoryBackend, StatusIndex};
pub use error::GoalError;
pub use events::{EventDispatcher, GoalEvent, LogSink, MemorySink, NotificationSink};
pub use goal::{Goal, GoalFailure, GoalId, GoalRecord, HistoryEntry, SubGoal, SubGoalSpec};
pub use graph::{DependencyGraph, GraphNode};
pub use lifecycle::{FailureOutcome, StatusChange};
pub use retry::{FailureKind, RetryDecision, RetryPolicy};
pub use scoring::ScoringWeights;
pub use state::{GoalStatus, SubGoalStatus};
pub use store::{GoalStore, LoadReport, Repair};
