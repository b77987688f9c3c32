//! # ta-scheduler
//!
//! The async half of Trusted Autonomy's goal engine.
//!
//! [`GoalService`] decomposes and validates goals and stores them in a
//! shared [`ta_goal::GoalStore`]. [`Scheduler`] drives stored goals to a
//! terminal status: it dispatches ready subgoals to an [`Executor`] under
//! the limits of a [`ResourceAllocator`], applies retries and cascading
//! failure, recovers interrupted work after a restart, and propagates
//! cancellation to in-flight executions.
//!
//! Collaborators are passed in explicitly; there is no global state.

pub mod allocator;
pub mod config;
pub mod error;
pub mod executor;
pub mod oracle;
pub mod scheduler;
pub mod service;
mod transition;

pub use allocator::{capability_pool, Lease, PoolUsage, ResourceAllocator, GLOBAL_POOL};
pub use config::{LoopConfig, SchedulerConfig};
pub use error::SchedulerError;
pub use executor::{CancelSignal, ExecutionContext, ExecutionError, ExecutionResult, Executor};
pub use oracle::{DecompositionError, DecompositionOracle, StaticOracle};
pub use scheduler::{RecoveryReport, Scheduler, TickReport};
pub use service::GoalService;
