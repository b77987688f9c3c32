// executor.rs — The seam between the scheduler and whatever performs work.
//
// The scheduler owns timing, retries, and resource accounting; an
// Executor only runs one attempt of one subgoal and reports how it went.
// Cancellation is cooperative: the executor receives a CancelSignal and
// is expected to stop early and return `ExecutionError::Cancelled`.

use std::time::Duration;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use ta_goal::{FailureKind, GoalId, SubGoal};
use thiserror::Error;
use tokio::sync::watch;

/// Outcome of an attempt that ran to completion.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutionResult {
    pub success: bool,

    #[serde(default)]
    pub output: serde_json::Value,

    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl ExecutionResult {
    pub fn success(output: impl Into<serde_json::Value>) -> Self {
        Self {
            success: true,
            output: output.into(),
            error: None,
        }
    }

    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            output: serde_json::Value::Null,
            error: Some(error.into()),
        }
    }
}

/// Errors an attempt can end with. Each maps onto a [`FailureKind`] for
/// the retry policy.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ExecutionError {
    #[error("execution failed: {0}")]
    Failed(String),

    #[error("execution timed out after {0:?}")]
    Timeout(Duration),

    #[error("resource failure: {0}")]
    Resource(String),

    /// The subgoal can never succeed as specified.
    #[error("invalid subgoal: {0}")]
    Validation(String),

    #[error("execution cancelled")]
    Cancelled,
}

impl ExecutionError {
    pub fn kind(&self) -> FailureKind {
        match self {
            ExecutionError::Failed(_) => FailureKind::Execution,
            ExecutionError::Timeout(_) => FailureKind::Timeout,
            ExecutionError::Resource(_) => FailureKind::Resource,
            ExecutionError::Validation(_) => FailureKind::Validation,
            ExecutionError::Cancelled => FailureKind::Interrupted,
        }
    }
}

/// Receiving side of a goal's cancellation flag.
#[derive(Debug, Clone)]
pub struct CancelSignal {
    rx: watch::Receiver<bool>,
}

impl CancelSignal {
    pub fn new(rx: watch::Receiver<bool>) -> Self {
        Self { rx }
    }

    /// A signal that never fires.
    pub fn never() -> Self {
        let (_tx, rx) = watch::channel(false);
        Self { rx }
    }

    pub fn is_cancelled(&self) -> bool {
        *self.rx.borrow()
    }

    /// Resolves once cancellation is requested. Never resolves if the
    /// sending side goes away without cancelling.
    pub async fn cancelled(&mut self) {
        loop {
            if *self.rx.borrow_and_update() {
                return;
            }
            if self.rx.changed().await.is_err() {
                std::future::pending::<()>().await;
            }
        }
    }
}

/// Per-attempt context handed to the executor.
#[derive(Debug, Clone)]
pub struct ExecutionContext {
    pub goal_id: GoalId,
    /// 1-based attempt number for this subgoal.
    pub attempt: u32,
    pub cancel: CancelSignal,
}

/// Performs one attempt of one subgoal.
#[async_trait]
pub trait Executor: Send + Sync {
    async fn execute(
        &self,
        subgoal: &SubGoal,
        ctx: ExecutionContext,
    ) -> Result<ExecutionResult, ExecutionError>;
}
