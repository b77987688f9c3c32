// oracle.rs — Goal decomposition seam.
//
// An oracle turns a goal description into subgoal specs. Whatever it
// returns is validated by the dependency graph before anything is stored.

use std::collections::BTreeMap;

use async_trait::async_trait;
use ta_goal::SubGoalSpec;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum DecompositionError {
    #[error("decomposition oracle unavailable: {0}")]
    Unavailable(String),

    #[error("goal could not be decomposed: {0}")]
    Rejected(String),
}

/// Decomposes a goal description into subgoal specs.
#[async_trait]
pub trait DecompositionOracle: Send + Sync {
    async fn decompose(
        &self,
        description: &str,
        context: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<SubGoalSpec>, DecompositionError>;
}

/// Returns a fixed decomposition regardless of the description.
///
/// Used for plan files, where the author already wrote the subgoals.
#[derive(Debug, Clone, Default)]
pub struct StaticOracle {
    specs: Vec<SubGoalSpec>,
}

impl StaticOracle {
    pub fn new(specs: Vec<SubGoalSpec>) -> Self {
        Self { specs }
    }
}

#[async_trait]
impl DecompositionOracle for StaticOracle {
    async fn decompose(
        &self,
        _description: &str,
        _context: &BTreeMap<String, serde_json::Value>,
    ) -> Result<Vec<SubGoalSpec>, DecompositionError> {
        Ok(self.specs.clone())
    }
}
