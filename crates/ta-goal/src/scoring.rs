// scoring.rs — Dispatch ordering among equally ready subgoals.
//
// The score is a weighted sum of the subgoal's priority and a shortness
// term (short estimated work first). The weights are configuration, not
// constants: 0.7 / 0.3 are only defaults.

use serde::{Deserialize, Serialize};

use crate::goal::SubGoal;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq)]
pub struct ScoringWeights {
    #[serde(default = "default_priority_weight")]
    pub priority_weight: f64,

    #[serde(default = "default_duration_weight")]
    pub duration_weight: f64,
}

fn default_priority_weight() -> f64 {
    0.7
}

fn default_duration_weight() -> f64 {
    0.3
}

impl Default for ScoringWeights {
    fn default() -> Self {
        Self {
            priority_weight: default_priority_weight(),
            duration_weight: default_duration_weight(),
        }
    }
}

impl ScoringWeights {
    /// Higher scores dispatch first.
    ///
    /// The shortness term is `1 / (1 + estimated minutes)`, or 0 when the
    /// duration is unknown.
    pub fn score(&self, subgoal: &SubGoal) -> f64 {
        let shortness = subgoal
            .estimated_duration_secs
            .map(|secs| 1.0 / (1.0 + secs as f64 / 60.0))
            .unwrap_or(0.0);
        self.priority_weight * subgoal.priority as f64 + self.duration_weight * shortness
    }

    /// Sort subgoals by descending score. The sort is stable, so equal
    /// scores keep their incoming (topological) order.
    pub fn order<'a>(&self, subgoals: &mut [&'a SubGoal]) {
        subgoals.sort_by(|a, b| self.score(b).total_cmp(&self.score(a)));
    }
}
