// service.rs — Submission and status queries over a shared GoalStore.
//
// GoalService is the caller-facing half: it validates and stores new goals
// and answers status queries from consistent snapshots. The Scheduler is
// the driving half. Both hold the same Arc<GoalStore>.

use std::collections::BTreeMap;
use std::sync::Arc;

use chrono::Utc;
use ta_goal::{
    EventDispatcher, GoalError, GoalEvent, GoalId, GoalRecord, GoalStatus, GoalStore, SubGoal,
    SubGoalSpec,
};

use crate::error::SchedulerError;
use crate::oracle::DecompositionOracle;
use crate::transition;

pub struct GoalService {
    store: Arc<GoalStore>,
    oracle: Arc<dyn DecompositionOracle>,
    events: Arc<EventDispatcher>,
}

impl GoalService {
    pub fn new(
        store: Arc<GoalStore>,
        oracle: Arc<dyn DecompositionOracle>,
        events: Arc<EventDispatcher>,
    ) -> Self {
        Self {
            store,
            oracle,
            events,
        }
    }

    /// Decompose a goal with the oracle, validate it, and store it.
    ///
    /// Structural problems (empty goal, unknown dependency, cycle) are
    /// returned here and nothing is stored.
    pub async fn submit(
        &self,
        description: &str,
        context: BTreeMap<String, serde_json::Value>,
    ) -> Result<GoalRecord, SchedulerError> {
        let specs = self.oracle.decompose(description, &context).await?;
        self.submit_specs(description, context, specs)
    }

    /// Validate and store a goal whose subgoals are already known.
    pub fn submit_specs(
        &self,
        description: &str,
        context: BTreeMap<String, serde_json::Value>,
        specs: Vec<SubGoalSpec>,
    ) -> Result<GoalRecord, SchedulerError> {
        let record = GoalRecord::new(description, context, specs).inspect_err(|e| {
            tracing::warn!(error = %e, "goal rejected at submission");
        })?;
        let record = self.store.insert(record)?;

        tracing::info!(
            goal_id = %record.id(),
            subgoals = record.subgoals.len(),
            "goal submitted"
        );
        self.events.dispatch(&GoalEvent::GoalSubmitted {
            goal_id: record.id(),
            description: record.goal.description.clone(),
            subgoal_count: record.subgoals.len(),
            timestamp: Utc::now(),
        });
        Ok(record)
    }

    /// A consistent snapshot of one goal and its subgoals.
    pub fn goal_status(&self, goal_id: GoalId) -> Result<GoalRecord, SchedulerError> {
        self.store
            .get(goal_id)
            .ok_or(SchedulerError::Goal(GoalError::NotFound(goal_id)))
    }

    /// Goals that are still Pending or Active, newest first.
    pub fn list_active_goals(&self) -> Vec<GoalRecord> {
        self.store.list_active()
    }

    pub fn list_goals(&self, status: Option<GoalStatus>) -> Vec<GoalRecord> {
        match status {
            Some(status) => self.store.list_by_status(status),
            None => self.store.list(),
        }
    }

    pub fn get_subgoal(&self, goal_id: GoalId, subgoal_id: &str) -> Result<SubGoal, SchedulerError> {
        self.store.get_subgoal(goal_id, subgoal_id).ok_or_else(|| {
            SchedulerError::Goal(GoalError::SubGoalNotFound {
                goal_id,
                subgoal_id: subgoal_id.to_string(),
            })
        })
    }

    /// Request cancellation. A running scheduler sharing this store signals
    /// the goal's in-flight executions on its next tick.
    pub fn cancel(&self, goal_id: GoalId) -> Result<GoalRecord, SchedulerError> {
        let (running, record) = transition::apply(&self.store, &self.events, goal_id, |r| {
            r.request_cancel(Utc::now())
        })?;
        tracing::info!(goal_id = %goal_id, running = running.len(), "goal cancellation requested");
        Ok(record)
    }

    /// Move a terminal goal to retention storage.
    pub fn archive(&self, goal_id: GoalId) -> Result<GoalRecord, SchedulerError> {
        Ok(self.store.archive(goal_id)?)
    }
}

#[cfg(test)]
mod tests {
    use async_trait::async_trait;
    use ta_goal::{MemoryBackend, MemorySink, SubGoalStatus};

    use super::*;
    use crate::oracle::{DecompositionError, StaticOracle};

    fn service(oracle: Arc<dyn DecompositionOracle>) -> (GoalService, Arc<MemorySink>) {
        let store = Arc::new(GoalStore::open(MemoryBackend::new()).unwrap());
        let sink = Arc::new(MemorySink::new());
        let mut events = EventDispatcher::new();
        events.add_sink(Box::new(sink.clone()));
        (GoalService::new(store, oracle, Arc::new(events)), sink)
    }

    fn diamond() -> Vec<SubGoalSpec> {
        vec![
            SubGoalSpec::new("a", "fetch"),
            SubGoalSpec::new("b", "parse").depends_on(["a"]),
            SubGoalSpec::new("c", "index").depends_on(["a"]),
            SubGoalSpec::new("d", "report").depends_on(["b", "c"]),
        ]
    }

    #[tokio::test]
    async fn submit_stores_decomposed_goal() {
        let (service, sink) = service(Arc::new(StaticOracle::new(diamond())));
        let mut context = BTreeMap::new();
        context.insert("requested_by".to_string(), serde_json::json!("cli"));

        let record = service.submit("build the report", context).await.unwrap();
        assert_eq!(record.subgoals.len(), 4);
        assert_eq!(record.goal.metadata["requested_by"], "cli");

        let status = service.goal_status(record.id()).unwrap();
        assert_eq!(status.status(), GoalStatus::Pending);
        assert_eq!(service.list_active_goals().len(), 1);
        assert_eq!(
            service.get_subgoal(record.id(), "d").unwrap().dependencies,
            vec!["b", "c"]
        );
        assert_eq!(sink.events()[0].event_type(), "goal_submitted");
    }

    #[tokio::test]
    async fn cyclic_decomposition_is_rejected_and_not_stored() {
        let specs = vec![
            SubGoalSpec::new("a", "a").depends_on(["b"]),
            SubGoalSpec::new("b", "b").depends_on(["a"]),
        ];
        let (service, sink) = service(Arc::new(StaticOracle::new(specs)));

        let err = service.submit("loop", BTreeMap::new()).await.unwrap_err();
        assert!(err.is_rejection());
        assert!(matches!(
            err,
            SchedulerError::Goal(GoalError::CircularDependency { .. })
        ));
        assert!(service.list_goals(None).is_empty());
        assert!(sink.events().is_empty());
    }

    #[tokio::test]
    async fn unknown_dependency_is_rejected() {
        let (service, _) = service(Arc::new(StaticOracle::default()));
        let err = service
            .submit_specs(
                "g",
                BTreeMap::new(),
                vec![SubGoalSpec::new("a", "a").depends_on(["ghost"])],
            )
            .unwrap_err();
        assert!(matches!(
            err,
            SchedulerError::Goal(GoalError::UnknownDependency { .. })
        ));
    }

    #[tokio::test]
    async fn oracle_failure_is_surfaced() {
        struct Down;

        #[async_trait]
        impl DecompositionOracle for Down {
            async fn decompose(
                &self,
                _description: &str,
                _context: &BTreeMap<String, serde_json::Value>,
            ) -> Result<Vec<SubGoalSpec>, DecompositionError> {
                Err(DecompositionError::Unavailable("timeout".into()))
            }
        }

        let (service, _) = service(Arc::new(Down));
        let err = service.submit("g", BTreeMap::new()).await.unwrap_err();
        assert!(matches!(err, SchedulerError::Decomposition(_)));
        assert!(service.list_goals(None).is_empty());
    }

    #[test]
    fn cancel_and_archive() {
        let (service, sink) = service(Arc::new(StaticOracle::default()));
        let record = service
            .submit_specs("g", BTreeMap::new(), diamond())
            .unwrap();

        // Active goals cannot be archived.
        assert!(service.archive(record.id()).is_err());

        let cancelled = service.cancel(record.id()).unwrap();
        assert_eq!(cancelled.status(), GoalStatus::Cancelled);
        assert!(cancelled
            .subgoals
            .iter()
            .all(|s| s.status == SubGoalStatus::Cancelled));
        assert!(sink
            .events()
            .iter()
            .any(|e| e.event_type() == "goal_status_changed"));

        // Cancelling twice is an error: the goal is already terminal.
        assert!(service.cancel(record.id()).is_err());

        service.archive(record.id()).unwrap();
        assert!(matches!(
            service.goal_status(record.id()),
            Err(SchedulerError::Goal(GoalError::NotFound(_)))
        ));
    }

    #[test]
    fn missing_subgoal_is_not_found() {
        let (service, _) = service(Arc::new(StaticOracle::default()));
        let record = service
            .submit_specs("g", BTreeMap::new(), diamond())
            .unwrap();
        assert!(matches!(
            service.get_subgoal(record.id(), "zzz"),
            Err(SchedulerError::Goal(GoalError::SubGoalNotFound { .. }))
        ));
    }
}
