// transition.rs — Apply a lifecycle change to one goal and announce it.
//
// Wraps GoalStore::modify (per-goal serialized, persisted before it is
// visible) and turns the before/after difference into events, so every
// caller reports transitions the same way. The closure may run more than
// once if the stored record changed underneath; `before` is taken from
// the run that was committed.

use ta_goal::{
    EventDispatcher, GoalError, GoalEvent, GoalId, GoalRecord, GoalStatus, GoalStore,
    SubGoalStatus,
};

pub(crate) fn apply<T>(
    store: &GoalStore,
    events: &EventDispatcher,
    goal_id: GoalId,
    mut f: impl FnMut(&mut GoalRecord) -> Result<T, GoalError>,
) -> Result<(T, GoalRecord), GoalError> {
    let mut before: Option<(GoalStatus, Vec<(String, SubGoalStatus)>)> = None;
    let (out, record) = store.modify(goal_id, |r| {
        before = Some((
            r.status(),
            r.subgoals.iter().map(|s| (s.id.clone(), s.status)).collect(),
        ));
        f(r)
    })?;

    if let Some((goal_before, subgoals_before)) = before {
        for (subgoal_id, from) in subgoals_before {
            let Some(subgoal) = record.subgoal(&subgoal_id) else {
                continue;
            };
            if subgoal.status == from {
                continue;
            }
            tracing::debug!(
                goal_id = %goal_id,
                subgoal_id = %subgoal_id,
                attempt = subgoal.attempt_count,
                "subgoal {} -> {}",
                from,
                subgoal.status
            );
            events.dispatch(&GoalEvent::subgoal_transitioned(
                goal_id,
                &subgoal_id,
                from,
                subgoal.status,
                subgoal.attempt_count,
            ));
        }

        if record.status() != goal_before {
            tracing::info!(
                goal_id = %goal_id,
                "goal {} -> {}",
                goal_before,
                record.status()
            );
            events.dispatch(&GoalEvent::goal_status_changed(
                goal_id,
                goal_before,
                record.status(),
            ));
        }
    }

    Ok((out, record))
}
