// scheduler.rs — The control loop that drives goals to a terminal status.
//
// One loop owns dispatch decisions. Each tick it applies completions that
// arrived since the last tick, activates new goals, and dispatches ready
// subgoals while the allocator grants leases. Executions run on their own
// tokio tasks and report back over an mpsc channel, so the loop never waits
// on an individual execution.
//
// Every state change goes through GoalStore::modify, which serializes
// changes per goal and persists them before they become visible. Other
// processes may share the store's backend; each tick starts by reloading
// what they wrote, and a goal that changed underneath a dispatch is
// skipped for that tick rather than failing it.

use std::collections::{HashMap, HashSet, VecDeque};
use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use ta_goal::{
    EventDispatcher, FailureKind, FailureOutcome, GoalError, GoalEvent, GoalId, GoalStatus,
    GoalStore, SubGoal, SubGoalStatus,
};
use tokio::sync::{mpsc, watch};

use crate::allocator::{capability_pool, Lease, ResourceAllocator, GLOBAL_POOL};
use crate::config::SchedulerConfig;
use crate::error::SchedulerError;
use crate::executor::{CancelSignal, ExecutionContext, ExecutionError, ExecutionResult, Executor};
use crate::transition;

/// What one tick did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TickReport {
    /// Completions applied at the start of the tick.
    pub completions: usize,
    /// Subgoals moved to Running and handed to the executor.
    pub dispatched: usize,
    /// Ready subgoals left Pending because capacity was exhausted.
    pub deferred: usize,
}

impl TickReport {
    fn absorb(&mut self, other: TickReport) {
        self.completions += other.completions;
        self.dispatched += other.dispatched;
        self.deferred += other.deferred;
    }
}

/// What startup recovery did.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct RecoveryReport {
    /// Interrupted subgoals requeued for another attempt.
    pub requeued: usize,
    /// Interrupted subgoals that had no attempts left.
    pub failed: usize,
    /// Interrupted subgoals of cancelled goals.
    pub cancelled: usize,
    /// Corrections made by the store's consistency pass.
    pub repairs: usize,
}

/// An execution that finished, in whatever way.
#[derive(Debug)]
struct Completion {
    goal_id: GoalId,
    subgoal_id: String,
    attempt: u32,
    outcome: Result<ExecutionResult, ExecutionError>,
}

pub struct Scheduler {
    store: Arc<GoalStore>,
    executor: Arc<dyn Executor>,
    allocator: Arc<ResourceAllocator>,
    config: SchedulerConfig,
    events: Arc<EventDispatcher>,
    completions_tx: mpsc::UnboundedSender<Completion>,
    completions_rx: mpsc::UnboundedReceiver<Completion>,
    /// Completions received but not yet applied (a failed persist leaves
    /// the completion here for the next tick).
    backlog: VecDeque<Completion>,
    in_flight: HashSet<(GoalId, String)>,
    cancel_signals: HashMap<GoalId, watch::Sender<bool>>,
    recovered: bool,
}

impl Scheduler {
    pub fn new(
        store: Arc<GoalStore>,
        executor: Arc<dyn Executor>,
        allocator: Arc<ResourceAllocator>,
        config: SchedulerConfig,
        events: Arc<EventDispatcher>,
    ) -> Self {
        let (completions_tx, completions_rx) = mpsc::unbounded_channel();
        Self {
            store,
            executor,
            allocator,
            config,
            events,
            completions_tx,
            completions_rx,
            backlog: VecDeque::new(),
            in_flight: HashSet::new(),
            cancel_signals: HashMap::new(),
            recovered: false,
        }
    }

    pub fn store(&self) -> &Arc<GoalStore> {
        &self.store
    }

    pub fn allocator(&self) -> &Arc<ResourceAllocator> {
        &self.allocator
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.len()
    }

    /// Resolve work interrupted by a previous run.
    ///
    /// Subgoals persisted as Running have an unknown outcome: each is
    /// counted as an attempt that failed with `Interrupted` and goes through
    /// the retry policy. Completed subgoals are never touched. Called
    /// automatically before the first tick; calling it again is a no-op.
    pub fn recover(&mut self) -> Result<RecoveryReport, SchedulerError> {
        if self.recovered {
            return Ok(RecoveryReport::default());
        }

        let mut report = RecoveryReport::default();
        for repair in &self.store.load_report().repairs {
            report.repairs += 1;
            if let Some(goal_id) = repair.goal_id {
                self.events.dispatch(&GoalEvent::InvariantRepaired {
                    goal_id,
                    detail: repair.detail.clone(),
                    timestamp: Utc::now(),
                });
            }
        }

        let interrupted: Vec<GoalId> = self
            .store
            .list()
            .into_iter()
            .filter(|r| {
                r.subgoals
                    .iter()
                    .any(|s| s.status == SubGoalStatus::Running)
            })
            .map(|r| r.id())
            .collect();

        for goal_id in interrupted {
            let policy = &self.config.retry;
            let (outcomes, _) = transition::apply(&self.store, &self.events, goal_id, |r| {
                r.recover_interrupted(policy, Utc::now())
            })?;
            for (subgoal_id, outcome) in outcomes {
                tracing::warn!(
                    goal_id = %goal_id,
                    subgoal_id = %subgoal_id,
                    "recovered interrupted subgoal: {:?}",
                    outcome
                );
                match outcome {
                    FailureOutcome::Retry { .. } => report.requeued += 1,
                    FailureOutcome::Failed { .. } => report.failed += 1,
                    FailureOutcome::Cancelled => report.cancelled += 1,
                    FailureOutcome::Ignored => {}
                }
            }
        }

        self.recovered = true;
        if report != RecoveryReport::default() {
            tracing::info!(
                requeued = report.requeued,
                failed = report.failed,
                cancelled = report.cancelled,
                repairs = report.repairs,
                "recovery complete"
            );
        }
        Ok(report)
    }

    /// One pass of the control loop. Runs recovery first if it has not
    /// run yet.
    ///
    /// Must be called from within a Tokio runtime: dispatched executions are
    /// spawned onto it.
    pub fn tick(&mut self) -> Result<TickReport, SchedulerError> {
        if let Err(e) = self.store.refresh() {
            tracing::warn!(error = %e, "failed to reload goals written elsewhere");
        }
        self.recover()?;
        let mut report = TickReport {
            completions: self.drain_completions()?,
            ..TickReport::default()
        };
        self.propagate_cancellations();

        let now = Utc::now();
        let mut goals = self.store.list_active();
        // Oldest goals get first claim on capacity.
        goals.reverse();

        for record in goals {
            let goal_id = record.id();
            let record = if record.status() == GoalStatus::Pending {
                match transition::apply(&self.store, &self.events, goal_id, |r| Ok(r.activate(now))) {
                    Ok((_, record)) => record,
                    Err(e) if skippable(&e) => {
                        tracing::debug!(goal_id = %goal_id, error = %e, "goal changed before activation; skipped");
                        continue;
                    }
                    Err(e) => return Err(e.into()),
                }
            } else {
                record
            };
            if record.goal.cancel_requested {
                continue;
            }

            let ready = record.ready_subgoals(now)?;
            let mut candidates: Vec<&SubGoal> = ready
                .iter()
                .filter_map(|id| record.subgoal(id))
                .filter(|s| !self.in_flight.contains(&(goal_id, s.id.clone())))
                .collect();
            self.config.scoring.order(&mut candidates);

            for subgoal in candidates {
                match self.allocator.try_lease(&resource_requests(subgoal)) {
                    Some(lease) => {
                        if self.dispatch(goal_id, &subgoal.id, lease)? {
                            report.dispatched += 1;
                        }
                    }
                    None => {
                        tracing::debug!(
                            goal_id = %goal_id,
                            subgoal_id = %subgoal.id,
                            "capacity exhausted; dispatch deferred"
                        );
                        report.deferred += 1;
                    }
                }
            }
        }

        Ok(report)
    }

    /// Run until `shutdown` flips to true (or its sender is dropped).
    ///
    /// Tick errors are logged and the loop keeps going; the failed
    /// operation is retried on a later tick.
    pub async fn run(&mut self, mut shutdown: watch::Receiver<bool>) -> Result<(), SchedulerError> {
        let mut interval = tokio::time::interval(self.config.tick_interval());
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);

        tracing::info!(
            tick_interval_ms = self.config.scheduler.tick_interval_ms,
            "scheduler started"
        );

        loop {
            if *shutdown.borrow() {
                break;
            }
            if let Err(e) = self.tick() {
                tracing::error!(error = %e, "scheduler tick failed");
            }

            let wake = tokio::select! {
                _ = interval.tick() => Wake::Tick,
                completion = self.completions_rx.recv() => Wake::Completion(completion),
                changed = shutdown.changed() => Wake::Shutdown(changed.is_err()),
            };
            match wake {
                Wake::Tick => {}
                Wake::Completion(Some(completion)) => self.backlog.push_back(completion),
                Wake::Completion(None) => {}
                Wake::Shutdown(closed) => {
                    if closed || *shutdown.borrow() {
                        break;
                    }
                }
            }
        }

        tracing::info!(in_flight = self.in_flight.len(), "scheduler stopped");
        Ok(())
    }

    /// Tick until no goal is left Pending or Active and nothing is in
    /// flight.
    ///
    /// Also returns when no progress is possible (nothing in flight, nothing
    /// dispatchable, no retry waiting on backoff), which happens when a
    /// capability pool has zero capacity.
    pub async fn run_until_idle(&mut self) -> Result<TickReport, SchedulerError> {
        let interval = self.config.tick_interval();
        let mut total = TickReport::default();

        loop {
            let report = match self.tick() {
                Ok(report) => report,
                Err(SchedulerError::Goal(e @ GoalError::Conflict { .. })) => {
                    tracing::warn!(error = %e, "goal kept changing underneath; retrying next tick");
                    tokio::time::sleep(interval).await;
                    continue;
                }
                Err(e) => return Err(e),
            };
            total.absorb(report);

            if self.in_flight.is_empty() && self.backlog.is_empty() {
                let active = self.store.list_active();
                if active.is_empty() {
                    break;
                }
                let now = Utc::now();
                let backing_off = active
                    .iter()
                    .flat_map(|r| r.subgoals.iter())
                    .any(|s| s.status == SubGoalStatus::Pending && s.is_backing_off(now));
                if report.dispatched == 0 && report.completions == 0 && !backing_off {
                    tracing::warn!(
                        goals = active.len(),
                        deferred = report.deferred,
                        "no subgoal can be dispatched; stopping"
                    );
                    break;
                }
            }

            let completion = tokio::select! {
                completion = self.completions_rx.recv() => completion,
                _ = tokio::time::sleep(interval) => None,
            };
            if let Some(completion) = completion {
                self.backlog.push_back(completion);
            }
        }

        Ok(total)
    }

    /// Cancel a goal.
    ///
    /// Pending and Blocked subgoals become Cancelled immediately; in-flight
    /// executions of the goal are signalled and their outcome is recorded
    /// when they finish. Returns the ids of subgoals still running.
    pub fn cancel(&mut self, goal_id: GoalId) -> Result<Vec<String>, SchedulerError> {
        let (running, _) = transition::apply(&self.store, &self.events, goal_id, |r| {
            r.request_cancel(Utc::now())
        })?;
        if let Some(sender) = self.cancel_signals.get(&goal_id) {
            sender.send_replace(true);
        }
        tracing::info!(goal_id = %goal_id, running = running.len(), "goal cancelled");
        Ok(running)
    }

    /// Start one attempt and hand it to the executor. Returns false when
    /// the goal changed since the ready set was computed (cancelled,
    /// removed, or rewritten elsewhere); the subgoal is skipped this tick.
    fn dispatch(
        &mut self,
        goal_id: GoalId,
        subgoal_id: &str,
        lease: Lease,
    ) -> Result<bool, SchedulerError> {
        // On any early return the lease is dropped here and its capacity returned.
        let started = transition::apply(&self.store, &self.events, goal_id, |r| {
            r.start_subgoal(subgoal_id, Utc::now())
        });
        let (attempt, record) = match started {
            Ok(started) => started,
            Err(e) if skippable(&e) => {
                tracing::debug!(
                    goal_id = %goal_id,
                    subgoal_id = %subgoal_id,
                    error = %e,
                    "goal changed before dispatch; subgoal skipped"
                );
                return Ok(false);
            }
            Err(e) => return Err(e.into()),
        };
        let subgoal = record
            .subgoal(subgoal_id)
            .cloned()
            .ok_or_else(|| GoalError::SubGoalNotFound {
                goal_id,
                subgoal_id: subgoal_id.to_string(),
            })?;

        let cancel = self
            .cancel_signals
            .entry(goal_id)
            .or_insert_with(|| watch::channel(false).0)
            .subscribe();
        let ctx = ExecutionContext {
            goal_id,
            attempt,
            cancel: CancelSignal::new(cancel),
        };

        tracing::info!(
            goal_id = %goal_id,
            subgoal_id = %subgoal_id,
            attempt,
            "dispatching subgoal"
        );
        self.in_flight.insert((goal_id, subgoal_id.to_string()));

        let executor = Arc::clone(&self.executor);
        let timeout = self.config.execution_timeout();
        let tx = self.completions_tx.clone();
        let subgoal_id = subgoal_id.to_string();
        tokio::spawn(async move {
            let outcome = execute_attempt(executor, subgoal, ctx, timeout).await;
            drop(lease);
            let completion = Completion {
                goal_id,
                subgoal_id,
                attempt,
                outcome,
            };
            if let Err(unsent) = tx.send(completion) {
                tracing::warn!(
                    goal_id = %unsent.0.goal_id,
                    subgoal_id = %unsent.0.subgoal_id,
                    "scheduler stopped; completion dropped (recovered on restart)"
                );
            }
        });
        Ok(true)
    }

    fn drain_completions(&mut self) -> Result<usize, SchedulerError> {
        while let Ok(completion) = self.completions_rx.try_recv() {
            self.backlog.push_back(completion);
        }
        let mut applied = 0;
        while let Some(completion) = self.backlog.front() {
            self.apply_completion(completion)?;
            if let Some(done) = self.backlog.pop_front() {
                self.finish(&done);
            }
            applied += 1;
        }
        Ok(applied)
    }

    fn apply_completion(&self, completion: &Completion) -> Result<(), SchedulerError> {
        let goal_id = completion.goal_id;
        let subgoal_id = completion.subgoal_id.as_str();
        let now = Utc::now();

        let applied = match &completion.outcome {
            Ok(result) if result.success => {
                tracing::info!(
                    goal_id = %goal_id,
                    subgoal_id,
                    attempt = completion.attempt,
                    "subgoal completed"
                );
                transition::apply(&self.store, &self.events, goal_id, |r| {
                    r.complete_subgoal(subgoal_id, result.output.clone(), now)
                })
                .map(|_| ())
            }
            Ok(result) => {
                let error = result
                    .error
                    .clone()
                    .unwrap_or_else(|| "executor reported failure".to_string());
                self.record_failure(completion, FailureKind::Execution, &error)
            }
            Err(ExecutionError::Cancelled)
                if self
                    .store
                    .get(goal_id)
                    .is_some_and(|r| r.goal.cancel_requested) =>
            {
                tracing::info!(goal_id = %goal_id, subgoal_id, "subgoal stopped after cancellation");
                transition::apply(&self.store, &self.events, goal_id, |r| {
                    r.cancel_running_subgoal(subgoal_id, now)
                })
                .map(|_| ())
            }
            Err(err) => self.record_failure(completion, err.kind(), &err.to_string()),
        };

        match applied {
            Err(GoalError::NotFound(_)) => {
                tracing::warn!(
                    goal_id = %goal_id,
                    subgoal_id,
                    "completion for a goal that is no longer tracked"
                );
                Ok(())
            }
            Err(
                e @ (GoalError::Persistence { .. }
                | GoalError::Serialization(_)
                | GoalError::Conflict { .. }),
            ) => Err(SchedulerError::from(e)),
            Err(e) => {
                tracing::error!(
                    goal_id = %goal_id,
                    subgoal_id,
                    "dropping completion that cannot be applied: {}",
                    e
                );
                Ok(())
            }
            Ok(()) => Ok(()),
        }
    }

    fn record_failure(
        &self,
        completion: &Completion,
        kind: FailureKind,
        error: &str,
    ) -> Result<(), GoalError> {
        let goal_id = completion.goal_id;
        let subgoal_id = completion.subgoal_id.as_str();
        let policy = &self.config.retry;
        let (outcome, _) = transition::apply(&self.store, &self.events, goal_id, |r| {
            r.fail_subgoal(subgoal_id, kind, error, policy, Utc::now())
        })?;

        match outcome {
            FailureOutcome::Retry {
                attempt,
                not_before,
            } => {
                tracing::warn!(
                    goal_id = %goal_id,
                    subgoal_id,
                    attempt,
                    %kind,
                    %not_before,
                    "subgoal attempt failed; retry scheduled: {}",
                    error
                );
                self.events.dispatch(&GoalEvent::SubGoalRetryScheduled {
                    goal_id,
                    subgoal_id: subgoal_id.to_string(),
                    attempt,
                    not_before,
                    error: error.to_string(),
                    timestamp: Utc::now(),
                });
            }
            FailureOutcome::Failed { blocked } => {
                tracing::error!(
                    goal_id = %goal_id,
                    subgoal_id,
                    attempt = completion.attempt,
                    %kind,
                    blocked = blocked.len(),
                    "subgoal failed permanently: {}",
                    error
                );
            }
            FailureOutcome::Cancelled => {
                tracing::info!(goal_id = %goal_id, subgoal_id, "subgoal cancelled with its goal");
            }
            FailureOutcome::Ignored => {}
        }
        Ok(())
    }

    /// Bookkeeping after a completion is applied.
    fn finish(&mut self, completion: &Completion) {
        let goal_id = completion.goal_id;
        self.in_flight
            .remove(&(goal_id, completion.subgoal_id.clone()));
        if !self.in_flight.iter().any(|(g, _)| *g == goal_id) {
            self.cancel_signals.remove(&goal_id);
        }
    }

    /// Signal in-flight executions of goals cancelled through another
    /// handle on the store (e.g. `GoalService::cancel`).
    fn propagate_cancellations(&self) {
        for (goal_id, sender) in &self.cancel_signals {
            if *sender.borrow() {
                continue;
            }
            if self
                .store
                .get(*goal_id)
                .is_some_and(|r| r.goal.cancel_requested)
            {
                tracing::info!(goal_id = %goal_id, "signalling cancellation to in-flight executions");
                sender.send_replace(true);
            }
        }
    }
}

/// Errors that mean the goal moved on since it was read, not that the
/// tick failed.
fn skippable(e: &GoalError) -> bool {
    matches!(
        e,
        GoalError::InvalidTransition { .. } | GoalError::NotFound(_) | GoalError::Conflict { .. }
    )
}

enum Wake {
    Tick,
    Completion(Option<Completion>),
    Shutdown(bool),
}

/// Pools a subgoal must hold while it runs.
fn resource_requests(subgoal: &SubGoal) -> Vec<(String, usize)> {
    let mut requests = vec![(GLOBAL_POOL.to_string(), 1)];
    for capability in &subgoal.required_capabilities {
        let pool = capability_pool(capability);
        if !requests.iter().any(|(name, _)| *name == pool) {
            requests.push((pool, 1));
        }
    }
    requests
}

/// Run one attempt with a timeout. A panicking executor becomes a failed
/// attempt rather than a lost completion.
async fn execute_attempt(
    executor: Arc<dyn Executor>,
    subgoal: SubGoal,
    ctx: ExecutionContext,
    timeout: Duration,
) -> Result<ExecutionResult, ExecutionError> {
    let task = tokio::spawn(async move { executor.execute(&subgoal, ctx).await });
    let abort = task.abort_handle();
    match tokio::time::timeout(timeout, task).await {
        Ok(Ok(outcome)) => outcome,
        Ok(Err(join_error)) if join_error.is_panic() => Err(ExecutionError::Failed(format!(
            "executor panicked: {}",
            panic_message(join_error.into_panic())
        ))),
        Ok(Err(_)) => Err(ExecutionError::Cancelled),
        Err(_) => {
            abort.abort();
            Err(ExecutionError::Timeout(timeout))
        }
    }
}

fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_string()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic".to_string()
    }
}
