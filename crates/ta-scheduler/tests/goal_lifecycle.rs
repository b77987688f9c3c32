// goal_lifecycle.rs — End-to-end scheduling tests with a scripted executor.
//
// Each test wires a real GoalStore, ResourceAllocator, Scheduler, and
// GoalService together and drives goals to a terminal status. The scripted
// executor records what ran, and how many ran at once, so the tests can
// check ordering, concurrency bounds, retries, recovery, and cancellation
// from the outside.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use chrono::Utc;
use ta_goal::{
    EventDispatcher, GoalId, GoalRecord, GoalStatus, GoalStore, JsonFileBackend, MemoryBackend,
    MemorySink, RetryPolicy, SubGoal, SubGoalSpec, SubGoalStatus,
};
use ta_scheduler::{
    ExecutionContext, ExecutionError, ExecutionResult, Executor, GoalService, Scheduler,
    SchedulerConfig, StaticOracle, GLOBAL_POOL,
};
use tempfile::TempDir;

// =========================================================
// Scripted executor
// =========================================================

#[derive(Debug, Clone)]
enum Step {
    Succeed,
    Fail(&'static str),
    /// Wait for cancellation (or be aborted by the timeout).
    Hang,
    Panic,
    Invalid,
}

#[derive(Default)]
struct Script {
    steps: Mutex<HashMap<String, VecDeque<Step>>>,
    delay: Duration,
    started: Mutex<Vec<String>>,
    running: Mutex<HashSet<String>>,
    max_running: Mutex<usize>,
    max_gpu_running: Mutex<usize>,
}

impl Script {
    fn with_delay(delay: Duration) -> Self {
        Self {
            delay,
            ..Self::default()
        }
    }

    fn script(self, id: &str, steps: Vec<Step>) -> Self {
        self.steps
            .lock()
            .unwrap()
            .insert(id.to_string(), steps.into());
        self
    }

    fn started(&self) -> Vec<String> {
        self.started.lock().unwrap().clone()
    }

    fn max_running(&self) -> usize {
        *self.max_running.lock().unwrap()
    }

    fn max_gpu_running(&self) -> usize {
        *self.max_gpu_running.lock().unwrap()
    }
}

/// Marks a subgoal as running for the life of the attempt, including
/// attempts that panic or are aborted.
struct RunningGuard<'a> {
    script: &'a Script,
    id: String,
}

impl<'a> RunningGuard<'a> {
    fn enter(script: &'a Script, id: &str) -> Self {
        let mut running = script.running.lock().unwrap();
        running.insert(id.to_string());
        let total = running.len();
        let gpu = running.iter().filter(|r| r.starts_with("gpu")).count();
        drop(running);

        let mut max = script.max_running.lock().unwrap();
        *max = (*max).max(total);
        let mut max_gpu = script.max_gpu_running.lock().unwrap();
        *max_gpu = (*max_gpu).max(gpu);

        Self {
            script,
            id: id.to_string(),
        }
    }
}

impl Drop for RunningGuard<'_> {
    fn drop(&mut self) {
        if let Ok(mut running) = self.script.running.lock() {
            running.remove(&self.id);
        }
    }
}

#[async_trait]
impl Executor for Script {
    async fn execute(
        &self,
        subgoal: &SubGoal,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        self.started.lock().unwrap().push(subgoal.id.clone());
        let _guard = RunningGuard::enter(self, &subgoal.id);
        let step = self
            .steps
            .lock()
            .unwrap()
            .get_mut(&subgoal.id)
            .and_then(|steps| steps.pop_front())
            .unwrap_or(Step::Succeed);

        match step {
            Step::Succeed => {
                tokio::time::sleep(self.delay).await;
                Ok(ExecutionResult::success(serde_json::json!({
                    "subgoal": subgoal.id,
                    "attempt": ctx.attempt,
                })))
            }
            Step::Fail(message) => {
                tokio::time::sleep(self.delay).await;
                Ok(ExecutionResult::failure(message))
            }
            Step::Hang => {
                ctx.cancel.cancelled().await;
                Err(ExecutionError::Cancelled)
            }
            Step::Panic => panic!("executor crashed on {}", subgoal.id),
            Step::Invalid => Err(ExecutionError::Validation("input file missing".into())),
        }
    }
}

// =========================================================
// Harness
// =========================================================

struct Harness {
    store: Arc<GoalStore>,
    service: GoalService,
    scheduler: Scheduler,
    script: Arc<Script>,
    sink: Arc<MemorySink>,
}

fn config(max_concurrent: usize) -> SchedulerConfig {
    let mut config = SchedulerConfig::default();
    config.scheduler.tick_interval_ms = 5;
    config.scheduler.max_concurrent = max_concurrent;
    config.retry = RetryPolicy::default().with_base_delay(Duration::from_millis(1));
    config
}

fn harness(store: GoalStore, script: Script, config: SchedulerConfig) -> Harness {
    let store = Arc::new(store);
    let script = Arc::new(script);
    let sink = Arc::new(MemorySink::new());
    let mut events = EventDispatcher::new();
    events.add_sink(Box::new(sink.clone()));
    let events = Arc::new(events);

    let allocator = Arc::new(config.allocator());
    let service = GoalService::new(
        store.clone(),
        Arc::new(StaticOracle::default()),
        events.clone(),
    );
    let scheduler = Scheduler::new(store.clone(), script.clone(), allocator, config, events);
    Harness {
        store,
        service,
        scheduler,
        script,
        sink,
    }
}

fn memory_harness(script: Script, config: SchedulerConfig) -> Harness {
    harness(GoalStore::open(MemoryBackend::new()).unwrap(), script, config)
}

fn fan_out() -> Vec<SubGoalSpec> {
    vec![
        SubGoalSpec::new("a", "prepare"),
        SubGoalSpec::new("b", "left branch").depends_on(["a"]),
        SubGoalSpec::new("c", "right branch").depends_on(["a"]),
    ]
}

fn independent(ids: &[&str]) -> Vec<SubGoalSpec> {
    ids.iter().map(|id| SubGoalSpec::new(*id, *id)).collect()
}

fn submit(h: &Harness, specs: Vec<SubGoalSpec>) -> GoalId {
    h.service
        .submit_specs("test goal", BTreeMap::new(), specs)
        .unwrap()
        .id()
}

async fn wait_for(
    store: &GoalStore,
    goal_id: GoalId,
    what: &str,
    pred: impl Fn(&GoalRecord) -> bool,
) -> GoalRecord {
    for _ in 0..400 {
        if let Some(record) = store.get(goal_id) {
            if pred(&record) {
                return record;
            }
        }
        tokio::time::sleep(Duration::from_millis(5)).await;
    }
    panic!("timed out waiting for {}", what);
}

// =========================================================
// Tests
// =========================================================

/// G = {A, B(dep A), C(dep A)}, capacity 2: A runs alone, then B and C run
/// together, then G completes.
#[tokio::test]
async fn dependents_run_after_root_and_in_parallel() {
    let mut h = memory_harness(Script::with_delay(Duration::from_millis(30)), config(2));
    let goal_id = submit(&h, fan_out());

    h.scheduler.run_until_idle().await.unwrap();

    let record = h.service.goal_status(goal_id).unwrap();
    assert_eq!(record.status(), GoalStatus::Completed);
    assert!(record
        .subgoals
        .iter()
        .all(|s| s.status == SubGoalStatus::Completed && s.attempt_count == 1));

    let started = h.script.started();
    assert_eq!(started[0], "a");
    assert_eq!(started.len(), 3);

    let a_finished = record.subgoal("a").unwrap().finished_at.unwrap();
    for id in ["b", "c"] {
        assert!(record.subgoal(id).unwrap().started_at.unwrap() >= a_finished);
    }
    assert_eq!(h.script.max_running(), 2);
    assert_eq!(h.scheduler.allocator().usage(GLOBAL_POOL).unwrap().in_use, 0);
}

/// If A exhausts its attempts, B and C are never dispatched and G fails
/// pointing at A.
#[tokio::test]
async fn root_failure_blocks_dependents() {
    let script = Script::default().script(
        "a",
        vec![
            Step::Fail("compile error"),
            Step::Fail("compile error"),
            Step::Fail("compile error"),
            Step::Succeed,
        ],
    );
    let mut h = memory_harness(script, config(2));
    let goal_id = submit(&h, fan_out());

    h.scheduler.run_until_idle().await.unwrap();

    let record = h.service.goal_status(goal_id).unwrap();
    assert_eq!(record.status(), GoalStatus::Failed);
    assert_eq!(h.script.started(), vec!["a", "a", "a"]);

    let a = record.subgoal("a").unwrap();
    assert_eq!(a.status, SubGoalStatus::Failed);
    assert_eq!(a.attempt_count, 3);
    for id in ["b", "c"] {
        let s = record.subgoal(id).unwrap();
        assert_eq!(s.status, SubGoalStatus::Blocked);
        assert_eq!(s.attempt_count, 0);
    }

    let failure = record.goal.failure.as_ref().unwrap();
    assert_eq!(failure.subgoal_id, "a");
    assert!(failure.last_error.contains("compile error"));

    let retries = h
        .sink
        .events()
        .iter()
        .filter(|e| e.event_type() == "sub_goal_retry_scheduled")
        .count();
    assert_eq!(retries, 2);
}

#[tokio::test]
async fn capacity_one_never_runs_two_at_once() {
    let mut h = memory_harness(Script::with_delay(Duration::from_millis(10)), config(1));
    let first = submit(&h, independent(&["p", "q", "r"]));
    let second = submit(&h, independent(&["s", "t"]));

    h.scheduler.run_until_idle().await.unwrap();

    assert_eq!(h.script.max_running(), 1);
    assert_eq!(h.script.started().len(), 5);
    for goal_id in [first, second] {
        assert_eq!(
            h.service.goal_status(goal_id).unwrap().status(),
            GoalStatus::Completed
        );
    }
}

#[tokio::test]
async fn capacity_two_makes_the_third_wait() {
    let mut h = memory_harness(Script::with_delay(Duration::from_millis(30)), config(2));
    let goal_id = submit(&h, independent(&["x", "y", "z"]));

    let report = h.scheduler.tick().unwrap();
    assert_eq!(report.dispatched, 2);
    assert_eq!(report.deferred, 1);

    h.scheduler.run_until_idle().await.unwrap();
    assert_eq!(h.script.max_running(), 2);
    assert_eq!(
        h.service.goal_status(goal_id).unwrap().status(),
        GoalStatus::Completed
    );
}

#[tokio::test]
async fn capability_pool_limits_matching_subgoals() {
    let mut cfg = config(4);
    cfg.capabilities.insert("gpu".to_string(), 1);
    let mut h = memory_harness(Script::with_delay(Duration::from_millis(15)), cfg);
    let goal_id = submit(
        &h,
        vec![
            SubGoalSpec::new("gpu-1", "train").with_capability("gpu"),
            SubGoalSpec::new("gpu-2", "train").with_capability("gpu"),
            SubGoalSpec::new("gpu-3", "train").with_capability("gpu"),
            SubGoalSpec::new("cpu-1", "lint"),
        ],
    );

    h.scheduler.run_until_idle().await.unwrap();

    assert_eq!(h.script.max_gpu_running(), 1);
    assert!(h.script.max_running() >= 2);
    assert_eq!(
        h.service.goal_status(goal_id).unwrap().status(),
        GoalStatus::Completed
    );
}

/// A subgoal persisted as Running is requeued after a restart; a subgoal
/// persisted as Completed is never re-executed.
#[tokio::test]
async fn restart_requeues_running_and_keeps_completed() {
    let dir = TempDir::new().unwrap();

    let goal_id = {
        let store = GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
        let record = GoalRecord::new(
            "resume me",
            BTreeMap::new(),
            vec![
                SubGoalSpec::new("a", "done before crash"),
                SubGoalSpec::new("b", "running at crash").depends_on(["a"]),
            ],
        )
        .unwrap();
        let goal_id = store.insert(record).unwrap().id();

        // Simulate a scheduler that died while "b" was running.
        store
            .modify(goal_id, |r| {
                let now = Utc::now();
                r.activate(now);
                r.start_subgoal("a", now)?;
                r.complete_subgoal("a", serde_json::json!("kept"), now)?;
                r.start_subgoal("b", now)
            })
            .unwrap();
        goal_id
    };

    let store = GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
    let mut h = harness(store, Script::default(), config(2));

    let recovery = h.scheduler.recover().unwrap();
    assert_eq!(recovery.requeued, 1);
    let b = h.store.get_subgoal(goal_id, "b").unwrap();
    assert_eq!(b.status, SubGoalStatus::Pending);
    assert!(b.last_error.unwrap().contains("interrupted"));

    h.scheduler.run_until_idle().await.unwrap();

    assert_eq!(h.script.started(), vec!["b"]);
    let record = h.service.goal_status(goal_id).unwrap();
    assert_eq!(record.status(), GoalStatus::Completed);
    let a = record.subgoal("a").unwrap();
    assert_eq!(a.attempt_count, 1);
    assert_eq!(a.result, Some(serde_json::json!("kept")));
    assert_eq!(record.subgoal("b").unwrap().attempt_count, 2);

    // State survives another reopen.
    drop(h);
    let reopened = GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
    assert_eq!(reopened.get(goal_id).unwrap().status(), GoalStatus::Completed);
}

#[tokio::test]
async fn timeouts_count_as_failed_attempts() {
    let mut cfg = config(2);
    cfg.scheduler.execution_timeout_ms = 30;
    cfg.retry = cfg.retry.with_max_attempts(2);
    let script = Script::default().script("slow", vec![Step::Hang, Step::Hang]);
    let mut h = memory_harness(script, cfg);
    let goal_id = submit(&h, independent(&["slow"]));

    h.scheduler.run_until_idle().await.unwrap();

    let slow = h.service.get_subgoal(goal_id, "slow").unwrap();
    assert_eq!(slow.status, SubGoalStatus::Failed);
    assert_eq!(slow.attempt_count, 2);
    assert!(slow.last_error.unwrap().contains("timed out"));
    assert_eq!(h.scheduler.allocator().usage(GLOBAL_POOL).unwrap().in_use, 0);
}

#[tokio::test]
async fn panicking_executor_is_retried_without_leaking_capacity() {
    let script = Script::default().script("fragile", vec![Step::Panic]);
    let mut h = memory_harness(script, config(1));
    let goal_id = submit(&h, independent(&["fragile"]));

    h.scheduler.run_until_idle().await.unwrap();

    let fragile = h.service.get_subgoal(goal_id, "fragile").unwrap();
    assert_eq!(fragile.status, SubGoalStatus::Completed);
    assert_eq!(fragile.attempt_count, 2);
    assert_eq!(h.scheduler.allocator().usage(GLOBAL_POOL).unwrap().in_use, 0);
}

#[tokio::test]
async fn validation_failures_are_not_retried() {
    let script = Script::default().script("bad", vec![Step::Invalid]);
    let mut h = memory_harness(script, config(2));
    let goal_id = submit(&h, independent(&["bad", "fine"]));

    h.scheduler.run_until_idle().await.unwrap();

    let record = h.service.goal_status(goal_id).unwrap();
    assert_eq!(record.status(), GoalStatus::Failed);
    assert_eq!(record.subgoal("bad").unwrap().attempt_count, 1);
    assert_eq!(record.goal.failure.as_ref().unwrap().subgoal_id, "bad");
}

/// Cancelling through the service while the scheduler runs signals the
/// in-flight execution and keeps completed results.
#[tokio::test]
async fn cancellation_reaches_in_flight_executions() {
    let script = Script::with_delay(Duration::from_millis(5)).script("slow", vec![Step::Hang]);
    let h = memory_harness(script, config(2));
    let goal_id = submit(
        &h,
        vec![
            SubGoalSpec::new("slow", "long job"),
            SubGoalSpec::new("quick", "short job"),
            SubGoalSpec::new("after", "follow-up").depends_on(["slow"]),
        ],
    );

    let Harness {
        store,
        service,
        mut scheduler,
        ..
    } = h;
    let (shutdown_tx, shutdown_rx) = tokio::sync::watch::channel(false);
    let loop_task = tokio::spawn(async move {
        scheduler.run(shutdown_rx).await.unwrap();
        scheduler
    });

    wait_for(&store, goal_id, "quick to complete", |r| {
        r.subgoal("quick").unwrap().status == SubGoalStatus::Completed
            && r.subgoal("slow").unwrap().status == SubGoalStatus::Running
    })
    .await;

    service.cancel(goal_id).unwrap();

    let record = wait_for(&store, goal_id, "slow to stop", |r| {
        r.subgoal("slow").unwrap().status == SubGoalStatus::Cancelled
    })
    .await;

    shutdown_tx.send(true).unwrap();
    let scheduler = loop_task.await.unwrap();

    assert_eq!(record.status(), GoalStatus::Cancelled);
    assert_eq!(record.subgoal("after").unwrap().status, SubGoalStatus::Cancelled);
    let quick = record.subgoal("quick").unwrap();
    assert_eq!(quick.status, SubGoalStatus::Completed);
    assert!(quick.result.is_some());
    assert_eq!(scheduler.in_flight(), 0);
    assert_eq!(scheduler.allocator().usage(GLOBAL_POOL).unwrap().in_use, 0);
}

/// `ta goal cancel` runs in its own process while `ta goal run` is active:
/// the cancel reaches the runner through the shared goal directory, stops
/// the running subgoal, and is not overwritten by the runner's writes.
#[tokio::test]
async fn cancel_from_another_process_reaches_the_runner() {
    let dir = TempDir::new().unwrap();
    let script = Script::default().script("slow", vec![Step::Hang]);
    let h = harness(
        GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap(),
        script,
        config(2),
    );
    let goal_id = submit(
        &h,
        vec![
            SubGoalSpec::new("slow", "long job"),
            SubGoalSpec::new("after", "follow-up").depends_on(["slow"]),
        ],
    );

    let Harness {
        store,
        mut scheduler,
        script,
        ..
    } = h;
    let runner = tokio::spawn(async move { scheduler.run_until_idle().await });

    wait_for(&store, goal_id, "slow to start", |r| {
        r.subgoal("slow").unwrap().status == SubGoalStatus::Running
    })
    .await;

    let other = Arc::new(GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap());
    let canceller = GoalService::new(
        other,
        Arc::new(StaticOracle::default()),
        Arc::new(EventDispatcher::new()),
    );
    canceller.cancel(goal_id).unwrap();

    tokio::time::timeout(Duration::from_secs(5), runner)
        .await
        .expect("runner did not go idle after the cancel")
        .unwrap()
        .unwrap();

    let record = store.get(goal_id).unwrap();
    assert_eq!(record.status(), GoalStatus::Cancelled);
    assert_eq!(record.subgoal("slow").unwrap().status, SubGoalStatus::Cancelled);
    assert_eq!(record.subgoal("after").unwrap().status, SubGoalStatus::Cancelled);
    assert_eq!(script.started(), vec!["slow"]);

    let reopened = GoalStore::open(JsonFileBackend::new(dir.path()).unwrap()).unwrap();
    let on_disk = reopened.get(goal_id).unwrap();
    assert!(on_disk.goal.cancel_requested);
    assert_eq!(on_disk.status(), GoalStatus::Cancelled);
}
