// store.rs — GoalStore: durable goal records with a derived status index.
//
// The store holds every live record in memory, keyed by goal id, and
// writes through to a `GoalBackend`. Each record sits behind its own lock:
// mutations to one goal are serialized, mutations to different goals run
// in parallel. A write reaches the backend before the in-memory copy is
// swapped, so a failed write leaves the store exactly as it was.
//
// On open, a consistency pass treats each record's subgoal statuses as the
// truth: cached goal statuses and the persisted membership index are
// recomputed, and every correction is logged.
//
// Other processes may write the same backend. Every update is a
// compare-and-swap against the version the backend holds, not only the
// in-memory copy: on a clash the store reloads the stored record, and
// `modify` re-applies its closure to it.

use std::collections::HashMap;
use std::sync::{Arc, Mutex, MutexGuard, RwLock};

use chrono::Utc;

use crate::backend::{GoalBackend, StatusIndex};
use crate::error::GoalError;
use crate::goal::{GoalId, GoalRecord, SubGoal};
use crate::state::GoalStatus;

/// A correction made by the consistency pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Repair {
    /// None for index-level corrections that name the goal in `detail`.
    pub goal_id: Option<GoalId>,
    pub detail: String,
}

/// What the consistency pass found when the store was opened.
#[derive(Debug, Clone, Default)]
pub struct LoadReport {
    pub goals_loaded: usize,
    pub repairs: Vec<Repair>,
}

type Entry = Arc<Mutex<GoalRecord>>;

/// Times `modify` reloads and re-applies after losing a version race.
const CONFLICT_RETRIES: usize = 3;

/// Durable CRUD over goal records.
pub struct GoalStore {
    backend: Box<dyn GoalBackend>,
    goals: RwLock<HashMap<GoalId, Entry>>,
    index: Mutex<StatusIndex>,
    report: LoadReport,
}

impl GoalStore {
    /// Load every record from `backend` and run the consistency pass.
    pub fn open(backend: impl GoalBackend + 'static) -> Result<Self, GoalError> {
        let backend: Box<dyn GoalBackend> = Box::new(backend);
        let now = Utc::now();
        let mut report = LoadReport::default();
        let mut records = backend.load_all()?;

        for record in &mut records {
            let cached = record.status();
            if record.refresh_status(now).is_some() {
                let detail = format!(
                    "cached status {} disagreed with subgoals; recomputed as {}",
                    cached,
                    record.status()
                );
                tracing::warn!(goal_id = %record.id(), "{}", detail);
                record.goal.version += 1;
                backend.put(record)?;
                report.repairs.push(Repair {
                    goal_id: Some(record.id()),
                    detail,
                });
            }
        }

        let rebuilt = StatusIndex::from_records(records.iter());
        match backend.load_index()? {
            Some(stored) if stored == rebuilt => {}
            Some(stored) => {
                for detail in stored.discrepancies(&rebuilt) {
                    tracing::warn!("status index repaired: {}", detail);
                    report.repairs.push(Repair {
                        goal_id: None,
                        detail,
                    });
                }
                backend.put_index(&rebuilt)?;
            }
            None => backend.put_index(&rebuilt)?,
        }

        report.goals_loaded = records.len();
        tracing::info!(
            goals = report.goals_loaded,
            repairs = report.repairs.len(),
            "goal store opened"
        );

        let goals = records
            .into_iter()
            .map(|r| (r.id(), Arc::new(Mutex::new(r))))
            .collect();

        Ok(Self {
            backend,
            goals: RwLock::new(goals),
            index: Mutex::new(rebuilt),
            report,
        })
    }

    /// Corrections made when the store was opened.
    pub fn load_report(&self) -> &LoadReport {
        &self.report
    }

    /// Store a new goal. Its version becomes 1.
    pub fn insert(&self, mut record: GoalRecord) -> Result<GoalRecord, GoalError> {
        let id = record.id();
        let mut goals = self.goals.write().unwrap_or_else(|p| p.into_inner());
        if goals.contains_key(&id) {
            return Err(GoalError::AlreadyExists(id));
        }
        record.refresh_status(Utc::now());
        record.goal.version = 1;
        self.backend.put(&record)?;
        goals.insert(id, Arc::new(Mutex::new(record.clone())));
        drop(goals);
        self.index_status(id, record.status())?;
        tracing::debug!(goal_id = %id, "goal stored");
        Ok(record)
    }

    /// A consistent snapshot of one goal.
    pub fn get(&self, goal_id: GoalId) -> Option<GoalRecord> {
        let entry = self.entry(goal_id).ok()?;
        let record = lock(&entry).clone();
        Some(record)
    }

    /// One subgoal, taken from a consistent snapshot of its goal.
    pub fn get_subgoal(&self, goal_id: GoalId, subgoal_id: &str) -> Option<SubGoal> {
        let entry = self.entry(goal_id).ok()?;
        let record = lock(&entry);
        record.subgoal(subgoal_id).cloned()
    }

    /// All goals, newest first.
    pub fn list(&self) -> Vec<GoalRecord> {
        let entries: Vec<Entry> = self
            .goals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .values()
            .cloned()
            .collect();
        let mut records: Vec<GoalRecord> = entries.iter().map(|e| lock(e).clone()).collect();
        records.sort_by(|a, b| b.goal.created_at.cmp(&a.goal.created_at));
        records
    }

    pub fn list_by_status(&self, status: GoalStatus) -> Vec<GoalRecord> {
        self.list()
            .into_iter()
            .filter(|r| r.status() == status)
            .collect()
    }

    /// Goals that have not reached a terminal status (Pending or Active).
    pub fn list_active(&self) -> Vec<GoalRecord> {
        self.list()
            .into_iter()
            .filter(|r| !r.status().is_terminal())
            .collect()
    }

    /// Ids of goals that have not reached a terminal status.
    pub fn active_ids(&self) -> Vec<GoalId> {
        let index = lock(&self.index);
        index
            .pending
            .iter()
            .chain(index.active.iter())
            .copied()
            .collect()
    }

    /// Replace a goal with optimistic concurrency.
    ///
    /// Fails with `Conflict` if `expected_version` is not the stored
    /// version; the caller must re-read and retry.
    pub fn update(
        &self,
        mut record: GoalRecord,
        expected_version: u64,
    ) -> Result<GoalRecord, GoalError> {
        let id = record.id();
        let entry = self.entry(id)?;
        let current = lock(&entry);
        if current.goal.version != expected_version {
            return Err(GoalError::Conflict {
                goal_id: id,
                expected: expected_version,
                actual: current.goal.version,
            });
        }
        record.refresh_status(Utc::now());
        record.goal.version = expected_version + 1;
        self.commit(current, record, expected_version)
    }

    /// Read-modify-write one goal under its lock.
    ///
    /// The closure works on a copy. If it fails nothing is written; if it
    /// leaves the record unchanged nothing is written either. Otherwise the
    /// version is bumped and the record persisted before the swap. If
    /// another writer changed the stored record in the meantime, the closure
    /// runs again on the reloaded record (up to `CONFLICT_RETRIES` times).
    pub fn modify<T>(
        &self,
        goal_id: GoalId,
        mut f: impl FnMut(&mut GoalRecord) -> Result<T, GoalError>,
    ) -> Result<(T, GoalRecord), GoalError> {
        let entry = self.entry(goal_id)?;
        let mut retries = 0;
        loop {
            let current = lock(&entry);
            let mut working = current.clone();
            let out = f(&mut working)?;
            if working == *current {
                return Ok((out, working));
            }
            working.refresh_status(Utc::now());
            let expected = current.goal.version;
            working.goal.version = expected + 1;
            match self.commit(current, working, expected) {
                Ok(committed) => return Ok((out, committed)),
                Err(GoalError::Conflict { actual, .. }) if retries < CONFLICT_RETRIES => {
                    retries += 1;
                    tracing::debug!(
                        goal_id = %goal_id,
                        expected,
                        actual,
                        "goal changed underneath; re-applying"
                    );
                }
                Err(e) => return Err(e),
            }
        }
    }

    /// Pick up writes other processes made to non-terminal goals.
    ///
    /// Returns how many in-memory copies were replaced or dropped.
    pub fn refresh(&self) -> Result<usize, GoalError> {
        let mut changed = 0;
        for goal_id in self.active_ids() {
            let Ok(entry) = self.entry(goal_id) else {
                continue;
            };
            let mut current = lock(&entry);
            match self.backend.load(goal_id)? {
                Some(stored) if stored.goal.version > current.goal.version => {
                    tracing::debug!(
                        goal_id = %goal_id,
                        from = current.goal.version,
                        to = stored.goal.version,
                        "reloaded goal written elsewhere"
                    );
                    let status = stored.status();
                    *current = stored;
                    drop(current);
                    self.index_status(goal_id, status)?;
                    changed += 1;
                }
                Some(_) => {}
                None => {
                    drop(current);
                    self.forget(goal_id)?;
                    changed += 1;
                }
            }
        }
        Ok(changed)
    }

    /// Remove a goal entirely (no retention copy).
    pub fn delete(&self, goal_id: GoalId) -> Result<bool, GoalError> {
        let mut goals = self.goals.write().unwrap_or_else(|p| p.into_inner());
        if !goals.contains_key(&goal_id) {
            return Ok(false);
        }
        self.backend.remove(goal_id)?;
        goals.remove(&goal_id);
        drop(goals);
        self.unindex(goal_id)?;
        Ok(true)
    }

    /// Move a terminal goal to retention storage and stop tracking it.
    pub fn archive(&self, goal_id: GoalId) -> Result<GoalRecord, GoalError> {
        let mut goals = self.goals.write().unwrap_or_else(|p| p.into_inner());
        let entry = goals.get(&goal_id).cloned().ok_or(GoalError::NotFound(goal_id))?;
        let record = lock(&entry).clone();
        if !record.status().is_terminal() {
            return Err(GoalError::Validation(format!(
                "goal {} is {}; only terminal goals can be archived",
                goal_id,
                record.status()
            )));
        }
        self.backend.archive(&record)?;
        goals.remove(&goal_id);
        drop(goals);
        self.unindex(goal_id)?;
        tracing::info!(goal_id = %goal_id, "goal archived");
        Ok(record)
    }

    /// Snapshot of the derived membership index.
    pub fn index(&self) -> StatusIndex {
        lock(&self.index).clone()
    }

    /// Persist `record` if the backend still holds `expected`, then swap it
    /// in. On `Conflict` the in-memory copy is replaced by the stored one;
    /// on `NotFound` the goal is dropped from memory.
    fn commit(
        &self,
        mut current: MutexGuard<'_, GoalRecord>,
        record: GoalRecord,
        expected: u64,
    ) -> Result<GoalRecord, GoalError> {
        let goal_id = record.id();
        match self.backend.put_if_version(&record, expected) {
            Ok(()) => {
                *current = record.clone();
                drop(current);
                self.index_status(goal_id, record.status())?;
                Ok(record)
            }
            Err(conflict @ GoalError::Conflict { .. }) => {
                match self.backend.load(goal_id)? {
                    // The clash may be a claim still being written; keep the
                    // copy we have until the new version lands.
                    Some(stored) if stored.goal.version > current.goal.version => {
                        let status = stored.status();
                        *current = stored;
                        drop(current);
                        self.index_status(goal_id, status)?;
                    }
                    Some(_) => {}
                    None => {
                        drop(current);
                        self.forget(goal_id)?;
                        return Err(GoalError::NotFound(goal_id));
                    }
                }
                Err(conflict)
            }
            Err(GoalError::NotFound(_)) => {
                drop(current);
                self.forget(goal_id)?;
                Err(GoalError::NotFound(goal_id))
            }
            Err(e) => Err(e),
        }
    }

    /// Stop tracking a goal whose stored record was removed elsewhere.
    fn forget(&self, goal_id: GoalId) -> Result<(), GoalError> {
        tracing::info!(goal_id = %goal_id, "goal removed by another writer; no longer tracked");
        self.goals
            .write()
            .unwrap_or_else(|p| p.into_inner())
            .remove(&goal_id);
        self.unindex(goal_id)
    }

    fn entry(&self, goal_id: GoalId) -> Result<Entry, GoalError> {
        self.goals
            .read()
            .unwrap_or_else(|p| p.into_inner())
            .get(&goal_id)
            .cloned()
            .ok_or(GoalError::NotFound(goal_id))
    }

    fn index_status(&self, goal_id: GoalId, status: GoalStatus) -> Result<(), GoalError> {
        let mut index = lock(&self.index);
        if index.insert(goal_id, status) {
            self.backend.put_index(&index)?;
        }
        Ok(())
    }

    fn unindex(&self, goal_id: GoalId) -> Result<(), GoalError> {
        let mut index = lock(&self.index);
        if index.remove(goal_id) {
            self.backend.put_index(&index)?;
        }
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
