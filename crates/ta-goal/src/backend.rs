// backend.rs — Storage media behind GoalStore.
//
// The store keeps its working set in memory and writes through to a
// `GoalBackend`. Backends only move whole records: one goal (with all of
// its subgoals) per write, replaced atomically, so a crash never leaves a
// half-written goal behind.
//
// `JsonFileBackend` layout under its root directory:
//   goals/<goal_id>.json     — live records
//   archive/<goal_id>.json   — records removed from scheduling, kept for audit
//   index.json               — derived status membership (rebuildable cache)
//
// Several processes may share one directory (`ta goal run` alongside
// `ta goal cancel`). `put_if_version` is the only write that races them:
// it claims `<goal_id>.json.tmp` with create-new, checks the version on
// disk, and renames. A writer that finds the claim taken backs off with
// `Conflict`.

use std::collections::{BTreeSet, HashMap};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::GoalError;
use crate::goal::{GoalId, GoalRecord};
use crate::state::GoalStatus;

/// Derived membership of goals by status.
///
/// Always rebuildable from the records; the per-goal status is the
/// authority. A goal id appears in exactly one set.
#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct StatusIndex {
    #[serde(default)]
    pub pending: BTreeSet<GoalId>,
    #[serde(default)]
    pub active: BTreeSet<GoalId>,
    #[serde(default)]
    pub completed: BTreeSet<GoalId>,
    #[serde(default)]
    pub failed: BTreeSet<GoalId>,
    #[serde(default)]
    pub cancelled: BTreeSet<GoalId>,
}

impl StatusIndex {
    pub fn from_records<'a>(records: impl IntoIterator<Item = &'a GoalRecord>) -> Self {
        let mut index = Self::default();
        for record in records {
            index.insert(record.id(), record.status());
        }
        index
    }

    /// Place `id` in the set for `status`, removing it from every other set.
    /// Returns true if membership changed.
    pub fn insert(&mut self, id: GoalId, status: GoalStatus) -> bool {
        if self.memberships(id) == [status] {
            return false;
        }
        self.remove(id);
        self.set_mut(status).insert(id);
        true
    }

    pub fn remove(&mut self, id: GoalId) -> bool {
        let mut removed = false;
        for status in ALL_STATUSES {
            removed |= self.set_mut(status).remove(&id);
        }
        removed
    }

    /// Every set `id` currently belongs to (more than one is a violation).
    pub fn memberships(&self, id: GoalId) -> Vec<GoalStatus> {
        ALL_STATUSES
            .into_iter()
            .filter(|s| self.set(*s).contains(&id))
            .collect()
    }

    pub fn set(&self, status: GoalStatus) -> &BTreeSet<GoalId> {
        match status {
            GoalStatus::Pending => &self.pending,
            GoalStatus::Active => &self.active,
            GoalStatus::Completed => &self.completed,
            GoalStatus::Failed => &self.failed,
            GoalStatus::Cancelled => &self.cancelled,
        }
    }

    fn set_mut(&mut self, status: GoalStatus) -> &mut BTreeSet<GoalId> {
        match status {
            GoalStatus::Pending => &mut self.pending,
            GoalStatus::Active => &mut self.active,
            GoalStatus::Completed => &mut self.completed,
            GoalStatus::Failed => &mut self.failed,
            GoalStatus::Cancelled => &mut self.cancelled,
        }
    }

    fn all_ids(&self) -> BTreeSet<GoalId> {
        ALL_STATUSES
            .into_iter()
            .flat_map(|s| self.set(s).iter().copied())
            .collect()
    }

    /// Human-readable differences between a stored index and the
    /// authoritative one rebuilt from records.
    pub fn discrepancies(&self, authoritative: &StatusIndex) -> Vec<String> {
        let mut found = Vec::new();
        let ids: BTreeSet<GoalId> = self
            .all_ids()
            .union(&authoritative.all_ids())
            .copied()
            .collect();
        for id in ids {
            let stored = self.memberships(id);
            let actual = authoritative.memberships(id);
            if stored == actual {
                continue;
            }
            if stored.len() > 1 {
                found.push(format!(
                    "goal {} listed in {} sets ({}); entity status is {}",
                    id,
                    stored.len(),
                    join(&stored),
                    join(&actual)
                ));
            } else if actual.is_empty() {
                found.push(format!("goal {} indexed as {} but has no record", id, join(&stored)));
            } else if stored.is_empty() {
                found.push(format!("goal {} missing from index (status {})", id, join(&actual)));
            } else {
                found.push(format!(
                    "goal {} indexed as {} but entity status is {}",
                    id,
                    join(&stored),
                    join(&actual)
                ));
            }
        }
        found
    }
}

const ALL_STATUSES: [GoalStatus; 5] = [
    GoalStatus::Pending,
    GoalStatus::Active,
    GoalStatus::Completed,
    GoalStatus::Failed,
    GoalStatus::Cancelled,
];

fn join(statuses: &[GoalStatus]) -> String {
    statuses
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join(", ")
}

/// A storage medium for goal records.
pub trait GoalBackend: Send + Sync {
    /// Load every live record.
    fn load_all(&self) -> Result<Vec<GoalRecord>, GoalError>;

    /// Load one live record, or None if it is not stored.
    fn load(&self, goal_id: GoalId) -> Result<Option<GoalRecord>, GoalError>;

    /// Create or atomically replace one record.
    fn put(&self, record: &GoalRecord) -> Result<(), GoalError>;

    /// Replace one record only if the stored copy is at `expected` version.
    ///
    /// Returns `Conflict` when another writer got there first and
    /// `NotFound` when the stored record is gone.
    fn put_if_version(&self, record: &GoalRecord, expected: u64) -> Result<(), GoalError>;

    /// Remove a live record. Returns false if it did not exist.
    fn remove(&self, goal_id: GoalId) -> Result<bool, GoalError>;

    /// Move a record out of the live set into retention storage.
    fn archive(&self, record: &GoalRecord) -> Result<(), GoalError>;

    fn load_index(&self) -> Result<Option<StatusIndex>, GoalError>;

    fn put_index(&self, index: &StatusIndex) -> Result<(), GoalError>;
}

/// Lets a caller keep a handle on a backend the store owns.
impl<B: GoalBackend + ?Sized> GoalBackend for Arc<B> {
    fn load_all(&self) -> Result<Vec<GoalRecord>, GoalError> {
        (**self).load_all()
    }
    fn load(&self, goal_id: GoalId) -> Result<Option<GoalRecord>, GoalError> {
        (**self).load(goal_id)
    }
    fn put(&self, record: &GoalRecord) -> Result<(), GoalError> {
        (**self).put(record)
    }
    fn put_if_version(&self, record: &GoalRecord, expected: u64) -> Result<(), GoalError> {
        (**self).put_if_version(record, expected)
    }
    fn remove(&self, goal_id: GoalId) -> Result<bool, GoalError> {
        (**self).remove(goal_id)
    }
    fn archive(&self, record: &GoalRecord) -> Result<(), GoalError> {
        (**self).archive(record)
    }
    fn load_index(&self) -> Result<Option<StatusIndex>, GoalError> {
        (**self).load_index()
    }
    fn put_index(&self, index: &StatusIndex) -> Result<(), GoalError> {
        (**self).put_index(index)
    }
}

/// One pretty-printed JSON file per goal, replaced via write-then-rename.
pub struct JsonFileBackend {
    goals_dir: PathBuf,
    archive_dir: PathBuf,
    index_path: PathBuf,
}

impl JsonFileBackend {
    /// Create a backend rooted at `root`, creating directories as needed.
    pub fn new(root: impl AsRef<Path>) -> Result<Self, GoalError> {
        let root = root.as_ref().to_path_buf();
        let goals_dir = root.join("goals");
        let archive_dir = root.join("archive");
        for dir in [&goals_dir, &archive_dir] {
            fs::create_dir_all(dir).map_err(|source| GoalError::io(dir.display(), source))?;
        }
        Ok(Self {
            goals_dir,
            archive_dir,
            index_path: root.join("index.json"),
        })
    }

    fn goal_file(&self, goal_id: GoalId) -> PathBuf {
        self.goals_dir.join(format!("{}.json", goal_id))
    }

    /// Take the write claim for one goal file. A claim older than
    /// `STALE_CLAIM` belongs to a writer that died and is taken over.
    fn claim(&self, tmp_path: &Path) -> Result<Option<File>, GoalError> {
        for _ in 0..2 {
            match OpenOptions::new().write(true).create_new(true).open(tmp_path) {
                Ok(file) => return Ok(Some(file)),
                Err(e) if e.kind() == io::ErrorKind::AlreadyExists => {
                    if !is_stale(tmp_path) {
                        return Ok(None);
                    }
                    tracing::warn!(path = %tmp_path.display(), "taking over abandoned write");
                    match fs::remove_file(tmp_path) {
                        Ok(()) => {}
                        Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                        Err(source) => return Err(GoalError::io(tmp_path.display(), source)),
                    }
                }
                Err(source) => return Err(GoalError::io(tmp_path.display(), source)),
            }
        }
        Ok(None)
    }
}

/// How long a write claim may sit before it is treated as abandoned.
const STALE_CLAIM: Duration = Duration::from_secs(30);

fn is_stale(tmp_path: &Path) -> bool {
    fs::metadata(tmp_path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.elapsed().ok())
        .is_some_and(|age| age > STALE_CLAIM)
}

/// The part of a stored record needed to check its version.
#[derive(Deserialize)]
struct VersionStamp {
    goal: StampedGoal,
}

#[derive(Deserialize)]
struct StampedGoal {
    #[serde(default)]
    version: u64,
}

fn stored_version(path: &Path) -> Result<Option<u64>, GoalError> {
    match fs::read_to_string(path) {
        Ok(json) => Ok(Some(serde_json::from_str::<VersionStamp>(&json)?.goal.version)),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(source) => Err(GoalError::io(path.display(), source)),
    }
}

impl GoalBackend for JsonFileBackend {
    fn load_all(&self) -> Result<Vec<GoalRecord>, GoalError> {
        let mut records = Vec::new();
        let entries = fs::read_dir(&self.goals_dir)
            .map_err(|source| GoalError::io(self.goals_dir.display(), source))?;

        for entry in entries {
            let entry = entry.map_err(|source| GoalError::io(self.goals_dir.display(), source))?;
            let path = entry.path();
            let name = path.file_name().and_then(|n| n.to_str()).unwrap_or("");

            // A temp file is a write in progress, or one that never reached
            // its rename if it has sat there past the claim timeout.
            if name.ends_with(".json.tmp") {
                if is_stale(&path) {
                    tracing::warn!(path = %path.display(), "removing incomplete write left by a crash");
                    fs::remove_file(&path)
                        .map_err(|source| GoalError::io(path.display(), source))?;
                }
                continue;
            }
            if !path.extension().is_some_and(|ext| ext == "json") {
                continue;
            }

            let json = fs::read_to_string(&path)
                .map_err(|source| GoalError::io(path.display(), source))?;
            match serde_json::from_str::<GoalRecord>(&json) {
                Ok(record) => records.push(record),
                Err(e) => {
                    tracing::warn!(path = %path.display(), error = %e, "skipping unreadable goal record");
                }
            }
        }
        Ok(records)
    }

    fn load(&self, goal_id: GoalId) -> Result<Option<GoalRecord>, GoalError> {
        let path = self.goal_file(goal_id);
        match fs::read_to_string(&path) {
            Ok(json) => Ok(Some(serde_json::from_str(&json)?)),
            Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(GoalError::io(path.display(), source)),
        }
    }

    fn put(&self, record: &GoalRecord) -> Result<(), GoalError> {
        let json = serde_json::to_string_pretty(record)?;
        atomic_write(&self.goal_file(record.id()), json.as_bytes())
    }

    fn put_if_version(&self, record: &GoalRecord, expected: u64) -> Result<(), GoalError> {
        let goal_id = record.id();
        let path = self.goal_file(goal_id);
        let tmp_path = path.with_extension("json.tmp");
        let json = serde_json::to_string_pretty(record)?;

        let Some(mut file) = self.claim(&tmp_path)? else {
            let actual = stored_version(&path)?.unwrap_or(expected);
            tracing::debug!(goal_id = %goal_id, "goal file is being written by another process");
            return Err(GoalError::Conflict {
                goal_id,
                expected,
                actual,
            });
        };

        let written = match stored_version(&path) {
            Ok(Some(actual)) if actual == expected => file
                .write_all(json.as_bytes())
                .and_then(|_| file.sync_all())
                .and_then(|_| fs::rename(&tmp_path, &path))
                .map_err(|source| GoalError::io(path.display(), source)),
            Ok(Some(actual)) => Err(GoalError::Conflict {
                goal_id,
                expected,
                actual,
            }),
            Ok(None) => Err(GoalError::NotFound(goal_id)),
            Err(e) => Err(e),
        };
        if written.is_err() {
            if let Err(e) = fs::remove_file(&tmp_path) {
                tracing::warn!(path = %tmp_path.display(), error = %e, "failed to release write claim");
            }
        }
        written
    }

    fn remove(&self, goal_id: GoalId) -> Result<bool, GoalError> {
        let path = self.goal_file(goal_id);
        if !path.exists() {
            return Ok(false);
        }
        fs::remove_file(&path).map_err(|source| GoalError::io(path.display(), source))?;
        Ok(true)
    }

    fn archive(&self, record: &GoalRecord) -> Result<(), GoalError> {
        let json = serde_json::to_string_pretty(record)?;
        let dest = self.archive_dir.join(format!("{}.json", record.id()));
        atomic_write(&dest, json.as_bytes())?;
        self.remove(record.id())?;
        Ok(())
    }

    fn load_index(&self) -> Result<Option<StatusIndex>, GoalError> {
        if !self.index_path.exists() {
            return Ok(None);
        }
        let json = fs::read_to_string(&self.index_path)
            .map_err(|source| GoalError::io(self.index_path.display(), source))?;
        match serde_json::from_str(&json) {
            Ok(index) => Ok(Some(index)),
            Err(e) => {
                tracing::warn!(error = %e, "status index unreadable; it will be rebuilt");
                Ok(None)
            }
        }
    }

    fn put_index(&self, index: &StatusIndex) -> Result<(), GoalError> {
        let json = serde_json::to_string_pretty(index)?;
        atomic_write(&self.index_path, json.as_bytes())
    }
}

/// Write to `<path>.tmp`, fsync, then rename over `path`.
fn atomic_write(path: &Path, data: &[u8]) -> Result<(), GoalError> {
    let tmp_path = path.with_extension("json.tmp");
    let mut file =
        File::create(&tmp_path).map_err(|source| GoalError::io(tmp_path.display(), source))?;
    file.write_all(data)
        .and_then(|_| file.sync_all())
        .map_err(|source| GoalError::io(tmp_path.display(), source))?;
    fs::rename(&tmp_path, path).map_err(|source| GoalError::io(path.display(), source))?;
    Ok(())
}

/// Keeps records in memory only. Used by tests and by callers that embed
/// the engine without durability.
#[derive(Default)]
pub struct MemoryBackend {
    records: Mutex<HashMap<GoalId, GoalRecord>>,
    archived: Mutex<HashMap<GoalId, GoalRecord>>,
    index: Mutex<Option<StatusIndex>>,
    fail_writes: AtomicBool,
}

impl MemoryBackend {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed records as if they had been persisted by an earlier process.
    pub fn with_records(records: impl IntoIterator<Item = GoalRecord>) -> Self {
        let backend = Self::default();
        {
            let mut map = lock(&backend.records);
            for record in records {
                map.insert(record.id(), record);
            }
        }
        backend
    }

    /// Seed a stored index (which may disagree with the records).
    pub fn with_index(self, index: StatusIndex) -> Self {
        *lock(&self.index) = Some(index);
        self
    }

    /// Make every subsequent write fail, to exercise persistence errors.
    pub fn set_fail_writes(&self, fail: bool) {
        self.fail_writes.store(fail, Ordering::SeqCst);
    }

    pub fn stored(&self, goal_id: GoalId) -> Option<GoalRecord> {
        lock(&self.records).get(&goal_id).cloned()
    }

    pub fn archived(&self, goal_id: GoalId) -> Option<GoalRecord> {
        lock(&self.archived).get(&goal_id).cloned()
    }

    pub fn stored_index(&self) -> Option<StatusIndex> {
        lock(&self.index).clone()
    }

    fn check_writable(&self) -> Result<(), GoalError> {
        if self.fail_writes.load(Ordering::SeqCst) {
            return Err(GoalError::io(
                "memory",
                std::io::Error::other("writes disabled"),
            ));
        }
        Ok(())
    }
}

impl GoalBackend for MemoryBackend {
    fn load_all(&self) -> Result<Vec<GoalRecord>, GoalError> {
        Ok(lock(&self.records).values().cloned().collect())
    }

    fn load(&self, goal_id: GoalId) -> Result<Option<GoalRecord>, GoalError> {
        Ok(lock(&self.records).get(&goal_id).cloned())
    }

    fn put(&self, record: &GoalRecord) -> Result<(), GoalError> {
        self.check_writable()?;
        lock(&self.records).insert(record.id(), record.clone());
        Ok(())
    }

    fn put_if_version(&self, record: &GoalRecord, expected: u64) -> Result<(), GoalError> {
        self.check_writable()?;
        let mut records = lock(&self.records);
        let actual = records
            .get(&record.id())
            .map(|stored| stored.goal.version)
            .ok_or(GoalError::NotFound(record.id()))?;
        if actual != expected {
            return Err(GoalError::Conflict {
                goal_id: record.id(),
                expected,
                actual,
            });
        }
        records.insert(record.id(), record.clone());
        Ok(())
    }

    fn remove(&self, goal_id: GoalId) -> Result<bool, GoalError> {
        self.check_writable()?;
        Ok(lock(&self.records).remove(&goal_id).is_some())
    }

    fn archive(&self, record: &GoalRecord) -> Result<(), GoalError> {
        self.check_writable()?;
        lock(&self.archived).insert(record.id(), record.clone());
        lock(&self.records).remove(&record.id());
        Ok(())
    }

    fn load_index(&self) -> Result<Option<StatusIndex>, GoalError> {
        Ok(lock(&self.index).clone())
    }

    fn put_index(&self, index: &StatusIndex) -> Result<(), GoalError> {
        self.check_writable()?;
        *lock(&self.index) = Some(index.clone());
        Ok(())
    }
}

fn lock<T>(m: &Mutex<T>) -> std::sync::MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
}
