// project.rs — Where goal-engine state lives inside a project.
//
// Everything is under `<project>/.ta/`:
//   store/            goal records, archive, and the status index
//   events.jsonl      lifecycle events (append-only)
//   scheduler.toml    optional scheduler configuration

use std::path::{Path, PathBuf};

use ta_goal::{EventDispatcher, GoalStore, JsonFileBackend, LogSink};
use ta_scheduler::SchedulerConfig;

#[derive(Debug, Clone)]
pub struct ProjectPaths {
    pub root: PathBuf,
    pub store_dir: PathBuf,
    pub events_log: PathBuf,
    pub scheduler_config: PathBuf,
}

impl ProjectPaths {
    pub fn for_project(root: &Path) -> Self {
        let ta_dir = root.join(".ta");
        Self {
            root: root.to_path_buf(),
            store_dir: ta_dir.join("store"),
            events_log: ta_dir.join("events.jsonl"),
            scheduler_config: SchedulerConfig::path_for_project(root),
        }
    }

    /// Open the goal store, running its consistency pass.
    pub fn open_store(&self) -> anyhow::Result<GoalStore> {
        let store = GoalStore::open(JsonFileBackend::new(&self.store_dir)?)?;
        for repair in &store.load_report().repairs {
            eprintln!("Repaired: {}", repair.detail);
        }
        Ok(store)
    }

    /// Event dispatcher that appends to the project's event log.
    pub fn events(&self) -> EventDispatcher {
        let mut events = EventDispatcher::new();
        events.add_sink(Box::new(LogSink::new(&self.events_log)));
        events
    }

    pub fn load_scheduler_config(&self) -> SchedulerConfig {
        SchedulerConfig::load_or_default(&self.scheduler_config)
    }
}
