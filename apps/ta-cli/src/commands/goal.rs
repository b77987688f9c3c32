// goal.rs — Goal subcommands: submit, run, list, status, cancel, archive.

use std::collections::BTreeMap;
use std::path::Path;
use std::sync::Arc;

use anyhow::Context;
use clap::Subcommand;
use serde::Deserialize;
use ta_goal::{GoalRecord, GoalStatus, SubGoalSpec, SubGoalStatus};
use ta_scheduler::{GoalService, Scheduler, StaticOracle, TickReport};

use crate::executor::CommandExecutor;
use crate::project::ProjectPaths;

#[derive(Subcommand)]
pub enum GoalCommands {
    /// Submit a goal from a plan file.
    Submit {
        /// Plan file (TOML) with a description and [[subgoals]].
        plan: std::path::PathBuf,
    },
    /// Run the scheduler until every goal reaches a terminal status.
    Run {
        /// Maximum subgoals running at once (overrides scheduler.toml).
        #[arg(long)]
        concurrency: Option<usize>,
        /// Per-attempt timeout in seconds (overrides scheduler.toml).
        #[arg(long)]
        timeout_secs: Option<u64>,
    },
    /// List goals.
    List {
        /// Filter by status (pending, active, completed, failed, cancelled).
        #[arg(long)]
        status: Option<String>,
    },
    /// Show a goal and its subgoals.
    Status {
        /// Goal ID.
        id: String,
    },
    /// Cancel a goal. Running subgoals are stopped by the next `ta goal run`.
    Cancel {
        /// Goal ID.
        id: String,
    },
    /// Move a finished goal to the archive.
    Archive {
        /// Goal ID.
        id: String,
    },
}

/// A goal written by hand: the subgoals are given, not decomposed.
#[derive(Debug, Deserialize)]
struct PlanFile {
    description: String,
    #[serde(default)]
    metadata: BTreeMap<String, serde_json::Value>,
    #[serde(default)]
    subgoals: Vec<PlanStep>,
}

#[derive(Debug, Deserialize)]
struct PlanStep {
    id: String,
    #[serde(default)]
    description: Option<String>,
    /// Shell command run by `ta goal run`.
    #[serde(default)]
    command: Option<String>,
    #[serde(default)]
    dependencies: Vec<String>,
    #[serde(default)]
    required_capabilities: Vec<String>,
    #[serde(default)]
    estimated_duration_secs: Option<u64>,
    #[serde(default)]
    priority: i32,
}

impl PlanStep {
    fn into_spec(self) -> SubGoalSpec {
        let description = self
            .description
            .or_else(|| self.command.clone())
            .unwrap_or_else(|| self.id.clone());
        let mut spec = SubGoalSpec::new(self.id, description)
            .depends_on(self.dependencies)
            .with_priority(self.priority);
        spec.required_capabilities = self.required_capabilities;
        spec.estimated_duration_secs = self.estimated_duration_secs;
        if let Some(command) = self.command {
            spec.metadata.insert("command".to_string(), command);
        }
        spec
    }
}

pub fn execute(cmd: &GoalCommands, paths: &ProjectPaths) -> anyhow::Result<()> {
    match cmd {
        GoalCommands::Submit { plan } => {
            let record = submit_plan(paths, plan)?;
            let order = record.graph()?.topological_order().join(" -> ");
            println!("Goal submitted: {}", record.id());
            println!("  Description: {}", record.goal.description);
            println!("  Subgoals:    {}", record.subgoals.len());
            println!("  Order:       {}", order);
            Ok(())
        }
        GoalCommands::Run {
            concurrency,
            timeout_secs,
        } => {
            let report = run_scheduler(paths, *concurrency, *timeout_secs)?;
            println!(
                "Scheduler idle: {} dispatched, {} completion(s) applied.",
                report.dispatched, report.completions
            );
            println!();
            list_goals(paths, None)
        }
        GoalCommands::List { status } => list_goals(paths, status.as_deref()),
        GoalCommands::Status { id } => show_status(paths, id),
        GoalCommands::Cancel { id } => {
            let record = service(paths)?.cancel(parse_id(id)?)?;
            let running = record.ids_with_status(SubGoalStatus::Running);
            println!("Goal cancelled: {}", record.id());
            if !running.is_empty() {
                println!("  Still running: {}", running.join(", "));
            }
            Ok(())
        }
        GoalCommands::Archive { id } => {
            let record = service(paths)?.archive(parse_id(id)?)?;
            println!("Goal archived: {} ({})", record.goal.description, record.id());
            Ok(())
        }
    }
}

fn service(paths: &ProjectPaths) -> anyhow::Result<GoalService> {
    Ok(GoalService::new(
        Arc::new(paths.open_store()?),
        Arc::new(StaticOracle::default()),
        Arc::new(paths.events()),
    ))
}

fn parse_id(id: &str) -> anyhow::Result<uuid::Uuid> {
    uuid::Uuid::parse_str(id).with_context(|| format!("invalid goal ID: {}", id))
}

fn submit_plan(paths: &ProjectPaths, plan_path: &Path) -> anyhow::Result<GoalRecord> {
    let content = std::fs::read_to_string(plan_path)
        .with_context(|| format!("failed to read plan {}", plan_path.display()))?;
    let plan: PlanFile = toml::from_str(&content)
        .with_context(|| format!("failed to parse plan {}", plan_path.display()))?;

    let specs = plan.subgoals.into_iter().map(PlanStep::into_spec).collect();
    let service = GoalService::new(
        Arc::new(paths.open_store()?),
        Arc::new(StaticOracle::new(specs)),
        Arc::new(paths.events()),
    );

    let rt = tokio::runtime::Runtime::new()?;
    let record = rt.block_on(service.submit(&plan.description, plan.metadata))?;
    Ok(record)
}

fn run_scheduler(
    paths: &ProjectPaths,
    concurrency: Option<usize>,
    timeout_secs: Option<u64>,
) -> anyhow::Result<TickReport> {
    let mut config = paths.load_scheduler_config();
    if let Some(n) = concurrency {
        config.scheduler.max_concurrent = n;
    }
    if let Some(secs) = timeout_secs {
        config.scheduler.execution_timeout_ms = secs.saturating_mul(1000);
    }
    config.validate()?;

    let store = Arc::new(paths.open_store()?);
    let allocator = Arc::new(config.allocator());
    let executor = Arc::new(CommandExecutor::new(&paths.root));
    let mut scheduler = Scheduler::new(store, executor, allocator, config, Arc::new(paths.events()));

    let rt = tokio::runtime::Runtime::new()?;
    rt.block_on(drive(&mut scheduler))
}

async fn drive(scheduler: &mut Scheduler) -> anyhow::Result<TickReport> {
    let recovery = scheduler.recover()?;
    if recovery.requeued + recovery.failed + recovery.cancelled > 0 {
        println!(
            "Recovered interrupted subgoals: {} requeued, {} failed, {} cancelled.",
            recovery.requeued, recovery.failed, recovery.cancelled
        );
    }

    tokio::select! {
        report = scheduler.run_until_idle() => Ok(report?),
        _ = tokio::signal::ctrl_c() => {
            eprintln!("Interrupted. Running subgoals will be recovered by the next `ta goal run`.");
            Ok(TickReport::default())
        }
    }
}

fn list_goals(paths: &ProjectPaths, status: Option<&str>) -> anyhow::Result<()> {
    let status = status
        .map(|s| s.parse::<GoalStatus>().map_err(anyhow::Error::msg))
        .transpose()?;
    let goals = service(paths)?.list_goals(status);

    if goals.is_empty() {
        println!("No goals found.");
        return Ok(());
    }

    println!(
        "{:<38} {:<30} {:<10} {:<8}",
        "ID", "DESCRIPTION", "STATUS", "DONE"
    );
    println!("{}", "-".repeat(88));

    for g in &goals {
        let done = g.ids_with_status(SubGoalStatus::Completed).len();
        println!(
            "{:<38} {:<30} {:<10} {:<8}",
            g.id(),
            truncate(&g.goal.description, 28),
            g.status().to_string(),
            format!("{}/{}", done, g.subgoals.len()),
        );
    }
    println!("\n{} goal(s) total.", goals.len());

    Ok(())
}

fn show_status(paths: &ProjectPaths, id: &str) -> anyhow::Result<()> {
    let g = service(paths)?.goal_status(parse_id(id)?)?;

    println!("Goal:        {}", g.id());
    println!("Description: {}", g.goal.description);
    println!("Status:      {}", g.status());
    println!("Created:     {}", g.goal.created_at.to_rfc3339());
    println!("Updated:     {}", g.goal.updated_at.to_rfc3339());
    if g.goal.cancel_requested {
        println!("Cancel:      requested");
    }
    if let Some(ref failure) = g.goal.failure {
        println!(
            "Failure:     subgoal '{}': {}",
            failure.subgoal_id, failure.last_error
        );
    }

    println!();
    println!(
        "{:<20} {:<10} {:<8} {:<20} {}",
        "SUBGOAL", "STATUS", "ATTEMPTS", "DEPENDS ON", "LAST ERROR"
    );
    println!("{}", "-".repeat(88));
    for s in &g.subgoals {
        println!(
            "{:<20} {:<10} {:<8} {:<20} {}",
            truncate(&s.id, 18),
            s.status.to_string(),
            s.attempt_count,
            truncate(&s.dependencies.join(","), 18),
            s.last_error.as_deref().unwrap_or("-"),
        );
    }

    Ok(())
}

fn truncate(s: &str, max: usize) -> String {
    if s.chars().count() > max {
        let head: String = s.chars().take(max.saturating_sub(3)).collect();
        format!("{}...", head)
    } else {
        s.to_string()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn write_plan(dir: &Path, body: &str) -> std::path::PathBuf {
        let path = dir.join("plan.toml");
        std::fs::write(&path, body).unwrap();
        path
    }

    const PIPELINE: &str = r#"
description = "Build and check"

[metadata]
owner = "ci"

[[subgoals]]
id = "build"
command = "echo built > artifact.txt"
estimated_duration_secs = 30

[[subgoals]]
id = "check"
description = "Verify the artifact exists"
command = "test -f artifact.txt && echo ok"
dependencies = ["build"]
"#;

    #[test]
    fn submit_stores_plan_as_goal() {
        let project = TempDir::new().unwrap();
        let paths = ProjectPaths::for_project(project.path());
        let plan = write_plan(project.path(), PIPELINE);

        let record = submit_plan(&paths, &plan).unwrap();
        assert_eq!(record.subgoals.len(), 2);
        assert_eq!(record.goal.metadata["owner"], "ci");

        let build = record.subgoal("build").unwrap();
        assert_eq!(build.description, "echo built > artifact.txt");
        assert_eq!(build.metadata["command"], "echo built > artifact.txt");
        assert_eq!(build.estimated_duration_secs, Some(30));
        assert_eq!(record.subgoal("check").unwrap().dependencies, vec!["build"]);

        let goals = paths.open_store().unwrap().list();
        assert_eq!(goals.len(), 1);
        assert_eq!(goals[0].status(), GoalStatus::Pending);
        assert!(paths.events_log.exists());
    }

    #[test]
    fn submit_rejects_cyclic_plan() {
        let project = TempDir::new().unwrap();
        let paths = ProjectPaths::for_project(project.path());
        let plan = write_plan(
            project.path(),
            r#"
description = "Loop"

[[subgoals]]
id = "a"
dependencies = ["b"]

[[subgoals]]
id = "b"
dependencies = ["a"]
"#,
        );

        let err = submit_plan(&paths, &plan).unwrap_err();
        assert!(err.to_string().contains("circular"));
        assert!(paths.open_store().unwrap().list().is_empty());
    }

    #[cfg(unix)]
    #[test]
    fn run_executes_plan_to_completion() {
        let project = TempDir::new().unwrap();
        let paths = ProjectPaths::for_project(project.path());
        let plan = write_plan(project.path(), PIPELINE);
        let goal_id = submit_plan(&paths, &plan).unwrap().id();

        let report = run_scheduler(&paths, Some(1), Some(30)).unwrap();
        assert_eq!(report.dispatched, 2);

        let record = paths.open_store().unwrap().get(goal_id).unwrap();
        assert_eq!(record.status(), GoalStatus::Completed);
        assert_eq!(
            record.subgoal("check").unwrap().result.as_ref().unwrap()["stdout"],
            "ok"
        );
        assert!(project.path().join("artifact.txt").exists());
    }

    #[test]
    fn cancel_then_archive() {
        let project = TempDir::new().unwrap();
        let paths = ProjectPaths::for_project(project.path());
        let plan = write_plan(project.path(), PIPELINE);
        let goal_id = submit_plan(&paths, &plan).unwrap().id();

        let id = goal_id.to_string();
        execute(&GoalCommands::Cancel { id: id.clone() }, &paths).unwrap();
        execute(&GoalCommands::Archive { id: id.clone() }, &paths).unwrap();

        let store = paths.open_store().unwrap();
        assert!(store.get(goal_id).is_none());
        assert!(execute(&GoalCommands::Status { id }, &paths).is_err());
    }

    #[test]
    fn run_rejects_zero_concurrency() {
        let project = TempDir::new().unwrap();
        let paths = ProjectPaths::for_project(project.path());
        assert!(run_scheduler(&paths, Some(0), None).is_err());
    }

    #[test]
    fn truncate_respects_char_boundaries() {
        assert_eq!(truncate("short", 10), "short");
        assert_eq!(truncate("ééééééééééé", 6), "ééé...");
    }
}
