//! # ta-cli
//!
//! Command-line interface for the Trusted Autonomy goal engine.
//!
//! - `ta goal submit <plan.toml>` — validate a hand-written plan and store it as a goal
//! - `ta goal run` — dispatch ready subgoals until every goal is finished
//! - `ta goal list/status` — inspect goals and their subgoals
//! - `ta goal cancel/archive` — stop a goal, retire a finished one

mod commands;
mod executor;
mod project;

use std::path::PathBuf;

use clap::{Parser, Subcommand};
use tracing_subscriber::EnvFilter;

use project::ProjectPaths;

/// Trusted Autonomy CLI — submit and drive goals.
#[derive(Parser)]
#[command(name = "ta", version, about)]
struct Cli {
    /// Project root directory (defaults to current directory).
    #[arg(long, default_value = ".")]
    project_root: PathBuf,

    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Submit, run, and inspect goals.
    Goal {
        #[command(subcommand)]
        command: commands::goal::GoalCommands,
    },
}

fn main() -> anyhow::Result<()> {
    // Logs go to stderr so they don't interfere with command output on stdout.
    tracing_subscriber::fmt()
        .with_env_filter(
            EnvFilter::from_default_env()
                .add_directive("ta_scheduler=info".parse()?)
                .add_directive("ta_goal=warn".parse()?),
        )
        .with_writer(std::io::stderr)
        .with_ansi(false)
        .init();

    let cli = Cli::parse();
    let project_root = cli.project_root.canonicalize().unwrap_or(cli.project_root);
    let paths = ProjectPaths::for_project(&project_root);

    match &cli.command {
        Commands::Goal { command } => commands::goal::execute(command, &paths),
    }
}
