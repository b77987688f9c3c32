// executor.rs — Runs subgoals as shell commands.
//
// The command comes from the subgoal's `command` metadata, falling back to
// its description. It runs with `sh -c` in the project root. stdout becomes
// the subgoal's output; a non-zero exit is a failed attempt. Cancellation
// kills the child process.

use std::path::{Path, PathBuf};
use std::process::Stdio;

use async_trait::async_trait;
use ta_goal::SubGoal;
use ta_scheduler::{ExecutionContext, ExecutionError, ExecutionResult, Executor};

/// Exit status `sh` uses when the command does not exist.
const EXIT_NOT_FOUND: i32 = 127;
/// Exit status `sh` uses when the command is not executable.
const EXIT_NOT_EXECUTABLE: i32 = 126;

pub struct CommandExecutor {
    workdir: PathBuf,
}

impl CommandExecutor {
    pub fn new(workdir: &Path) -> Self {
        Self {
            workdir: workdir.to_path_buf(),
        }
    }

    fn command_for(subgoal: &SubGoal) -> &str {
        subgoal
            .metadata
            .get("command")
            .map(String::as_str)
            .unwrap_or(subgoal.description.as_str())
    }
}

#[async_trait]
impl Executor for CommandExecutor {
    async fn execute(
        &self,
        subgoal: &SubGoal,
        mut ctx: ExecutionContext,
    ) -> Result<ExecutionResult, ExecutionError> {
        let command = Self::command_for(subgoal);
        tracing::debug!(
            goal_id = %ctx.goal_id,
            subgoal_id = %subgoal.id,
            attempt = ctx.attempt,
            command,
            "spawning command"
        );

        let child = tokio::process::Command::new("sh")
            .arg("-c")
            .arg(command)
            .current_dir(&self.workdir)
            .env("TA_GOAL_ID", ctx.goal_id.to_string())
            .env("TA_SUBGOAL_ID", &subgoal.id)
            .env("TA_ATTEMPT", ctx.attempt.to_string())
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| ExecutionError::Resource(format!("failed to spawn sh: {}", e)))?;

        // Dropping the wait future drops the child, which kills it.
        let waited = tokio::select! {
            output = child.wait_with_output() => output,
            _ = ctx.cancel.cancelled() => return Err(ExecutionError::Cancelled),
        };
        let output = waited
            .map_err(|e| ExecutionError::Resource(format!("failed to wait for command: {}", e)))?;

        let stdout = String::from_utf8_lossy(&output.stdout).trim_end().to_string();
        let stderr = String::from_utf8_lossy(&output.stderr).trim_end().to_string();

        match output.status.code() {
            Some(0) => Ok(ExecutionResult::success(serde_json::json!({
                "command": command,
                "stdout": stdout,
            }))),
            Some(code @ (EXIT_NOT_FOUND | EXIT_NOT_EXECUTABLE)) => Err(ExecutionError::Validation(
                format!("command cannot run (exit {}): {}", code, last_line(&stderr)),
            )),
            Some(code) => Ok(ExecutionResult::failure(format!(
                "exit status {}: {}",
                code,
                last_line(&stderr)
            ))),
            None => Ok(ExecutionResult::failure("terminated by signal")),
        }
    }
}

fn last_line(text: &str) -> &str {
    text.lines().last().unwrap_or("")
}

#[cfg(all(test, unix))]
mod tests {
    use std::collections::BTreeMap;
    use std::time::Duration;

    use ta_goal::{GoalRecord, SubGoalSpec};
    use ta_scheduler::CancelSignal;
    use tempfile::TempDir;

    use super::*;

    fn subgoal(command: &str) -> SubGoal {
        let mut spec = SubGoalSpec::new("step", "a shell step");
        spec.metadata.insert("command".into(), command.into());
        GoalRecord::new("g", BTreeMap::new(), vec![spec])
            .unwrap()
            .subgoals
            .remove(0)
    }

    fn ctx(cancel: CancelSignal) -> ExecutionContext {
        ExecutionContext {
            goal_id: uuid::Uuid::new_v4(),
            attempt: 1,
            cancel,
        }
    }

    #[tokio::test]
    async fn successful_command_returns_stdout() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(dir.path());
        let result = executor
            .execute(&subgoal("echo hello"), ctx(CancelSignal::never()))
            .await
            .unwrap();
        assert!(result.success);
        assert_eq!(result.output["stdout"], "hello");
    }

    #[tokio::test]
    async fn command_sees_subgoal_environment() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(dir.path());
        let result = executor
            .execute(
                &subgoal("echo $TA_SUBGOAL_ID-$TA_ATTEMPT"),
                ctx(CancelSignal::never()),
            )
            .await
            .unwrap();
        assert_eq!(result.output["stdout"], "step-1");
    }

    #[tokio::test]
    async fn non_zero_exit_is_a_failed_attempt() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(dir.path());
        let result = executor
            .execute(&subgoal("echo boom >&2; exit 3"), ctx(CancelSignal::never()))
            .await
            .unwrap();
        assert!(!result.success);
        assert_eq!(result.error.as_deref(), Some("exit status 3: boom"));
    }

    #[tokio::test]
    async fn missing_command_is_not_retryable() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(dir.path());
        let err = executor
            .execute(
                &subgoal("definitely-not-a-real-command-xyz"),
                ctx(CancelSignal::never()),
            )
            .await
            .unwrap_err();
        assert!(matches!(err, ExecutionError::Validation(_)));
    }

    #[tokio::test]
    async fn cancellation_kills_the_command() {
        let dir = TempDir::new().unwrap();
        let executor = CommandExecutor::new(dir.path());
        let (tx, rx) = tokio::sync::watch::channel(false);

        let run = tokio::spawn(async move {
            executor
                .execute(&subgoal("sleep 30"), ctx(CancelSignal::new(rx)))
                .await
        });
        tokio::time::sleep(Duration::from_millis(50)).await;
        tx.send_replace(true);

        let outcome = tokio::time::timeout(Duration::from_secs(5), run)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(outcome, Err(ExecutionError::Cancelled));
    }
}
