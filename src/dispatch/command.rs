use std::path::PathBuf;
use std::process::Stdio;

use async_trait::async_trait;
use tokio::process::Command;
use tracing::debug;

use super::{Worker, WorkerContext, WorkerError, WorkerOutput};
use crate::model::Assignment;
use crate::ports::tail;

const MAX_STDERR_BYTES: usize = 2_000;

/// Runs a shell command for each assignment and reads a JSON [`WorkerOutput`]
/// from its stdout.
///
/// The assignment is passed through the environment:
/// `TASKGATE_TASK_ID`, `TASKGATE_WORKER_KIND`, `TASKGATE_INVOCATION_ID`,
/// `TASKGATE_BATCH_ID` and the full assignment as JSON in `TASKGATE_ASSIGNMENT`.
/// The child is killed if the invocation times out or is cancelled.
#[derive(Debug, Clone)]
pub struct CommandWorker {
    command: String,
    working_dir: PathBuf,
    env: Vec<(String, String)>,
}

impl CommandWorker {
    pub fn new(command: impl Into<String>, working_dir: impl Into<PathBuf>) -> Self {
        Self {
            command: command.into(),
            working_dir: working_dir.into(),
            env: Vec::new(),
        }
    }

    pub fn with_env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.push((key.into(), value.into()));
        self
    }

    pub fn command(&self) -> &str {
        &self.command
    }
}

#[async_trait]
impl Worker for CommandWorker {
    async fn run(&self, assignment: &Assignment, ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
        let assignment_json =
            serde_json::to_string(assignment).map_err(|e| WorkerError::Failed(e.to_string()))?;
        debug!(
            invocation_id = %ctx.invocation_id,
            task_id = %assignment.task_id,
            command = %self.command,
            "Spawning worker command"
        );

        let output = Command::new("sh")
            .arg("-c")
            .arg(&self.command)
            .current_dir(&self.working_dir)
            .envs(self.env.iter().map(|(k, v)| (k.as_str(), v.as_str())))
            .env("TASKGATE_TASK_ID", &assignment.task_id)
            .env("TASKGATE_WORKER_KIND", assignment.worker_kind.as_label())
            .env("TASKGATE_INVOCATION_ID", &ctx.invocation_id)
            .env("TASKGATE_BATCH_ID", &ctx.batch_id)
            .env("TASKGATE_ASSIGNMENT", assignment_json)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .output()
            .await?;

        if !output.status.success() {
            return Err(WorkerError::Exit {
                code: output.status.code().unwrap_or(-1),
                stderr: tail(String::from_utf8_lossy(&output.stderr).trim(), MAX_STDERR_BYTES),
            });
        }

        parse_output(&String::from_utf8_lossy(&output.stdout))
    }
}

/// Accept either a single JSON document or log lines ending in one.
fn parse_output(stdout: &str) -> Result<WorkerOutput, WorkerError> {
    let trimmed = stdout.trim();
    if let Ok(output) = serde_json::from_str(trimmed) {
        return Ok(output);
    }
    let last = trimmed
        .lines()
        .rev()
        .find(|line| !line.trim().is_empty())
        .ok_or_else(|| WorkerError::InvalidOutput("empty stdout".to_string()))?;
    serde_json::from_str(last.trim()).map_err(|e| WorkerError::InvalidOutput(e.to_string()))
}
