use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use tracing::info;

use super::{run_program, tail, CheckRun, CheckRunner, PortError, PortResult};

const MAX_EVIDENCE_BYTES: usize = 8_000;

/// Re-runs checks through a configured shell command.
///
/// `{target}` in the template is replaced by the single-quoted target, e.g.
/// `cargo test --package {target}`.
#[derive(Debug, Clone)]
pub struct CommandCheckRunner {
    template: String,
    working_dir: PathBuf,
    timeout: Duration,
}

impl CommandCheckRunner {
    pub fn new(template: impl Into<String>, working_dir: impl Into<PathBuf>, timeout: Duration) -> Self {
        Self {
            template: template.into(),
            working_dir: working_dir.into(),
            timeout,
        }
    }

    /// The shell command line for `target`.
    pub fn command_for(&self, target: &str) -> String {
        self.template.replace("{target}", &shell_quote(target))
    }
}

/// Quote for POSIX `sh`: wrap in single quotes, escaping embedded ones.
fn shell_quote(value: &str) -> String {
    format!("'{}'", value.replace('\'', r"'\''"))
}

#[async_trait]
impl CheckRunner for CommandCheckRunner {
    async fn run_checks(&self, target: &str) -> PortResult<CheckRun> {
        if self.template.trim().is_empty() {
            return Err(PortError::InvalidInput(
                "no checks command configured".to_string(),
            ));
        }
        let command = self.command_for(target);
        info!(target, command = %command, "Re-running automated checks");

        let output = run_program("sh", &["-c", command.as_str()], &self.working_dir, self.timeout).await?;
        let stdout = String::from_utf8_lossy(&output.stdout);
        let stderr = String::from_utf8_lossy(&output.stderr);
        let combined = if stderr.trim().is_empty() {
            stdout.to_string()
        } else {
            format!("{}\n--- stderr ---\n{}", stdout, stderr)
        };

        Ok(CheckRun {
            // Killed by a signal: report as a failure.
            exit_code: output.status.code().unwrap_or(-1),
            output: tail(&combined, MAX_EVIDENCE_BYTES),
        })
    }
}
