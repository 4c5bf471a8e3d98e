use std::path::PathBuf;
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;
use serde::Deserialize;
use tracing::warn;

use super::{run_program, PortError, PortResult, PrState, PullRequest, VcsHost};

/// Version-control host read through the `git` and `gh` command line tools.
#[derive(Debug)]
pub struct GitHost {
    repo_dir: PathBuf,
    git_program: String,
    gh_program: String,
    timeout: Duration,
    ref_pattern: Regex,
}

#[derive(Debug, Deserialize)]
struct GhPullRequest {
    number: u64,
    url: String,
    state: String,
}

impl GitHost {
    pub fn new(repo_dir: impl Into<PathBuf>, timeout: Duration) -> PortResult<Self> {
        let ref_pattern = Regex::new(r"^[A-Za-z0-9][A-Za-z0-9._/@^~+-]*$")
            .map_err(|err| PortError::InvalidInput(err.to_string()))?;
        Ok(Self {
            repo_dir: repo_dir.into(),
            git_program: "git".to_string(),
            gh_program: "gh".to_string(),
            timeout,
            ref_pattern,
        })
    }

    /// Use different executables, e.g. wrappers or absolute paths.
    pub fn with_programs(mut self, git: impl Into<String>, gh: impl Into<String>) -> Self {
        self.git_program = git.into();
        self.gh_program = gh.into();
        self
    }

    fn validate_ref(&self, reference: &str) -> PortResult<()> {
        if self.ref_pattern.is_match(reference) && !reference.contains("..") {
            Ok(())
        } else {
            Err(PortError::InvalidInput(format!(
                "refusing suspicious git reference '{}'",
                reference
            )))
        }
    }

    async fn git(&self, args: &[&str]) -> PortResult<std::process::Output> {
        run_program(&self.git_program, args, &self.repo_dir, self.timeout).await
    }
}

#[async_trait]
impl VcsHost for GitHost {
    async fn branch_exists(&self, name: &str) -> PortResult<bool> {
        self.validate_ref(name)?;
        for candidate in [format!("refs/heads/{}", name), format!("refs/remotes/origin/{}", name)] {
            let output = self
                .git(&["show-ref", "--verify", "--quiet", candidate.as_str()])
                .await?;
            match output.status.code() {
                Some(0) => return Ok(true),
                Some(1) => continue,
                _ => {
                    let stderr = String::from_utf8_lossy(&output.stderr);
                    return Err(PortError::from_message(stderr.trim()));
                }
            }
        }
        Ok(false)
    }

    async fn commit_exists(&self, reference: &str) -> PortResult<bool> {
        self.validate_ref(reference)?;
        let object = format!("{}^{{commit}}", reference);
        let output = self.git(&["cat-file", "-e", object.as_str()]).await?;
        if output.status.success() {
            return Ok(true);
        }

        let stderr = String::from_utf8_lossy(&output.stderr).to_lowercase();
        if stderr.contains("not a git repository") {
            warn!(dir = %self.repo_dir.display(), "Commit lookup outside a git repository");
            return Err(PortError::InvalidInput(stderr.trim().to_string()));
        }
        // cat-file exits non-zero for unknown or non-commit objects.
        Ok(false)
    }

    async fn pr_exists(&self, number: u64) -> PortResult<Option<PullRequest>> {
        let number_arg = number.to_string();
        let output = run_program(
            &self.gh_program,
            &["pr", "view", number_arg.as_str(), "--json", "number,url,state"],
            &self.repo_dir,
            self.timeout,
        )
        .await?;

        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            let lower = stderr.to_lowercase();
            if lower.contains("no pull requests found") || lower.contains("could not resolve") {
                return Ok(None);
            }
            return Err(PortError::from_message(stderr.trim()));
        }

        let parsed: GhPullRequest = serde_json::from_slice(&output.stdout)
            .map_err(|err| PortError::InvalidInput(format!("unexpected gh output: {}", err)))?;
        let state = parsed
            .state
            .parse::<PrState>()
            .map_err(PortError::InvalidInput)?;
        Ok(Some(PullRequest {
            number: parsed.number,
            url: parsed.url,
            state,
        }))
    }
}
