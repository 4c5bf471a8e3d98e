use std::sync::Arc;

use tracing::info;

use super::Orchestrator;
use crate::config::{ConfigError, EngineConfig};
use crate::dispatch::{CommandWorker, WorkerDispatcher};
use crate::error::EngineResult;
use crate::limiter::ConcurrencyLimiter;
use crate::model::WorkerKind;
use crate::ports::{CommandCheckRunner, FileTracker, GitHost, TaskTracker};
use crate::state::{TaskStateMachine, TrackerMirror};
use crate::store::{EvidenceStore, StateLog};
use crate::verify::VerificationEngine;

impl Orchestrator {
    /// Build an engine backed by the concrete adapters: a file tracker under
    /// the state dir, `git`/`gh` for the workspace, the configured checks
    /// command and one [`CommandWorker`] per worker profile.
    pub fn from_config(config: &EngineConfig) -> EngineResult<Self> {
        config.validate()?;
        let timeout = config.timeouts.command_timeout;
        let breakers = Arc::new(config.breaker_registry());

        let tracker: Arc<dyn TaskTracker> = Arc::new(FileTracker::new(config.tracker_dir())?);
        let vcs = Arc::new(GitHost::new(&config.workspace_root, timeout)?);
        let checks = Arc::new(CommandCheckRunner::new(
            config.checks_command.clone().unwrap_or_default(),
            &config.workspace_root,
            timeout,
        ));

        let mirror = TrackerMirror::new(
            Arc::clone(&tracker),
            Arc::clone(&breakers),
            config.verification.tracker_resource.clone(),
            timeout,
        );
        let state = Arc::new(TaskStateMachine::open(StateLog::open(config.log_dir())?)?.with_mirror(mirror));

        let verifier = VerificationEngine::new(tracker, vcs, checks, breakers)
            .with_retry(config.retry.clone())
            .with_command_timeout(timeout)
            .with_workspace_root(&config.workspace_root)
            .with_evidence_store(EvidenceStore::new(config.evidence_dir())?)
            .with_config(config.verification.clone());

        let limiter = Arc::new(ConcurrencyLimiter::new(config.limits.clone()));
        let mut dispatcher = WorkerDispatcher::new(limiter, config.timeouts.clone());
        let mut destructive = Vec::new();
        for (key, profile) in &config.workers {
            let kind: WorkerKind = key
                .parse()
                .map_err(|e: String| ConfigError::Invalid(format!("workers.{}: {}", key, e)))?;
            dispatcher = dispatcher.with_worker(
                kind,
                Arc::new(CommandWorker::new(profile.command.clone(), &config.workspace_root)),
            );
            if let Some(timeout) = profile.timeout() {
                dispatcher = dispatcher.with_worker_timeout(kind, timeout);
            }
            if profile.destructive {
                destructive.push(kind);
            }
        }

        info!(
            state_dir = %config.state_dir.display(),
            workers = config.workers.len(),
            max_concurrency = config.limits.max_concurrency,
            "Engine ready"
        );

        Ok(destructive.into_iter().fold(
            Orchestrator::new(state, dispatcher, verifier, config.hook_policy())
                .with_conflict_policy(config.conflict_policy)
                .with_max_attempts(config.retry.max_attempts)
                .with_stale_after(config.timeouts.stale_after),
            Orchestrator::with_destructive_kind,
        ))
    }
}
