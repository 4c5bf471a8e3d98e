//! Ground-truth verification of worker invocations.
//!
//! The [`VerificationEngine`] re-derives every check from the external
//! collaborators; nothing the worker reports about itself is taken at face
//! value and `self_reported_status` is never read. Calls to guarded services
//! go through the breaker registry with retries and a per-call deadline, and
//! any collaborator error fails the check it was needed for.

mod checks;

use std::collections::BTreeMap;
use std::future::Future;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::breaker::{call_with_retry, BreakerRegistry, RetryPolicy};
use crate::model::{CheckOutcome, VerificationResult, WorkerInvocation};
use crate::ports::{CheckRunner, PortError, PortResult, TaskTracker, VcsHost};
use crate::store::EvidenceStore;

/// Name of the check added when the verdict could not be archived.
pub const EVIDENCE_ARCHIVED_CHECK: &str = "evidence_archived";

/// Which breaker guards which collaborator, plus verification defaults.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct VerificationConfig {
    /// Breaker resource id for the task tracker.
    /// Default: "tracker-api"
    pub tracker_resource: String,
    /// Breaker resource id for the version-control host.
    /// Default: "vcs-host"
    pub vcs_resource: String,
    /// Breaker resource id for the CI runner.
    /// Default: "ci-runner"
    pub ci_resource: String,
    /// Check target used when an assignment does not name one.
    /// Default: none
    #[serde(skip_serializing_if = "Option::is_none")]
    pub default_check_target: Option<String>,
}

impl Default for VerificationConfig {
    fn default() -> Self {
        Self {
            tracker_resource: "tracker-api".to_string(),
            vcs_resource: "vcs-host".to_string(),
            ci_resource: "ci-runner".to_string(),
            default_check_target: None,
        }
    }
}

impl VerificationConfig {
    pub fn with_default_check_target(mut self, target: impl Into<String>) -> Self {
        self.default_check_target = Some(target.into());
        self
    }

    /// Every breaker resource id verification may call.
    pub fn resources(&self) -> [&str; 3] {
        [
            self.tracker_resource.as_str(),
            self.vcs_resource.as_str(),
            self.ci_resource.as_str(),
        ]
    }
}

/// Produces [`VerificationResult`]s from independent evidence.
pub struct VerificationEngine {
    tracker: Arc<dyn TaskTracker>,
    vcs: Arc<dyn VcsHost>,
    checks: Arc<dyn CheckRunner>,
    breakers: Arc<BreakerRegistry>,
    retry: RetryPolicy,
    command_timeout: Duration,
    workspace_root: PathBuf,
    evidence: Option<EvidenceStore>,
    config: VerificationConfig,
}

impl VerificationEngine {
    pub fn new(
        tracker: Arc<dyn TaskTracker>,
        vcs: Arc<dyn VcsHost>,
        checks: Arc<dyn CheckRunner>,
        breakers: Arc<BreakerRegistry>,
    ) -> Self {
        Self {
            tracker,
            vcs,
            checks,
            breakers,
            retry: RetryPolicy::default(),
            command_timeout: Duration::from_secs(60),
            workspace_root: PathBuf::from("."),
            evidence: None,
            config: VerificationConfig::default(),
        }
    }

    pub fn with_retry(mut self, retry: RetryPolicy) -> Self {
        self.retry = retry;
        self
    }

    /// Deadline for each individual collaborator call.
    pub fn with_command_timeout(mut self, timeout: Duration) -> Self {
        self.command_timeout = timeout;
        self
    }

    /// Directory claimed file paths are resolved against.
    pub fn with_workspace_root(mut self, root: impl Into<PathBuf>) -> Self {
        self.workspace_root = root.into();
        self
    }

    pub fn with_evidence_store(mut self, store: EvidenceStore) -> Self {
        self.evidence = Some(store);
        self
    }

    pub fn with_config(mut self, config: VerificationConfig) -> Self {
        self.config = config;
        self
    }

    pub fn config(&self) -> &VerificationConfig {
        &self.config
    }

    pub fn evidence_store(&self) -> Option<&EvidenceStore> {
        self.evidence.as_ref()
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        &self.breakers
    }

    /// Verify one invocation and archive the verdict.
    ///
    /// Invocations that timed out, errored or were cancelled are verified the
    /// same way; whatever they left behind is judged on its own.
    pub async fn verify(&self, invocation: &WorkerInvocation) -> VerificationResult {
        let mut outcomes: BTreeMap<String, CheckOutcome> = BTreeMap::new();
        let mut records = checks::RecordCache::default();

        for kind in invocation.worker_kind.required_checks() {
            let outcome = self.run_check(*kind, invocation, &mut records).await;
            outcomes.insert(kind.name().to_string(), outcome);
        }
        for artifact in &invocation.claimed_artifacts {
            let outcome = self.check_artifact(artifact, invocation, &mut records).await;
            outcomes.insert(artifact.check_key(), outcome);
        }
        outcomes.insert(
            crate::model::CheckKind::NoUnexpectedChanges.name().to_string(),
            checks::no_unexpected_changes(invocation),
        );

        let mut result = VerificationResult::from_checks(
            &invocation.invocation_id,
            &invocation.task_id,
            invocation.worker_kind,
            outcomes,
        );

        if let Some(store) = &self.evidence {
            if let Err(err) = store.save(invocation, &result) {
                warn!(
                    invocation_id = %invocation.invocation_id,
                    error = %err,
                    "Failed to archive verification evidence"
                );
                result = result.with_check(
                    EVIDENCE_ARCHIVED_CHECK,
                    CheckOutcome::fail(format!("evidence could not be archived: {}", err)),
                );
            }
        }

        if result.is_verified() {
            info!(
                invocation_id = %invocation.invocation_id,
                task_id = %invocation.task_id,
                checks = result.checks.len(),
                "Invocation verified"
            );
        } else {
            warn!(
                invocation_id = %invocation.invocation_id,
                task_id = %invocation.task_id,
                summary = %result.summary(),
                "Invocation failed verification"
            );
        }
        result
    }

    /// Call a guarded collaborator: breaker, retries, and a deadline per attempt.
    ///
    /// Errors come back as evidence text naming the resource.
    async fn guarded<T, F, Fut>(&self, resource: &str, operation: &str, mut op: F) -> Result<T, String>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = PortResult<T>>,
    {
        let breaker = self.breakers.get(resource);
        let timeout = self.command_timeout;
        call_with_retry(&breaker, &self.retry, || {
            let call = op();
            let operation = operation.to_string();
            async move {
                match tokio::time::timeout(timeout, call).await {
                    Ok(result) => result,
                    Err(_) => Err(PortError::Timeout { operation, after: timeout }),
                }
            }
        })
        .await
        .map_err(|err| format!("{} error: {}", resource, err))
    }
}
