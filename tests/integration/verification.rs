//! Ground-truth verification against in-memory collaborators, including the
//! state machine's refusal to move tasks on unverified work.

use std::sync::Arc;
use std::time::Duration;

use chrono::Utc;
use serde_json::{json, Value};
use tempfile::TempDir;

use taskgate::breaker::{BreakerConfig, BreakerRegistry, RetryPolicy};
use taskgate::model::Expectations;
use taskgate::ports::memory::{MemoryTracker, MemoryVcs, ScriptedCheckRunner};
use taskgate::ports::{Fields, PortError};
use taskgate::state::{StateError, TaskStateMachine};
use taskgate::store::{EvidenceStore, StateLog};
use taskgate::verify::VerificationEngine;
use taskgate::{
    ClaimedArtifact, ResourceClaim, SelfReportedStatus, Task, TaskState, WorkerInvocation, WorkerKind,
};

struct Ground {
    dir: TempDir,
    tracker: Arc<MemoryTracker>,
    vcs: Arc<MemoryVcs>,
    breakers: Arc<BreakerRegistry>,
}

impl Ground {
    fn new() -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            tracker: Arc::new(MemoryTracker::new()),
            vcs: Arc::new(MemoryVcs::new()),
            breakers: Arc::new(BreakerRegistry::new(
                BreakerConfig::default().with_failure_threshold(2),
            )),
        }
    }

    fn evidence(&self) -> EvidenceStore {
        EvidenceStore::new(self.dir.path().join("evidence")).expect("evidence")
    }

    fn engine(&self) -> VerificationEngine {
        VerificationEngine::new(
            self.tracker.clone(),
            self.vcs.clone(),
            Arc::new(ScriptedCheckRunner::passing()),
            Arc::clone(&self.breakers),
        )
        .with_retry(RetryPolicy::default().with_max_attempts(1))
        .with_workspace_root(self.dir.path())
        .with_evidence_store(self.evidence())
    }

    fn record(&self, id: &str, task_id: &str) {
        let mut fields = Fields::new();
        fields.insert("task_id".into(), json!(task_id));
        self.tracker.insert(id, fields);
    }

    fn state(&self) -> TaskStateMachine {
        TaskStateMachine::open(StateLog::open(self.dir.path().join("state")).expect("log")).expect("state")
    }
}

fn invocation(kind: WorkerKind, artifacts: Vec<ClaimedArtifact>) -> WorkerInvocation {
    WorkerInvocation {
        invocation_id: "batch-1-001".to_string(),
        batch_id: "batch-1".to_string(),
        task_id: "T-1".to_string(),
        worker_kind: kind,
        input_resources: Vec::new(),
        external_resources: Vec::new(),
        expectations: Expectations {
            target: Some("unit".to_string()),
            ..Expectations::default()
        },
        started_at: Utc::now(),
        completed_at: Utc::now(),
        self_reported_status: SelfReportedStatus::Success,
        claimed_artifacts: artifacts,
        output: Value::Null,
        error: None,
    }
}

#[tokio::test]
async fn test_missing_commit_is_not_verified_and_task_stays_put() {
    let ground = Ground::new();
    ground.record("rec-1", "T-1");
    let state = ground.state();
    state.add_task(Task::new("T-1", "ship it")).await.expect("add");
    let before = state.get("T-1").await.expect("task");

    let mut deploy = invocation(
        WorkerKind::Deploy,
        vec![
            ClaimedArtifact::CommitCreated {
                reference: "abc123".to_string(),
            },
            ClaimedArtifact::RecordCreated {
                record_id: "rec-1".to_string(),
            },
        ],
    );
    deploy.input_resources = vec![ResourceClaim::write("deploy/prod")];
    let result = ground.engine().verify(&deploy).await;

    assert!(!result.is_verified());
    let failing = result.failing_checks();
    let (_, commit) = failing
        .iter()
        .find(|(name, _)| *name == "artifact:commit:abc123")
        .expect("commit check");
    assert!(commit.evidence.contains("abc123"));
    assert!(failing.iter().any(|(name, _)| *name == "commit_exists"));

    let err = state
        .apply_transition("T-1", TaskState::ReadyForDesign, &result)
        .await
        .expect_err("unverified");
    assert!(matches!(err, StateError::Unverified { .. }));
    assert_eq!(state.get("T-1").await.expect("task"), before);
}

#[tokio::test]
async fn test_every_kind_refuses_an_empty_claim() {
    let ground = Ground::new();
    let engine = ground.engine();
    for kind in WorkerKind::ALL {
        let result = engine.verify(&invocation(kind, Vec::new())).await;
        assert!(!result.is_verified(), "{} verified without artifacts", kind);
        assert!(!result.failing_checks().is_empty());
    }
}

#[tokio::test]
async fn test_self_reported_status_never_changes_the_verdict() {
    let ground = Ground::new();
    ground.record("rec-1", "T-1");
    let engine = ground.engine();
    let claims = vec![ClaimedArtifact::RecordCreated {
        record_id: "rec-1".to_string(),
    }];

    let mut verdicts = Vec::new();
    for status in [
        SelfReportedStatus::Success,
        SelfReportedStatus::Failure,
        SelfReportedStatus::Timeout,
        SelfReportedStatus::Error,
    ] {
        let mut planning = invocation(WorkerKind::Planning, claims.clone());
        planning.self_reported_status = status;
        let result = engine.verify(&planning).await;
        verdicts.push((result.is_verified(), result.checks));
    }
    assert!(verdicts[0].0);
    assert!(verdicts.iter().all(|v| *v == verdicts[0]));
}

#[tokio::test]
async fn test_verdict_is_archived_under_its_evidence_ref() {
    let ground = Ground::new();
    ground.record("rec-1", "T-1");
    let planning = invocation(
        WorkerKind::Planning,
        vec![ClaimedArtifact::RecordCreated {
            record_id: "rec-1".to_string(),
        }],
    );
    let result = ground.engine().verify(&planning).await;
    assert!(result.is_verified());

    let evidence_ref = result.evidence_ref();
    assert!(evidence_ref.starts_with("batch-1-001#"));
    let archived = ground
        .evidence()
        .load(&evidence_ref)
        .expect("load")
        .expect("archived");
    assert_eq!(archived.verification, result);
    assert_eq!(archived.invocation, planning);

    let state = ground.state();
    state.add_task(Task::new("T-1", "plan")).await.expect("add");
    let transition = state
        .apply_transition("T-1", TaskState::ReadyForDesign, &result)
        .await
        .expect("apply");
    assert_eq!(transition.evidence_ref.as_deref(), Some(evidence_ref.as_str()));
}

#[tokio::test(start_paused = true)]
async fn test_open_breaker_fails_checks_without_calling_the_tracker() {
    let ground = Ground::new();
    ground.record("rec-1", "T-1");
    ground.tracker.fail_next(PortError::Unavailable("503".to_string()), 2);
    let engine = ground.engine();
    let planning = invocation(
        WorkerKind::Planning,
        vec![ClaimedArtifact::RecordCreated {
            record_id: "rec-1".to_string(),
        }],
    );

    let first = engine.verify(&planning).await;
    assert!(!first.is_verified());
    let second = engine.verify(&planning).await;
    assert!(!second.is_verified());
    assert!(ground.breakers.is_open("tracker-api"));
    let calls = ground.tracker.calls();

    let third = engine.verify(&planning).await;
    assert!(!third.is_verified());
    assert_eq!(ground.tracker.calls(), calls);
    assert!(third
        .failing_checks()
        .iter()
        .any(|(_, outcome)| outcome.evidence.contains("open")));

    tokio::time::advance(Duration::from_secs(31)).await;
    let recovered = engine.verify(&planning).await;
    assert!(recovered.is_verified());
}
