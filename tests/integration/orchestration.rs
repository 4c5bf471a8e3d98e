//! End-to-end tests for the orchestrator over in-memory collaborators.
//!
//! Workers are in-process fakes; the tracker, VCS host and check runner are
//! the memory adapters, so every scenario runs without network or git.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use serde_json::json;
use tempfile::TempDir;

use taskgate::breaker::{BreakerConfig, BreakerError, BreakerRegistry, RetryPolicy};
use taskgate::dispatch::{Worker, WorkerContext, WorkerDispatcher, WorkerError, WorkerOutput};
use taskgate::hooks::{EventHookDispatcher, HookOutcome, HookPolicy};
use taskgate::limiter::{ConcurrencyLimiter, LimitsConfig};
use taskgate::orchestrator::AssignmentOutcome;
use taskgate::ports::memory::{MemoryTracker, MemoryVcs, ScriptedCheckRunner};
use taskgate::ports::{Fields, PortError, TaskTracker};
use taskgate::state::TaskStateMachine;
use taskgate::store::{EvidenceStore, StateLog};
use taskgate::timeout::TimeoutConfig;
use taskgate::verify::VerificationEngine;
use taskgate::{
    Assignment, ClaimedArtifact, OutcomeCode, Orchestrator, SelfReportedStatus, Task, TaskState, WorkerKind,
};

/// Records start/end events and claims a tracker record named after the task.
#[derive(Default)]
struct TracingWorker {
    events: Mutex<Vec<String>>,
}

impl TracingWorker {
    fn events(&self) -> Vec<String> {
        self.events.lock().expect("events").clone()
    }

    fn position(&self, event: &str) -> usize {
        self.events()
            .iter()
            .position(|e| e == event)
            .unwrap_or_else(|| panic!("missing event {}", event))
    }
}

#[async_trait]
impl Worker for TracingWorker {
    async fn run(&self, assignment: &Assignment, _ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
        self.events
            .lock()
            .expect("events")
            .push(format!("start {}", assignment.task_id));
        tokio::time::sleep(Duration::from_millis(20)).await;
        self.events
            .lock()
            .expect("events")
            .push(format!("end {}", assignment.task_id));
        Ok(WorkerOutput::success().with_artifact(ClaimedArtifact::RecordCreated {
            record_id: format!("rec-{}", assignment.task_id),
        }))
    }
}

/// Never finishes on its own.
struct StuckWorker;

#[async_trait]
impl Worker for StuckWorker {
    async fn run(&self, _assignment: &Assignment, _ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
        tokio::time::sleep(Duration::from_secs(3600)).await;
        Ok(WorkerOutput::success())
    }
}

struct Harness {
    dir: TempDir,
    tracker: Arc<MemoryTracker>,
    breakers: Arc<BreakerRegistry>,
}

impl Harness {
    fn new() -> Self {
        Self::with_breakers(BreakerRegistry::new(BreakerConfig::default()))
    }

    fn with_breakers(breakers: BreakerRegistry) -> Self {
        Self {
            dir: TempDir::new().expect("temp dir"),
            tracker: Arc::new(MemoryTracker::new()),
            breakers: Arc::new(breakers),
        }
    }

    fn open_state(&self) -> Arc<TaskStateMachine> {
        let log = StateLog::open(self.dir.path().join("state")).expect("log");
        Arc::new(TaskStateMachine::open(log).expect("state"))
    }

    fn evidence(&self) -> EvidenceStore {
        EvidenceStore::new(self.dir.path().join("evidence")).expect("evidence")
    }

    fn orchestrator(&self, worker: Arc<dyn Worker>) -> Orchestrator {
        let verifier = VerificationEngine::new(
            self.tracker.clone(),
            Arc::new(MemoryVcs::new()),
            Arc::new(ScriptedCheckRunner::passing()),
            Arc::clone(&self.breakers),
        )
        .with_retry(RetryPolicy::default().with_max_attempts(1))
        .with_evidence_store(self.evidence());
        let dispatcher = WorkerDispatcher::new(
            Arc::new(ConcurrencyLimiter::new(LimitsConfig::default())),
            TimeoutConfig::default(),
        )
        .with_worker(WorkerKind::Planning, worker);
        Orchestrator::new(self.open_state(), dispatcher, verifier, HookPolicy::default())
    }

    fn record(&self, task_id: &str) {
        let mut fields = Fields::new();
        fields.insert("task_id".into(), json!(task_id));
        self.tracker.insert(format!("rec-{}", task_id), fields);
    }
}

async fn add_tasks(orchestrator: &Orchestrator, ids: &[&str]) {
    for id in ids {
        orchestrator
            .add_task(Task::new(*id, format!("task {}", id)))
            .await
            .expect("add task");
    }
}

#[tokio::test]
async fn test_overlapping_writes_split_into_sequential_sub_batches() {
    let harness = Harness::new();
    let worker = Arc::new(TracingWorker::default());
    let orchestrator = harness.orchestrator(worker.clone());
    add_tasks(&orchestrator, &["A", "B", "C"]).await;
    for id in ["A", "B", "C"] {
        harness.record(id);
    }

    let report = orchestrator
        .submit(vec![
            Assignment::new("A", WorkerKind::Planning).with_write("src/utils"),
            Assignment::new("B", WorkerKind::Planning).with_write("src/parser.rs"),
            Assignment::new("C", WorkerKind::Planning).with_write("src/utils/"),
        ])
        .await
        .expect("submit");

    assert_eq!(report.outcome, OutcomeCode::Success);
    assert_eq!(
        report.sub_batches,
        vec![vec!["A".to_string(), "B".to_string()], vec!["C".to_string()]]
    );
    assert_eq!(report.batch_ids.len(), 2);
    assert!(worker.position("start C") > worker.position("end A"));
    assert!(worker.position("start C") > worker.position("end B"));
    for id in ["A", "B", "C"] {
        let line = report.report_for(id).expect("line");
        assert_eq!(line.outcome, AssignmentOutcome::Applied);
        let task = orchestrator.state().get(id).await.expect("task");
        assert_eq!(task.state, TaskState::ReadyForDesign);
        assert!(task.locked_resources.is_empty());
    }
}

#[tokio::test]
async fn test_priority_orders_sub_batch_placement() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(Arc::new(TracingWorker::default()));
    orchestrator
        .add_task(Task::new("LOW", "later").with_priority(5))
        .await
        .expect("add");
    orchestrator
        .add_task(Task::new("HIGH", "urgent").with_priority(1))
        .await
        .expect("add");
    harness.record("LOW");
    harness.record("HIGH");

    let report = orchestrator
        .submit(vec![
            Assignment::new("LOW", WorkerKind::Planning).with_write("docs/plan.md"),
            Assignment::new("HIGH", WorkerKind::Planning).with_write("docs/plan.md"),
        ])
        .await
        .expect("submit");
    assert_eq!(
        report.sub_batches,
        vec![vec!["HIGH".to_string()], vec!["LOW".to_string()]]
    );
}

#[tokio::test(start_paused = true)]
async fn test_open_tracker_breaker_makes_no_calls_and_defers_the_batch() {
    let harness = Harness::with_breakers(BreakerRegistry::new(
        BreakerConfig::default().with_failure_threshold(5),
    ));
    let worker = Arc::new(TracingWorker::default());
    let orchestrator = harness.orchestrator(worker.clone());
    add_tasks(&orchestrator, &["T-1"]).await;

    harness.tracker.fail_next(
        PortError::Timeout {
            operation: "query_record".to_string(),
            after: Duration::from_secs(5),
        },
        5,
    );
    for _ in 0..5 {
        let tracker = harness.tracker.clone();
        let result = harness
            .breakers
            .execute("tracker-api", || async move { tracker.query_record("rec-T-1").await })
            .await;
        assert!(matches!(result, Err(BreakerError::Inner(_))));
    }
    assert!(harness.breakers.is_open("tracker-api"));
    assert_eq!(harness.tracker.calls(), 5);

    let tracker = harness.tracker.clone();
    let sixth = harness
        .breakers
        .execute("tracker-api", || async move { tracker.query_record("rec-T-1").await })
        .await;
    assert!(matches!(sixth, Err(BreakerError::Open(_))));
    assert_eq!(harness.tracker.calls(), 5);

    let report = orchestrator
        .submit(vec![Assignment::new("T-1", WorkerKind::Planning)])
        .await
        .expect("submit");
    assert_eq!(report.outcome, OutcomeCode::BreakerOpen);
    assert_eq!(report.outcome.exit_code(), 3);
    assert_eq!(report.open_breakers, vec!["tracker-api".to_string()]);
    assert_eq!(report.assignments[0].outcome, AssignmentOutcome::Deferred);
    assert!(worker.events().is_empty());
    assert_eq!(harness.tracker.calls(), 5);
    assert_eq!(
        orchestrator.state().get("T-1").await.expect("task").state,
        TaskState::Backlog
    );
}

#[tokio::test]
async fn test_redelivered_completion_applies_once() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(Arc::new(TracingWorker::default()));
    add_tasks(&orchestrator, &["T-1"]).await;
    harness.record("T-1");

    let report = orchestrator
        .submit(vec![Assignment::new("T-1", WorkerKind::Planning)])
        .await
        .expect("submit");
    assert_eq!(report.assignments[0].outcome, AssignmentOutcome::Applied);

    let archived = harness
        .evidence()
        .latest_for_task("T-1")
        .expect("evidence")
        .expect("record");
    for _ in 0..3 {
        let outcome = orchestrator
            .hooks()
            .on_invocation_complete(&archived.invocation, &archived.verification)
            .await
            .expect("hook");
        assert_eq!(outcome, HookOutcome::AlreadyApplied);
    }

    let task = orchestrator.state().get("T-1").await.expect("task");
    let applied = task
        .history
        .iter()
        .filter(|t| t.invocation_id.as_deref() == Some(archived.invocation.invocation_id.as_str()))
        .count();
    assert_eq!(applied, 1);
    assert_eq!(task.state, TaskState::ReadyForDesign);
}

#[tokio::test]
async fn test_replay_after_restart_keeps_states_and_rejects_redelivery() {
    let harness = Harness::new();
    let (invocation, verification, history) = {
        let orchestrator = harness.orchestrator(Arc::new(TracingWorker::default()));
        add_tasks(&orchestrator, &["T-1", "T-2"]).await;
        harness.record("T-1");
        orchestrator
            .submit(vec![Assignment::new("T-1", WorkerKind::Planning)])
            .await
            .expect("submit");
        orchestrator.state().hold("T-2", "waiting for design input").await.expect("hold");

        let archived = harness
            .evidence()
            .latest_for_task("T-1")
            .expect("evidence")
            .expect("record");
        let history = orchestrator.state().get("T-1").await.expect("task").history;
        (archived.invocation, archived.verification, history)
    };

    let state = harness.open_state();
    let t1 = state.get("T-1").await.expect("T-1");
    assert_eq!(t1.state, TaskState::ReadyForDesign);
    assert_eq!(t1.history, history);
    assert_eq!(state.get("T-2").await.expect("T-2").state, TaskState::OnHold);

    let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());
    let outcome = hooks
        .on_invocation_complete(&invocation, &verification)
        .await
        .expect("hook");
    assert_eq!(outcome, HookOutcome::AlreadyApplied);
    assert_eq!(state.get("T-1").await.expect("T-1").history.len(), history.len());
}

#[tokio::test]
async fn test_cancel_batch_releases_every_lock() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(Arc::new(StuckWorker));
    add_tasks(&orchestrator, &["T-1", "T-2"]).await;

    let canceller = async {
        loop {
            if let Some(batch_id) = orchestrator.active_batches().pop() {
                for id in ["T-1", "T-2"] {
                    let task = orchestrator.state().get(id).await.expect("task");
                    assert!(task.is_in_flight());
                }
                assert!(orchestrator.cancel_batch(&batch_id).await);
                return batch_id;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
    };
    let (report, cancelled) = tokio::join!(
        orchestrator.submit(vec![
            Assignment::new("T-1", WorkerKind::Planning).with_write("src/a.rs"),
            Assignment::new("T-2", WorkerKind::Planning).with_write("src/b.rs"),
        ]),
        canceller
    );
    let report = report.expect("submit");

    assert_eq!(report.batch_ids, vec![cancelled]);
    assert!(orchestrator.active_batches().is_empty());
    for line in &report.assignments {
        assert_eq!(line.self_reported_status, Some(SelfReportedStatus::Cancelled));
        assert!(!line.verified);
    }
    for id in ["T-1", "T-2"] {
        let task = orchestrator.state().get(id).await.expect("task");
        assert_eq!(task.state, TaskState::Backlog);
        assert!(!task.is_in_flight());
    }
}

#[tokio::test]
async fn test_session_end_reports_blocked_and_pending() {
    let harness = Harness::new();
    let orchestrator = harness.orchestrator(Arc::new(TracingWorker::default()));
    add_tasks(&orchestrator, &["T-1", "T-2", "T-3"]).await;
    harness.record("T-1");
    orchestrator
        .submit(vec![Assignment::new("T-1", WorkerKind::Planning)])
        .await
        .expect("submit");
    orchestrator.state().block("T-2", "needs credentials").await.expect("block");

    let report = orchestrator.session_end().await;
    assert!(report.message.contains("blocked T-2: needs credentials"));
    assert!(report.message.contains("T-3"));
}
