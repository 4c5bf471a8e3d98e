//! Driver-facing operations over the whole engine.
//!
//! [`Orchestrator::submit`] runs the full data flow for one batch: conflict
//! split, breaker gate, bounded dispatch, verification, then completion hooks.
//! Sub-batch B+1 never starts before every invocation of sub-batch B has been
//! verified and handed to the hooks.

mod bootstrap;

use std::collections::{BTreeSet, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::join_all;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::breaker::{BreakerRegistry, BreakerSnapshot};
use crate::conflict::{ConflictDetector, ConflictError, ConflictPolicy, ResourceConflict};
use crate::dispatch::{BatchHandle, WorkerDispatcher};
use crate::error::{EngineError, EngineResult};
use crate::hooks::{EventHookDispatcher, HookOutcome, HookPolicy, Suggestion};
use crate::model::{
    Assignment, SelfReportedStatus, Task, TaskState, VerificationResult, WorkerInvocation, WorkerKind,
};
use crate::state::{ProgressReport, StateError, TaskStateMachine};
use crate::verify::VerificationEngine;

/// Machine-readable result of a driver operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum OutcomeCode {
    Success,
    /// The batch was rejected because assignments overlap.
    Conflict,
    /// A guarded service is unavailable; try again later.
    BreakerOpen,
    VerificationFailed,
    Error,
}

impl OutcomeCode {
    /// Process exit code used by the CLI.
    pub fn exit_code(self) -> i32 {
        match self {
            OutcomeCode::Success => 0,
            OutcomeCode::Error => 1,
            OutcomeCode::Conflict => 2,
            OutcomeCode::BreakerOpen => 3,
            OutcomeCode::VerificationFailed => 4,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            OutcomeCode::Success => "success",
            OutcomeCode::Conflict => "conflict",
            OutcomeCode::BreakerOpen => "breaker_open",
            OutcomeCode::VerificationFailed => "verification_failed",
            OutcomeCode::Error => "error",
        }
    }
}

/// What happened to one assignment of a submitted batch.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AssignmentOutcome {
    /// Verified and the task moved.
    Applied,
    /// Verified, but the same invocation had already moved the task.
    AlreadyApplied,
    /// Verified, left for a person to apply or review.
    Suggested,
    /// Verification failed; the task did not move.
    Unverified,
    /// Verification failed too many times in a row; the task is now blocked.
    Blocked,
    /// Not dispatched: the task cannot take work right now.
    Skipped,
    /// Not dispatched: a breaker opened or the batch was cancelled first.
    Deferred,
}

/// Per-assignment line of a [`BatchReport`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AssignmentReport {
    pub task_id: String,
    pub worker_kind: WorkerKind,
    /// Index of the sub-batch the assignment was placed in.
    pub sub_batch: usize,
    pub outcome: AssignmentOutcome,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub self_reported_status: Option<SelfReportedStatus>,
    pub verified: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub failing_checks: Vec<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
    /// Task state once the assignment was handled.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state: Option<TaskState>,
}

impl AssignmentReport {
    fn pending(assignment: &Assignment, sub_batch: usize, outcome: AssignmentOutcome, message: String) -> Self {
        Self {
            task_id: assignment.task_id.clone(),
            worker_kind: assignment.worker_kind,
            sub_batch,
            outcome,
            invocation_id: None,
            self_reported_status: None,
            verified: false,
            evidence_ref: None,
            failing_checks: Vec::new(),
            message: Some(message),
            state: None,
        }
    }

    fn verified(invocation: &WorkerInvocation, sub_batch: usize, verification: &VerificationResult) -> Self {
        Self {
            task_id: invocation.task_id.clone(),
            worker_kind: invocation.worker_kind,
            sub_batch,
            outcome: AssignmentOutcome::Unverified,
            invocation_id: Some(invocation.invocation_id.clone()),
            self_reported_status: Some(invocation.self_reported_status),
            verified: verification.is_verified(),
            evidence_ref: Some(verification.evidence_ref()),
            failing_checks: verification
                .failing_checks()
                .into_iter()
                .map(|(name, _)| name.to_string())
                .collect(),
            message: None,
            state: None,
        }
    }
}

/// Result of [`Orchestrator::submit`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BatchReport {
    pub outcome: OutcomeCode,
    /// Task ids per sub-batch, in execution order.
    pub sub_batches: Vec<Vec<String>>,
    /// Dispatcher batch id per executed sub-batch.
    pub batch_ids: Vec<String>,
    pub assignments: Vec<AssignmentReport>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub conflicts: Vec<ResourceConflict>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub open_breakers: Vec<String>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

impl BatchReport {
    fn empty(outcome: OutcomeCode) -> Self {
        Self {
            outcome,
            sub_batches: Vec::new(),
            batch_ids: Vec::new(),
            assignments: Vec::new(),
            conflicts: Vec::new(),
            open_breakers: Vec::new(),
            suggestions: Vec::new(),
        }
    }

    pub fn report_for(&self, task_id: &str) -> Option<&AssignmentReport> {
        self.assignments.iter().find(|a| a.task_id == task_id)
    }
}

/// Result of [`Orchestrator::status`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StatusReport {
    pub tasks: Vec<Task>,
    pub progress: ProgressReport,
    pub breakers: Vec<BreakerSnapshot>,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub suggestions: Vec<Suggestion>,
}

/// Result of [`Orchestrator::reverify`].
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReverifyReport {
    pub outcome: OutcomeCode,
    pub verification: VerificationResult,
    pub assignment: AssignmentReport,
}

/// A dispatched sub-batch that can still be cancelled.
struct ActiveBatch {
    handle: BatchHandle,
    task_ids: Vec<String>,
}

/// Wires conflict detection, dispatch, verification, state and hooks together.
pub struct Orchestrator {
    detector: ConflictDetector,
    dispatcher: WorkerDispatcher,
    verifier: VerificationEngine,
    state: Arc<TaskStateMachine>,
    hooks: EventHookDispatcher,
    max_attempts: u32,
    stale_after: Duration,
    destructive_kinds: HashSet<WorkerKind>,
    failure_streaks: Mutex<HashMap<String, u32>>,
    active: Mutex<HashMap<String, ActiveBatch>>,
}

impl Orchestrator {
    pub fn new(
        state: Arc<TaskStateMachine>,
        dispatcher: WorkerDispatcher,
        verifier: VerificationEngine,
        policy: HookPolicy,
    ) -> Self {
        let hooks = EventHookDispatcher::new(Arc::clone(&state), policy);
        Self {
            detector: ConflictDetector::default(),
            dispatcher,
            verifier,
            state,
            hooks,
            max_attempts: 3,
            stale_after: Duration::from_secs(2 * 60 * 60),
            destructive_kinds: HashSet::new(),
            failure_streaks: Mutex::new(HashMap::new()),
            active: Mutex::new(HashMap::new()),
        }
    }

    pub fn with_conflict_policy(mut self, policy: ConflictPolicy) -> Self {
        self.detector = ConflictDetector::new(policy);
        self
    }

    /// Consecutive failed verifications after which a task is blocked.
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts.max(1);
        self
    }

    pub fn with_stale_after(mut self, threshold: Duration) -> Self {
        self.stale_after = threshold;
        self
    }

    /// Treat every assignment of `kind` as destructive.
    pub fn with_destructive_kind(mut self, kind: WorkerKind) -> Self {
        self.destructive_kinds.insert(kind);
        self
    }

    pub fn state(&self) -> &Arc<TaskStateMachine> {
        &self.state
    }

    pub fn hooks(&self) -> &EventHookDispatcher {
        &self.hooks
    }

    pub fn breakers(&self) -> &Arc<BreakerRegistry> {
        self.verifier.breakers()
    }

    pub async fn add_task(&self, task: Task) -> EngineResult<Task> {
        Ok(self.state.add_task(task).await?)
    }

    /// Run one batch of assignments end to end.
    ///
    /// Verification failures, conflicts and open breakers are reported in the
    /// returned [`BatchReport`]; only infrastructure failures are errors.
    pub async fn submit(&self, assignments: Vec<Assignment>) -> EngineResult<BatchReport> {
        if assignments.is_empty() {
            return Ok(BatchReport::empty(OutcomeCode::Success));
        }

        let mut ordered = Vec::with_capacity(assignments.len());
        for mut assignment in assignments {
            let task = self
                .state
                .get(&assignment.task_id)
                .await
                .ok_or_else(|| StateError::UnknownTask(assignment.task_id.clone()))?;
            if self.destructive_kinds.contains(&assignment.worker_kind) {
                assignment.destructive = true;
            }
            ordered.push((task.priority, assignment));
        }
        // Stable: equal priorities keep input order.
        ordered.sort_by_key(|(priority, _)| *priority);
        let ordered: Vec<Assignment> = ordered.into_iter().map(|(_, a)| a).collect();

        let sub_batches = match self.detector.check_batch(&ordered) {
            Ok(sub_batches) => sub_batches,
            Err(ConflictError::Rejected { conflicts }) => {
                warn!(conflicts = conflicts.len(), "Batch rejected due to write conflicts");
                let mut report = BatchReport::empty(OutcomeCode::Conflict);
                report.conflicts = conflicts;
                return Ok(report);
            }
            Err(err) => return Err(err.into()),
        };

        let mut report = BatchReport::empty(OutcomeCode::Success);
        report.sub_batches = sub_batches
            .iter()
            .map(|batch| batch.iter().map(|a| a.task_id.clone()).collect())
            .collect();

        let mut breaker_open = false;
        let mut cancelled = false;
        for (index, batch) in sub_batches.into_iter().enumerate() {
            if breaker_open || cancelled {
                let reason = if cancelled { "batch cancelled" } else { "circuit breaker open" };
                report.assignments.extend(
                    batch
                        .iter()
                        .map(|a| AssignmentReport::pending(a, index, AssignmentOutcome::Deferred, reason.to_string())),
                );
                continue;
            }

            let open = self.open_breakers(
                batch
                    .iter()
                    .flat_map(|a| a.external_resources.iter().map(String::as_str)),
            );
            if !open.is_empty() {
                warn!(sub_batch = index, breakers = ?open, "Not dispatching: circuit breaker open");
                breaker_open = true;
                report.open_breakers = open;
                report.assignments.extend(batch.iter().map(|a| {
                    AssignmentReport::pending(a, index, AssignmentOutcome::Deferred, "circuit breaker open".to_string())
                }));
                continue;
            }

            cancelled = self.run_sub_batch(index, batch, &mut report).await?;
        }

        report.outcome = if breaker_open {
            OutcomeCode::BreakerOpen
        } else if report
            .assignments
            .iter()
            .any(|a| matches!(a.outcome, AssignmentOutcome::Unverified | AssignmentOutcome::Blocked))
        {
            OutcomeCode::VerificationFailed
        } else {
            OutcomeCode::Success
        };
        report.suggestions = self.hooks.suggestions();
        info!(
            outcome = report.outcome.as_label(),
            sub_batches = report.sub_batches.len(),
            assignments = report.assignments.len(),
            "Batch finished"
        );
        Ok(report)
    }

    /// Dispatch, verify and hand off one conflict-free sub-batch.
    /// Returns whether it was cancelled.
    async fn run_sub_batch(
        &self,
        index: usize,
        batch: Vec<Assignment>,
        report: &mut BatchReport,
    ) -> EngineResult<bool> {
        let mut runnable = Vec::with_capacity(batch.len());
        for assignment in batch {
            if let Some(reason) = self.skip_reason(&assignment).await {
                info!(task_id = %assignment.task_id, reason = %reason, "Skipping assignment");
                report
                    .assignments
                    .push(AssignmentReport::pending(&assignment, index, AssignmentOutcome::Skipped, reason));
                continue;
            }
            let writes: Vec<String> = assignment.write_set().map(String::from).collect();
            match self.state.lock_resources(&assignment.task_id, &writes).await {
                Ok(()) => runnable.push(assignment),
                Err(StateError::ResourceBusy { resource, holder }) => {
                    report.assignments.push(AssignmentReport::pending(
                        &assignment,
                        index,
                        AssignmentOutcome::Skipped,
                        format!("resource '{}' is held by in-flight task '{}'", resource, holder),
                    ));
                }
                Err(err) => {
                    self.release(runnable.iter().map(|a| a.task_id.as_str())).await;
                    return Err(err.into());
                }
            }
        }
        if runnable.is_empty() {
            return Ok(false);
        }

        let handle = self.dispatcher.new_batch();
        let task_ids: Vec<String> = runnable.iter().map(|a| a.task_id.clone()).collect();
        self.lock_active().insert(
            handle.batch_id().to_string(),
            ActiveBatch {
                handle: handle.clone(),
                task_ids: task_ids.clone(),
            },
        );
        report.batch_ids.push(handle.batch_id().to_string());

        let invocations = self.dispatcher.dispatch(&handle, runnable).await;
        self.lock_active().remove(handle.batch_id());

        // Locks stay held until every verdict has been handed to the hooks.
        let completed = self.verify_all(index, &invocations, report).await;
        self.release(task_ids.iter().map(String::as_str)).await;
        completed?;
        Ok(handle.is_cancelled())
    }

    /// Verify a sub-batch concurrently, then hand verdicts to the hooks in dispatch order.
    async fn verify_all(
        &self,
        index: usize,
        invocations: &[WorkerInvocation],
        report: &mut BatchReport,
    ) -> EngineResult<()> {
        let verdicts = join_all(invocations.iter().map(|inv| self.verifier.verify(inv))).await;
        for (invocation, verification) in invocations.iter().zip(verdicts) {
            let line = self.complete(index, invocation, &verification).await?;
            report.assignments.push(line);
        }
        Ok(())
    }

    async fn skip_reason(&self, assignment: &Assignment) -> Option<String> {
        let task = self.state.get(&assignment.task_id).await?;
        match task.state {
            TaskState::Done => Some("task is DONE".to_string()),
            TaskState::Blocked => Some(format!(
                "task is blocked: {}",
                task.blockers.last().map(|b| b.reason.as_str()).unwrap_or("no reason recorded")
            )),
            TaskState::OnHold => Some("task is on hold".to_string()),
            _ => None,
        }
    }

    /// Hand one verified invocation to the hooks and track failure streaks.
    async fn complete(
        &self,
        index: usize,
        invocation: &WorkerInvocation,
        verification: &VerificationResult,
    ) -> EngineResult<AssignmentReport> {
        let mut line = AssignmentReport::verified(invocation, index, verification);

        let outcome = self.hooks.on_invocation_complete(invocation, verification).await?;
        line.outcome = match outcome {
            HookOutcome::Applied(_) => AssignmentOutcome::Applied,
            HookOutcome::AlreadyApplied => AssignmentOutcome::AlreadyApplied,
            HookOutcome::Suggested(suggestion) => {
                line.message = Some(suggestion.message);
                if verification.is_verified() {
                    AssignmentOutcome::Suggested
                } else {
                    AssignmentOutcome::Unverified
                }
            }
        };

        if verification.is_verified() {
            self.lock_streaks().remove(&invocation.task_id);
        } else if counts_as_attempt(invocation.self_reported_status) && self.record_failure(&invocation.task_id) {
            let reason = format!(
                "verification failed {} times in a row; last failing checks: {}",
                self.max_attempts,
                line.failing_checks.join(", ")
            );
            match self.state.block(&invocation.task_id, &reason).await {
                Ok(_) => {
                    warn!(task_id = %invocation.task_id, attempts = self.max_attempts, "Blocked task after repeated verification failures");
                    line.outcome = AssignmentOutcome::Blocked;
                    line.message = Some(reason);
                }
                Err(err) => warn!(task_id = %invocation.task_id, error = %err, "Could not block task"),
            }
        }

        line.state = self.state.get(&invocation.task_id).await.map(|t| t.state);
        Ok(line)
    }

    /// Count a failed verification; true once the streak reaches the cap.
    fn record_failure(&self, task_id: &str) -> bool {
        let mut streaks = self.lock_streaks();
        let streak = streaks.entry(task_id.to_string()).or_insert(0);
        *streak += 1;
        if *streak >= self.max_attempts {
            streaks.remove(task_id);
            true
        } else {
            false
        }
    }

    /// Guarded resources this sub-batch depends on whose breaker is open.
    fn open_breakers<'a>(&'a self, external: impl IntoIterator<Item = &'a str>) -> Vec<String> {
        let breakers = self.verifier.breakers();
        let resources: BTreeSet<&str> = external
            .into_iter()
            .chain(self.verifier.config().resources())
            .collect();
        resources
            .into_iter()
            .filter(|resource| breakers.is_open(resource))
            .map(String::from)
            .collect()
    }

    /// Cancel a running sub-batch and release its locks in one step.
    pub async fn cancel_batch(&self, batch_id: &str) -> bool {
        let Some(active) = self.lock_active().remove(batch_id) else {
            return false;
        };
        active.handle.cancel();
        self.release(active.task_ids.iter().map(String::as_str)).await;
        info!(batch_id, tasks = active.task_ids.len(), "Cancelled batch");
        true
    }

    /// Ids of sub-batches currently being dispatched.
    pub fn active_batches(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.lock_active().keys().cloned().collect();
        ids.sort();
        ids
    }

    /// Re-run verification for the latest archived invocation of a task and
    /// apply it if it now passes.
    pub async fn reverify(&self, task_id: &str) -> EngineResult<ReverifyReport> {
        if self.state.get(task_id).await.is_none() {
            return Err(StateError::UnknownTask(task_id.to_string()).into());
        }
        let store = self
            .verifier
            .evidence_store()
            .ok_or_else(|| EngineError::NothingToVerify(task_id.to_string()))?;
        let record = store
            .latest_for_task(task_id)?
            .ok_or_else(|| EngineError::NothingToVerify(task_id.to_string()))?;

        info!(task_id, invocation_id = %record.invocation.invocation_id, "Re-verifying archived invocation");
        let open = self.open_breakers(record.invocation.external_resources.iter().map(String::as_str));
        let verification = self.verifier.verify(&record.invocation).await;
        let assignment = self.complete(0, &record.invocation, &verification).await?;

        let outcome = if !open.is_empty() {
            OutcomeCode::BreakerOpen
        } else if assignment.verified {
            OutcomeCode::Success
        } else {
            OutcomeCode::VerificationFailed
        };
        Ok(ReverifyReport {
            outcome,
            verification,
            assignment,
        })
    }

    /// Snapshot of the backlog, optionally narrowed to one task.
    pub async fn status(&self, task_id: Option<&str>) -> EngineResult<StatusReport> {
        let tasks = match task_id {
            Some(id) => vec![self
                .state
                .get(id)
                .await
                .ok_or_else(|| StateError::UnknownTask(id.to_string()))?],
            None => self.state.list().await,
        };
        Ok(StatusReport {
            tasks,
            progress: self.state.progress().await,
            breakers: self.verifier.breakers().snapshots(),
            suggestions: self.hooks.suggestions(),
        })
    }

    /// Block tasks whose resources have been locked longer than the stale
    /// threshold and free their locks. Returns the blocked task ids.
    pub async fn sweep_stale(&self) -> Vec<String> {
        let mut swept = Vec::new();
        for task in self.state.stale_in_flight(self.stale_after).await {
            let reason = format!(
                "in flight for longer than {}s without finishing",
                self.stale_after.as_secs()
            );
            self.state.release_resources(&task.id).await;
            match self.state.block(&task.id, &reason).await {
                Ok(_) => {
                    warn!(task_id = %task.id, "Blocked stale in-flight task");
                    swept.push(task.id);
                }
                Err(err) => warn!(task_id = %task.id, error = %err, "Could not block stale task"),
            }
        }
        swept
    }

    /// Progress summary for the end of a working session.
    pub async fn session_end(&self) -> Suggestion {
        self.hooks.on_session_end().await
    }

    async fn release<'a>(&self, task_ids: impl IntoIterator<Item = &'a str>) {
        self.state.release_all(task_ids).await;
    }

    fn lock_active(&self) -> std::sync::MutexGuard<'_, HashMap<String, ActiveBatch>> {
        self.active.lock().unwrap_or_else(|p| p.into_inner())
    }

    fn lock_streaks(&self) -> std::sync::MutexGuard<'_, HashMap<String, u32>> {
        self.failure_streaks.lock().unwrap_or_else(|p| p.into_inner())
    }
}

/// Invocations that never really ran do not count toward the attempt cap.
fn counts_as_attempt(status: SelfReportedStatus) -> bool {
    !matches!(
        status,
        SelfReportedStatus::Cancelled | SelfReportedStatus::HeldForReview
    )
}
