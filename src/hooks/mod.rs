//! Reactions to finished invocations and to the end of a session.
//!
//! A [`CompletionHandler`] looks at an invocation and its verdict and either
//! applies the lifecycle transition or leaves a [`Suggestion`] for a human.
//! Re-delivering the same completion never applies a second transition.

use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, info};

use crate::model::{Transition, VerificationResult, WorkerInvocation, WorkerKind};
use crate::state::{StateError, StateResult, TaskStateMachine};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SuggestionKind {
    /// Verification failed; the work needs another pass.
    Rework,
    /// Verified, but a person should approve or untangle the move.
    Review,
    ProgressReport,
}

/// Advice left for the operator.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Suggestion {
    pub kind: SuggestionKind,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub task_id: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    pub message: String,
    pub created_at: DateTime<Utc>,
}

impl Suggestion {
    pub fn for_invocation(kind: SuggestionKind, invocation: &WorkerInvocation, message: impl Into<String>) -> Self {
        Self {
            kind,
            task_id: Some(invocation.task_id.clone()),
            invocation_id: Some(invocation.invocation_id.clone()),
            message: message.into(),
            created_at: Utc::now(),
        }
    }
}

/// What a completion event led to.
#[derive(Debug, Clone, PartialEq)]
pub enum HookOutcome {
    Applied(Transition),
    /// The transition for this invocation was applied by an earlier delivery.
    AlreadyApplied,
    Suggested(Suggestion),
}

/// Which worker kinds may move tasks without a person approving.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct HookPolicy {
    auto_apply: BTreeSet<WorkerKind>,
}

impl Default for HookPolicy {
    /// Every kind except deploy.
    fn default() -> Self {
        Self {
            auto_apply: WorkerKind::ALL
                .into_iter()
                .filter(|kind| *kind != WorkerKind::Deploy)
                .collect(),
        }
    }
}

impl HookPolicy {
    /// A policy that never applies transitions on its own.
    pub fn manual() -> Self {
        Self {
            auto_apply: BTreeSet::new(),
        }
    }

    pub fn with_auto_apply(mut self, kind: WorkerKind, enabled: bool) -> Self {
        if enabled {
            self.auto_apply.insert(kind);
        } else {
            self.auto_apply.remove(&kind);
        }
        self
    }

    pub fn auto_applies(&self, kind: WorkerKind) -> bool {
        self.auto_apply.contains(&kind)
    }
}

/// Decides what to do with one finished invocation.
#[async_trait]
pub trait CompletionHandler: Send + Sync {
    async fn handle(
        &self,
        invocation: &WorkerInvocation,
        verification: &VerificationResult,
        policy: &HookPolicy,
        state: &TaskStateMachine,
    ) -> StateResult<HookOutcome>;
}

/// Default handler: apply verified work where policy allows, suggest otherwise.
#[derive(Debug, Clone, Copy, Default)]
pub struct LifecycleHandler;

#[async_trait]
impl CompletionHandler for LifecycleHandler {
    async fn handle(
        &self,
        invocation: &WorkerInvocation,
        verification: &VerificationResult,
        policy: &HookPolicy,
        state: &TaskStateMachine,
    ) -> StateResult<HookOutcome> {
        if !verification.is_verified() {
            let failing: Vec<String> = verification
                .failing_checks()
                .into_iter()
                .map(|(name, check)| format!("{} ({})", name, first_line(&check.evidence)))
                .collect();
            let message = if failing.is_empty() {
                "rework needed: no required checks were performed".to_string()
            } else {
                format!("rework needed: {}", failing.join("; "))
            };
            return Ok(HookOutcome::Suggested(Suggestion::for_invocation(
                SuggestionKind::Rework,
                invocation,
                message,
            )));
        }

        let to_state = invocation.target_state();
        if !policy.auto_applies(invocation.worker_kind) {
            return Ok(HookOutcome::Suggested(Suggestion::for_invocation(
                SuggestionKind::Review,
                invocation,
                format!(
                    "verified {} work is awaiting approval to move to {}",
                    invocation.worker_kind, to_state
                ),
            )));
        }

        match state.apply_transition(&invocation.task_id, to_state, verification).await {
            Ok(transition) => Ok(HookOutcome::Applied(transition)),
            Err(StateError::DuplicateInvocation { .. }) => Ok(HookOutcome::AlreadyApplied),
            Err(err @ (StateError::InvalidTransition { .. } | StateError::TerminalState(_))) => {
                Ok(HookOutcome::Suggested(Suggestion::for_invocation(
                    SuggestionKind::Review,
                    invocation,
                    format!("verified work could not be applied: {}", err),
                )))
            }
            Err(err) => Err(err),
        }
    }
}

/// Routes completion events to per-kind handlers and keeps the suggestion list.
pub struct EventHookDispatcher {
    state: Arc<TaskStateMachine>,
    policy: HookPolicy,
    handlers: HashMap<WorkerKind, Arc<dyn CompletionHandler>>,
    fallback: Arc<dyn CompletionHandler>,
    suggestions: Mutex<Vec<Suggestion>>,
}

impl EventHookDispatcher {
    pub fn new(state: Arc<TaskStateMachine>, policy: HookPolicy) -> Self {
        Self {
            state,
            policy,
            handlers: HashMap::new(),
            fallback: Arc::new(LifecycleHandler),
            suggestions: Mutex::new(Vec::new()),
        }
    }

    pub fn with_handler(mut self, kind: WorkerKind, handler: Arc<dyn CompletionHandler>) -> Self {
        self.handlers.insert(kind, handler);
        self
    }

    pub fn policy(&self) -> &HookPolicy {
        &self.policy
    }

    pub async fn on_invocation_complete(
        &self,
        invocation: &WorkerInvocation,
        verification: &VerificationResult,
    ) -> StateResult<HookOutcome> {
        let handler = self
            .handlers
            .get(&invocation.worker_kind)
            .unwrap_or(&self.fallback);
        let outcome = handler
            .handle(invocation, verification, &self.policy, &self.state)
            .await?;

        match &outcome {
            HookOutcome::Applied(transition) => info!(
                task_id = %invocation.task_id,
                invocation_id = %invocation.invocation_id,
                to = %transition.to_state,
                "Completion applied"
            ),
            HookOutcome::AlreadyApplied => debug!(
                invocation_id = %invocation.invocation_id,
                "Completion already applied; ignoring redelivery"
            ),
            HookOutcome::Suggested(suggestion) => {
                info!(
                    task_id = %invocation.task_id,
                    invocation_id = %invocation.invocation_id,
                    kind = ?suggestion.kind,
                    "Completion produced a suggestion"
                );
                self.push(suggestion.clone());
            }
        }
        Ok(outcome)
    }

    /// Summarize blocked and pending work as a progress-report suggestion.
    pub async fn on_session_end(&self) -> Suggestion {
        let progress = self.state.progress().await;
        let mut lines = vec![format!(
            "{} of {} tasks done, {} blocked, {} pending",
            progress.done(),
            progress.total,
            progress.blocked.len(),
            progress.pending.len()
        )];
        for blocked in &progress.blocked {
            lines.push(format!("blocked {}: {}", blocked.id, blocked.reason));
        }
        if !progress.pending.is_empty() {
            lines.push(format!("pending: {}", progress.pending.join(", ")));
        }

        let suggestion = Suggestion {
            kind: SuggestionKind::ProgressReport,
            task_id: None,
            invocation_id: None,
            message: lines.join("\n"),
            created_at: Utc::now(),
        };
        self.push(suggestion.clone());
        suggestion
    }

    pub fn suggestions(&self) -> Vec<Suggestion> {
        self.lock().clone()
    }

    /// Take every pending suggestion, leaving the list empty.
    pub fn drain_suggestions(&self) -> Vec<Suggestion> {
        std::mem::take(&mut *self.lock())
    }

    /// Redelivered events do not add the same suggestion twice.
    fn push(&self, suggestion: Suggestion) {
        let mut suggestions = self.lock();
        let duplicate = suggestion.invocation_id.is_some()
            && suggestions
                .iter()
                .any(|s| s.invocation_id == suggestion.invocation_id && s.kind == suggestion.kind);
        if !duplicate {
            suggestions.push(suggestion);
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, Vec<Suggestion>> {
        self.suggestions.lock().unwrap_or_else(|p| p.into_inner())
    }
}

fn first_line(text: &str) -> &str {
    text.lines().next().unwrap_or("")
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckOutcome, Expectations, SelfReportedStatus, Task, TaskState};
    use crate::store::StateLog;
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    async fn state_with(dir: &TempDir, tasks: &[(&str, TaskState)]) -> Arc<TaskStateMachine> {
        let log = StateLog::open(dir.path().join("state")).expect("log");
        let state = TaskStateMachine::open(log).expect("state");
        for (id, at) in tasks {
            state.add_task(Task::new(*id, *id)).await.expect("add");
            if *at != TaskState::Backlog {
                state.manual_override(id, *at, "test", "setup").await.expect("override");
            }
        }
        Arc::new(state)
    }

    fn completed(id: &str, task: &str, kind: WorkerKind) -> WorkerInvocation {
        WorkerInvocation {
            invocation_id: id.to_string(),
            batch_id: "batch-1".to_string(),
            task_id: task.to_string(),
            worker_kind: kind,
            input_resources: Vec::new(),
            external_resources: Vec::new(),
            expectations: Expectations::default(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            self_reported_status: SelfReportedStatus::Success,
            claimed_artifacts: Vec::new(),
            output: serde_json::Value::Null,
            error: None,
        }
    }

    fn verdict(inv: &WorkerInvocation, pass: bool) -> VerificationResult {
        let mut checks = BTreeMap::new();
        let outcome = if pass {
            CheckOutcome::pass("record REC-1 exists")
        } else {
            CheckOutcome::fail("record REC-1 not found in tracker")
        };
        checks.insert("record_of_work_exists".to_string(), outcome);
        VerificationResult::from_checks(&inv.invocation_id, &inv.task_id, inv.worker_kind, checks)
    }

    #[tokio::test]
    async fn test_redelivery_applies_once() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(&dir, &[("T-1", TaskState::ReadyForReview)]).await;
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());
        let inv = completed("inv-1", "T-1", WorkerKind::Review);
        let result = verdict(&inv, true);

        let first = hooks.on_invocation_complete(&inv, &result).await.expect("first");
        assert!(matches!(first, HookOutcome::Applied(ref t) if t.to_state == TaskState::ReadyForTest));
        let second = hooks.on_invocation_complete(&inv, &result).await.expect("second");
        assert_eq!(second, HookOutcome::AlreadyApplied);

        let task = state.get("T-1").await.expect("task");
        assert_eq!(task.state, TaskState::ReadyForTest);
        assert_eq!(task.history.iter().filter(|t| !t.manual_override).count(), 1);
        assert!(hooks.suggestions().is_empty());
    }

    #[tokio::test]
    async fn test_failed_verification_suggests_rework() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(&dir, &[("T-1", TaskState::ReadyForBuild)]).await;
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());
        let inv = completed("inv-1", "T-1", WorkerKind::Build);

        let outcome = hooks
            .on_invocation_complete(&inv, &verdict(&inv, false))
            .await
            .expect("outcome");
        match outcome {
            HookOutcome::Suggested(s) => {
                assert_eq!(s.kind, SuggestionKind::Rework);
                assert!(s.message.contains("record_of_work_exists"));
                assert!(s.message.contains("not found"));
            }
            other => panic!("expected suggestion, got {:?}", other),
        }
        hooks.on_invocation_complete(&inv, &verdict(&inv, false)).await.expect("again");
        assert_eq!(hooks.suggestions().len(), 1);
        assert_eq!(state.get("T-1").await.expect("task").state, TaskState::ReadyForBuild);
    }

    #[tokio::test]
    async fn test_manual_policy_asks_for_review() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(&dir, &[("T-1", TaskState::ReadyForDeploy)]).await;
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());
        let inv = completed("inv-1", "T-1", WorkerKind::Deploy);

        let outcome = hooks
            .on_invocation_complete(&inv, &verdict(&inv, true))
            .await
            .expect("outcome");
        assert!(matches!(outcome, HookOutcome::Suggested(ref s) if s.kind == SuggestionKind::Review));
        assert_eq!(state.get("T-1").await.expect("task").state, TaskState::ReadyForDeploy);

        let hooks = EventHookDispatcher::new(
            Arc::clone(&state),
            HookPolicy::default().with_auto_apply(WorkerKind::Deploy, true),
        );
        let outcome = hooks
            .on_invocation_complete(&inv, &verdict(&inv, true))
            .await
            .expect("outcome");
        assert!(matches!(outcome, HookOutcome::Applied(_)));
        assert_eq!(state.get("T-1").await.expect("task").state, TaskState::Done);
    }

    #[tokio::test]
    async fn test_verified_work_on_moved_task_becomes_review() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(&dir, &[("T-1", TaskState::Backlog)]).await;
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());
        let inv = completed("inv-1", "T-1", WorkerKind::Test);

        let outcome = hooks
            .on_invocation_complete(&inv, &verdict(&inv, true))
            .await
            .expect("outcome");
        assert!(matches!(outcome, HookOutcome::Suggested(ref s) if s.message.contains("could not be applied")));
    }

    struct AlwaysSuggest;

    #[async_trait]
    impl CompletionHandler for AlwaysSuggest {
        async fn handle(
            &self,
            invocation: &WorkerInvocation,
            _verification: &VerificationResult,
            _policy: &HookPolicy,
            _state: &TaskStateMachine,
        ) -> StateResult<HookOutcome> {
            Ok(HookOutcome::Suggested(Suggestion::for_invocation(
                SuggestionKind::Review,
                invocation,
                "design sign-off required",
            )))
        }
    }

    #[tokio::test]
    async fn test_handler_registered_per_kind() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(&dir, &[("T-1", TaskState::ReadyForDesign)]).await;
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default())
            .with_handler(WorkerKind::Design, Arc::new(AlwaysSuggest));
        let inv = completed("inv-1", "T-1", WorkerKind::Design);

        hooks.on_invocation_complete(&inv, &verdict(&inv, true)).await.expect("outcome");
        assert_eq!(state.get("T-1").await.expect("task").state, TaskState::ReadyForDesign);
        assert_eq!(hooks.drain_suggestions()[0].message, "design sign-off required");
        assert!(hooks.suggestions().is_empty());
    }

    #[tokio::test]
    async fn test_session_end_reports_blocked_and_pending() {
        let dir = TempDir::new().expect("temp dir");
        let state = state_with(
            &dir,
            &[("T-1", TaskState::Done), ("T-2", TaskState::ReadyForBuild), ("T-3", TaskState::Backlog)],
        )
        .await;
        state.block("T-3", "waiting on vendor").await.expect("block");
        let hooks = EventHookDispatcher::new(Arc::clone(&state), HookPolicy::default());

        let report = hooks.on_session_end().await;
        assert_eq!(report.kind, SuggestionKind::ProgressReport);
        assert!(report.message.contains("1 of 3 tasks done, 1 blocked, 1 pending"));
        assert!(report.message.contains("blocked T-3: waiting on vendor"));
        assert!(report.message.contains("pending: T-2"));
        assert_eq!(hooks.suggestions().len(), 1);
    }
}
