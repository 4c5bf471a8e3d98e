//! The persisted task lifecycle.
//!
//! [`TaskStateMachine`] owns the backlog projection rebuilt from the
//! [`StateLog`]. Every change is written to the log before the projection is
//! touched, and changes to one task are serialized by a per-task lock.
//! Lifecycle moves are only accepted with a verified [`VerificationResult`];
//! operator overrides and side-state moves are recorded with explicit flags.

use std::collections::{BTreeMap, HashMap, HashSet};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use thiserror::Error;
use tokio::sync::{Mutex as AsyncMutex, OwnedMutexGuard, RwLock};
use tracing::{debug, info, warn};

use crate::breaker::BreakerRegistry;
use crate::conflict;
use crate::model::{Actor, Task, TaskState, Transition, VerificationResult};
use crate::ports::{Fields, PortError, TaskTracker};
use crate::store::{StateLog, StoreError, TaskDefinition};

/// Rejections from the state machine. A rejected call changes nothing.
#[derive(Error, Debug)]
pub enum StateError {
    #[error("invocation '{invocation_id}' for task '{task_id}' is not verified")]
    Unverified {
        task_id: String,
        invocation_id: String,
    },

    #[error("task '{task_id}' cannot move from {from} to {to}")]
    InvalidTransition {
        task_id: String,
        from: TaskState,
        to: TaskState,
    },

    #[error("unknown task '{0}'")]
    UnknownTask(String),

    #[error("task '{0}' is DONE; only annotations are accepted")]
    TerminalState(String),

    #[error("a transition for invocation '{invocation_id}' was already applied")]
    DuplicateInvocation { invocation_id: String },

    #[error("verification for task '{evidence_task}' cannot move task '{task_id}'")]
    EvidenceMismatch {
        task_id: String,
        evidence_task: String,
    },

    #[error("task '{0}' already exists")]
    DuplicateTask(String),

    #[error("invalid task id '{0}'")]
    InvalidTaskId(String),

    #[error("resource '{resource}' is held by in-flight task '{holder}'")]
    ResourceBusy { resource: String, holder: String },

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Result type for state machine operations.
pub type StateResult<T> = Result<T, StateError>;

/// A blocked task and the reason it was blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockedTask {
    pub id: String,
    pub title: String,
    pub reason: String,
}

/// Counts per state plus the tasks needing attention.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProgressReport {
    pub total: usize,
    pub by_state: BTreeMap<TaskState, usize>,
    pub blocked: Vec<BlockedTask>,
    pub in_flight: Vec<String>,
    /// Non-terminal tasks not blocked or on hold, in selection order.
    pub pending: Vec<String>,
}

impl ProgressReport {
    pub fn done(&self) -> usize {
        self.by_state.get(&TaskState::Done).copied().unwrap_or(0)
    }
}

/// Best-effort mirroring of transitions into the external tracker.
#[derive(Clone)]
pub struct TrackerMirror {
    tracker: Arc<dyn TaskTracker>,
    breakers: Arc<BreakerRegistry>,
    resource: String,
    timeout: Duration,
}

impl TrackerMirror {
    pub fn new(
        tracker: Arc<dyn TaskTracker>,
        breakers: Arc<BreakerRegistry>,
        resource: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            tracker,
            breakers,
            resource: resource.into(),
            timeout,
        }
    }

    async fn mirror(&self, task: &Task, transition: &Transition) {
        let Some(record_id) = task.external_id.as_deref() else {
            return;
        };
        let mut fields = Fields::new();
        fields.insert("task_id".into(), Value::String(task.id.clone()));
        fields.insert("engine_state".into(), json!(transition.to_state));
        fields.insert(
            "engine_updated_at".into(),
            Value::String(transition.timestamp.to_rfc3339()),
        );
        if let Some(evidence_ref) = &transition.evidence_ref {
            fields.insert("evidence_ref".into(), Value::String(evidence_ref.clone()));
        }

        let timeout = self.timeout;
        let result = self
            .breakers
            .execute(&self.resource, move || async move {
                match tokio::time::timeout(timeout, self.tracker.update_record(record_id, fields)).await {
                    Ok(result) => result,
                    Err(_) => Err(PortError::Timeout {
                        operation: format!("update_record {}", record_id),
                        after: timeout,
                    }),
                }
            })
            .await;

        match result {
            Ok(()) => debug!(task_id = %task.id, record_id, "Mirrored transition to tracker"),
            Err(err) => warn!(
                task_id = %task.id,
                record_id,
                error = %err,
                "Failed to mirror transition to tracker; local log is authoritative"
            ),
        }
    }
}

/// The backlog and its append-only transition history.
pub struct TaskStateMachine {
    log: StateLog,
    tasks: RwLock<BTreeMap<String, Task>>,
    task_locks: Mutex<HashMap<String, Arc<AsyncMutex<()>>>>,
    applied: Mutex<HashSet<String>>,
    mirror: Option<TrackerMirror>,
}

impl TaskStateMachine {
    /// Replay `log` and open the state machine on the rebuilt projection.
    pub fn open(log: StateLog) -> StateResult<Self> {
        let tasks = log.replay()?;
        let applied: HashSet<String> = tasks
            .values()
            .flat_map(|task| task.history.iter())
            .filter(|t| !t.manual_override && !t.annotation && t.evidence_ref.is_some())
            .filter_map(|t| t.invocation_id.clone())
            .collect();
        info!(tasks = tasks.len(), applied = applied.len(), "Opened task state machine");

        Ok(Self {
            log,
            tasks: RwLock::new(tasks),
            task_locks: Mutex::new(HashMap::new()),
            applied: Mutex::new(applied),
            mirror: None,
        })
    }

    /// Mirror every persisted transition to the external tracker.
    pub fn with_mirror(mut self, mirror: TrackerMirror) -> Self {
        self.mirror = Some(mirror);
        self
    }

    /// Add a task to the backlog in its initial state.
    pub async fn add_task(&self, task: Task) -> StateResult<Task> {
        let id = task.id.trim();
        if id.is_empty() || id != task.id || id.chars().any(char::is_whitespace) {
            return Err(StateError::InvalidTaskId(task.id.clone()));
        }
        let _guard = self.task_lock(&task.id).await;

        let mut tasks = self.tasks.write().await;
        if tasks.contains_key(&task.id) {
            return Err(StateError::DuplicateTask(task.id.clone()));
        }
        let definition = TaskDefinition::from_task(&task);
        self.log.append_task(&definition)?;
        let task = definition.into_task();
        tasks.insert(task.id.clone(), task.clone());
        info!(task_id = %task.id, priority = task.priority, "Added task to backlog");
        Ok(task)
    }

    /// Move a task along the lifecycle on the strength of a verified invocation.
    pub async fn apply_transition(
        &self,
        task_id: &str,
        to_state: TaskState,
        verification: &VerificationResult,
    ) -> StateResult<Transition> {
        let invocation_id = verification.invocation_id.clone();
        let transition = self
            .commit(task_id, |task| {
                if verification.task_id != task.id {
                    return Err(StateError::EvidenceMismatch {
                        task_id: task.id.clone(),
                        evidence_task: verification.task_id.clone(),
                    });
                }
                if self.is_applied(&invocation_id) {
                    return Err(StateError::DuplicateInvocation {
                        invocation_id: invocation_id.clone(),
                    });
                }
                if !verification.is_verified() {
                    return Err(StateError::Unverified {
                        task_id: task.id.clone(),
                        invocation_id: invocation_id.clone(),
                    });
                }
                if task.state.is_terminal() {
                    return Err(StateError::TerminalState(task.id.clone()));
                }
                if !task.state.can_advance_to(to_state) {
                    return Err(StateError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.state,
                        to: to_state,
                    });
                }
                Ok(Transition {
                    from_state: task.state,
                    to_state,
                    actor: Actor::Worker(verification.worker_kind),
                    timestamp: Utc::now(),
                    evidence_ref: Some(verification.evidence_ref()),
                    invocation_id: Some(invocation_id.clone()),
                    manual_override: false,
                    annotation: false,
                    note: None,
                })
            })
            .await?;

        info!(
            task_id,
            invocation_id = %invocation_id,
            from = %transition.from_state,
            to = %transition.to_state,
            "Applied verified transition"
        );
        Ok(transition)
    }

    /// Operator-forced move, flagged as a manual override. DONE stays terminal.
    pub async fn manual_override(
        &self,
        task_id: &str,
        to_state: TaskState,
        operator: &str,
        reason: &str,
    ) -> StateResult<Transition> {
        let transition = self
            .commit(task_id, |task| {
                if task.state.is_terminal() {
                    return Err(StateError::TerminalState(task.id.clone()));
                }
                if task.state == to_state {
                    return Err(StateError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.state,
                        to: to_state,
                    });
                }
                Ok(flagged(task.state, to_state, Actor::Operator(operator.to_string()), reason))
            })
            .await?;
        warn!(task_id, operator, to = %to_state, reason, "Manual override applied");
        Ok(transition)
    }

    /// Move a task to BLOCKED, recording a blocker.
    pub async fn block(&self, task_id: &str, reason: &str) -> StateResult<Transition> {
        self.enter_side_state(task_id, TaskState::Blocked, reason).await
    }

    /// Return a blocked task to the state it was blocked from.
    pub async fn unblock(&self, task_id: &str) -> StateResult<Transition> {
        self.leave_side_state(task_id, TaskState::Blocked, "unblocked").await
    }

    pub async fn hold(&self, task_id: &str, reason: &str) -> StateResult<Transition> {
        self.enter_side_state(task_id, TaskState::OnHold, reason).await
    }

    pub async fn resume(&self, task_id: &str) -> StateResult<Transition> {
        self.leave_side_state(task_id, TaskState::OnHold, "resumed").await
    }

    /// Record an audit note without changing state. Accepted in every state.
    pub async fn annotate(&self, task_id: &str, note: &str) -> StateResult<Transition> {
        self.commit(task_id, |task| {
            let mut transition = flagged(task.state, task.state, Actor::System, note);
            transition.manual_override = false;
            transition.annotation = true;
            Ok(transition)
        })
        .await
    }

    /// Mark a task in flight and claim its write resources.
    ///
    /// Fails with `ResourceBusy` if the task is already in flight or another
    /// in-flight task holds an overlapping resource. Nothing is locked then.
    pub async fn lock_resources(&self, task_id: &str, resources: &[String]) -> StateResult<()> {
        let mut tasks = self.tasks.write().await;
        let task = tasks
            .get(task_id)
            .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))?;
        if task.is_in_flight() {
            return Err(StateError::ResourceBusy {
                resource: format!("task:{}", task_id),
                holder: task_id.to_string(),
            });
        }

        let wanted: Vec<String> = resources.iter().filter_map(|r| conflict::normalize(r)).collect();
        for other in tasks.values().filter(|t| t.id != task_id && t.is_in_flight()) {
            for held in &other.locked_resources {
                if let Some(resource) = wanted.iter().find(|w| conflict::overlaps(w, held)) {
                    return Err(StateError::ResourceBusy {
                        resource: resource.clone(),
                        holder: other.id.clone(),
                    });
                }
            }
        }

        if let Some(task) = tasks.get_mut(task_id) {
            task.locked_resources = wanted.into_iter().collect();
            task.locked_at = Some(Utc::now());
            debug!(task_id, resources = task.locked_resources.len(), "Locked task resources");
        }
        Ok(())
    }

    pub async fn release_resources(&self, task_id: &str) {
        let mut tasks = self.tasks.write().await;
        if let Some(task) = tasks.get_mut(task_id) {
            task.locked_resources.clear();
            task.locked_at = None;
        }
    }

    /// Release several tasks' locks under one write lock.
    pub async fn release_all<'a>(&self, task_ids: impl IntoIterator<Item = &'a str>) {
        let mut tasks = self.tasks.write().await;
        for task_id in task_ids {
            if let Some(task) = tasks.get_mut(task_id) {
                task.locked_resources.clear();
                task.locked_at = None;
            }
        }
    }

    pub async fn get(&self, task_id: &str) -> Option<Task> {
        self.tasks.read().await.get(task_id).cloned()
    }

    /// All tasks, ordered by id.
    pub async fn list(&self) -> Vec<Task> {
        self.tasks.read().await.values().cloned().collect()
    }

    /// Tasks ready to be worked on, most urgent first.
    ///
    /// Blocked, on-hold, finished and in-flight tasks are skipped; the rest are
    /// ordered by priority, then estimate, then age.
    pub async fn next_ready(&self, limit: usize) -> Vec<Task> {
        let tasks = self.tasks.read().await;
        let mut ready: Vec<Task> = tasks
            .values()
            .filter(|t| !t.state.is_terminal() && !t.state.is_side_state() && !t.is_in_flight())
            .cloned()
            .collect();
        sort_for_selection(&mut ready);
        ready.truncate(limit);
        ready
    }

    pub async fn progress(&self) -> ProgressReport {
        let tasks = self.tasks.read().await;
        let mut by_state = BTreeMap::new();
        let mut blocked = Vec::new();
        let mut in_flight = Vec::new();
        let mut pending: Vec<Task> = Vec::new();

        for task in tasks.values() {
            *by_state.entry(task.state).or_insert(0) += 1;
            if task.state == TaskState::Blocked {
                blocked.push(BlockedTask {
                    id: task.id.clone(),
                    title: task.title.clone(),
                    reason: task
                        .blockers
                        .last()
                        .map(|b| b.reason.clone())
                        .unwrap_or_default(),
                });
            }
            if task.is_in_flight() {
                in_flight.push(task.id.clone());
            }
            if !task.state.is_terminal() && !task.state.is_side_state() {
                pending.push(task.clone());
            }
        }
        sort_for_selection(&mut pending);

        ProgressReport {
            total: tasks.len(),
            by_state,
            blocked,
            in_flight,
            pending: pending.into_iter().map(|t| t.id).collect(),
        }
    }

    /// In-flight tasks whose resources have been locked for at least `threshold`.
    pub async fn stale_in_flight(&self, threshold: Duration) -> Vec<Task> {
        let threshold = chrono::Duration::from_std(threshold).unwrap_or(chrono::Duration::MAX);
        let now = Utc::now();
        self.tasks
            .read()
            .await
            .values()
            .filter(|t| t.locked_at.map(|at| now - at >= threshold).unwrap_or(false))
            .cloned()
            .collect()
    }

    fn is_applied(&self, invocation_id: &str) -> bool {
        self.applied
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(invocation_id)
    }

    async fn task_lock(&self, task_id: &str) -> OwnedMutexGuard<()> {
        let lock = {
            let mut locks = self.task_locks.lock().unwrap_or_else(|p| p.into_inner());
            Arc::clone(locks.entry(task_id.to_string()).or_default())
        };
        lock.lock_owned().await
    }

    async fn enter_side_state(
        &self,
        task_id: &str,
        side: TaskState,
        reason: &str,
    ) -> StateResult<Transition> {
        let transition = self
            .commit(task_id, |task| {
                if task.state.is_terminal() {
                    return Err(StateError::TerminalState(task.id.clone()));
                }
                if task.state == side {
                    return Err(StateError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.state,
                        to: side,
                    });
                }
                Ok(flagged(task.state, side, Actor::System, reason))
            })
            .await?;
        info!(task_id, to = %side, reason, "Task moved to side state");
        Ok(transition)
    }

    async fn leave_side_state(
        &self,
        task_id: &str,
        side: TaskState,
        note: &str,
    ) -> StateResult<Transition> {
        let transition = self
            .commit(task_id, |task| {
                if task.state != side {
                    return Err(StateError::InvalidTransition {
                        task_id: task.id.clone(),
                        from: task.state,
                        to: task.return_state().unwrap_or(TaskState::Backlog),
                    });
                }
                let back = task.return_state().unwrap_or(TaskState::Backlog);
                Ok(flagged(task.state, back, Actor::System, note))
            })
            .await?;
        info!(task_id, to = %transition.to_state, "Task returned from side state");
        Ok(transition)
    }

    /// Validate, persist, then project one transition under the task's lock.
    async fn commit<F>(&self, task_id: &str, build: F) -> StateResult<Transition>
    where
        F: FnOnce(&Task) -> StateResult<Transition>,
    {
        let guard = self.task_lock(task_id).await;

        let snapshot = self
            .tasks
            .read()
            .await
            .get(task_id)
            .cloned()
            .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))?;
        let transition = build(&snapshot)?;

        self.log.append_transition(task_id, &transition)?;

        let task = {
            let mut tasks = self.tasks.write().await;
            let task = tasks
                .get_mut(task_id)
                .ok_or_else(|| StateError::UnknownTask(task_id.to_string()))?;
            task.record(transition.clone());
            task.clone()
        };
        if let (false, false, Some(invocation_id)) = (
            transition.manual_override,
            transition.annotation,
            transition.invocation_id.as_ref(),
        ) {
            self.applied
                .lock()
                .unwrap_or_else(|p| p.into_inner())
                .insert(invocation_id.clone());
        }
        drop(guard);

        if let Some(mirror) = &self.mirror {
            mirror.mirror(&task, &transition).await;
        }
        Ok(transition)
    }
}

fn flagged(from: TaskState, to: TaskState, actor: Actor, note: &str) -> Transition {
    Transition {
        from_state: from,
        to_state: to,
        actor,
        timestamp: Utc::now(),
        evidence_ref: None,
        invocation_id: None,
        manual_override: true,
        annotation: false,
        note: Some(note.to_string()),
    }
}

fn sort_for_selection(tasks: &mut [Task]) {
    tasks.sort_by(|a, b| {
        a.priority
            .cmp(&b.priority)
            .then(a.estimate.cmp(&b.estimate))
            .then(a.created_at.cmp(&b.created_at))
            .then(a.id.cmp(&b.id))
    });
}
