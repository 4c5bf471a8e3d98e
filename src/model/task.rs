//! Backlog tasks, lifecycle states and the transition history.

use std::collections::BTreeSet;
use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use super::WorkerKind;

/// Lifecycle state of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum TaskState {
    Backlog,
    ReadyForDesign,
    ReadyForArch,
    ReadyForBuild,
    ReadyForReview,
    ReadyForTest,
    ReadyForDeploy,
    Done,
    Blocked,
    OnHold,
}

impl TaskState {
    /// The main lifecycle in order. Side states are not part of it.
    pub const LIFECYCLE: [TaskState; 8] = [
        TaskState::Backlog,
        TaskState::ReadyForDesign,
        TaskState::ReadyForArch,
        TaskState::ReadyForBuild,
        TaskState::ReadyForReview,
        TaskState::ReadyForTest,
        TaskState::ReadyForDeploy,
        TaskState::Done,
    ];

    /// The next state in the main lifecycle, if any.
    pub fn successor(self) -> Option<TaskState> {
        let index = Self::LIFECYCLE.iter().position(|s| *s == self)?;
        Self::LIFECYCLE.get(index + 1).copied()
    }

    pub fn is_terminal(self) -> bool {
        self == TaskState::Done
    }

    pub fn is_side_state(self) -> bool {
        matches!(self, TaskState::Blocked | TaskState::OnHold)
    }

    /// Whether a verified invocation may move a task from `self` to `to`.
    ///
    /// Besides the direct successor, review and test may send work back to build.
    pub fn can_advance_to(self, to: TaskState) -> bool {
        if self.successor() == Some(to) {
            return true;
        }
        matches!(
            (self, to),
            (TaskState::ReadyForReview, TaskState::ReadyForBuild)
                | (TaskState::ReadyForTest, TaskState::ReadyForBuild)
        )
    }

    pub fn as_label(self) -> &'static str {
        match self {
            TaskState::Backlog => "BACKLOG",
            TaskState::ReadyForDesign => "READY_FOR_DESIGN",
            TaskState::ReadyForArch => "READY_FOR_ARCH",
            TaskState::ReadyForBuild => "READY_FOR_BUILD",
            TaskState::ReadyForReview => "READY_FOR_REVIEW",
            TaskState::ReadyForTest => "READY_FOR_TEST",
            TaskState::ReadyForDeploy => "READY_FOR_DEPLOY",
            TaskState::Done => "DONE",
            TaskState::Blocked => "BLOCKED",
            TaskState::OnHold => "ON_HOLD",
        }
    }
}

impl fmt::Display for TaskState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for TaskState {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let normalized = s.trim().to_ascii_uppercase().replace(['-', ' '], "_");
        Self::LIFECYCLE
            .iter()
            .chain([TaskState::Blocked, TaskState::OnHold].iter())
            .find(|state| state.as_label() == normalized)
            .copied()
            .ok_or_else(|| format!("unknown task state '{}'", s))
    }
}

/// Relative size of a task.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Default, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum Estimate {
    Xs,
    S,
    #[default]
    M,
    L,
    Xl,
}

impl FromStr for Estimate {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_uppercase().as_str() {
            "XS" => Ok(Estimate::Xs),
            "S" => Ok(Estimate::S),
            "M" => Ok(Estimate::M),
            "L" => Ok(Estimate::L),
            "XL" => Ok(Estimate::Xl),
            other => Err(format!("unknown estimate '{}'", other)),
        }
    }
}

/// Who caused a transition.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "type", content = "name")]
pub enum Actor {
    Worker(WorkerKind),
    System,
    Operator(String),
}

impl fmt::Display for Actor {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Actor::Worker(kind) => write!(f, "worker:{}", kind),
            Actor::System => f.write_str("system"),
            Actor::Operator(name) => write!(f, "operator:{}", name),
        }
    }
}

/// One entry of a task's append-only history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transition {
    pub from_state: TaskState,
    pub to_state: TaskState,
    pub actor: Actor,
    pub timestamp: DateTime<Utc>,
    /// Pointer to the archived verification result that authorized this move.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub evidence_ref: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub invocation_id: Option<String>,
    #[serde(default)]
    pub manual_override: bool,
    #[serde(default)]
    pub annotation: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Transition {
    /// A transition is authorized when it carries evidence or is flagged as an override.
    pub fn is_authorized(&self) -> bool {
        self.manual_override || self.annotation || self.evidence_ref.is_some()
    }
}

/// Why a task was blocked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Blocker {
    pub reason: String,
    pub recorded_at: DateTime<Utc>,
}

/// A unit of backlog work.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Task {
    pub id: String,
    pub title: String,
    pub state: TaskState,
    /// Lower numbers are more urgent.
    pub priority: u32,
    pub estimate: Estimate,
    pub history: Vec<Transition>,
    /// Resources claimed by the invocation currently in flight for this task.
    #[serde(default)]
    pub locked_resources: BTreeSet<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub locked_at: Option<DateTime<Utc>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    #[serde(default)]
    pub blockers: Vec<Blocker>,
    pub created_at: DateTime<Utc>,
}

impl Task {
    /// Create a task in the initial `BACKLOG` state.
    pub fn new(id: impl Into<String>, title: impl Into<String>) -> Self {
        Self {
            id: id.into(),
            title: title.into(),
            state: TaskState::Backlog,
            priority: 3,
            estimate: Estimate::default(),
            history: Vec::new(),
            locked_resources: BTreeSet::new(),
            locked_at: None,
            external_id: None,
            blockers: Vec::new(),
            created_at: Utc::now(),
        }
    }

    pub fn with_priority(mut self, priority: u32) -> Self {
        self.priority = priority;
        self
    }

    pub fn with_estimate(mut self, estimate: Estimate) -> Self {
        self.estimate = estimate;
        self
    }

    pub fn with_external_id(mut self, external_id: impl Into<String>) -> Self {
        self.external_id = Some(external_id.into());
        self
    }

    pub fn is_in_flight(&self) -> bool {
        !self.locked_resources.is_empty() || self.locked_at.is_some()
    }

    /// The state a side state returns to.
    ///
    /// Side states nest (a held task can be blocked), so the history is
    /// replayed as a stack: entering a side state pushes the origin, returning
    /// to that origin pops it, and any other move out of a side state clears it.
    pub fn return_state(&self) -> Option<TaskState> {
        if !self.state.is_side_state() {
            return None;
        }
        let mut origins: Vec<TaskState> = Vec::new();
        for t in self.history.iter().filter(|t| t.from_state != t.to_state) {
            if t.from_state.is_side_state() && origins.last() == Some(&t.to_state) {
                origins.pop();
            } else if t.to_state.is_side_state() {
                origins.push(t.from_state);
            } else {
                origins.clear();
            }
        }
        origins.last().copied()
    }

    /// Apply an already validated and persisted transition to this projection.
    pub(crate) fn record(&mut self, transition: Transition) {
        if transition.to_state == TaskState::Blocked && transition.from_state != TaskState::Blocked
        {
            self.blockers.push(Blocker {
                reason: transition.note.clone().unwrap_or_default(),
                recorded_at: transition.timestamp,
            });
        }
        self.state = transition.to_state;
        self.history.push(transition);
    }
}
