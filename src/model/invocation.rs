//! Assignments, worker kinds and the invocations produced from them.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::TaskState;

/// Independent checks the verifier knows how to derive from ground truth.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum CheckKind {
    /// A declared write resource was actually changed (file present or commit exists).
    ResourceModified,
    /// The CI runner reports success for the declared target when re-run.
    AutomatedChecksPass,
    /// A tracker record documenting the work exists (and carries the expected state).
    RecordOfWorkExists,
    /// The record of work references the artifact under review.
    ReferencesCorrectArtifact,
    /// At least one claimed commit exists on the version-control host.
    CommitExists,
    /// Nothing was written outside the declared write resources.
    NoUnexpectedChanges,
}

impl CheckKind {
    pub fn name(self) -> &'static str {
        match self {
            CheckKind::ResourceModified => "resource_modified",
            CheckKind::AutomatedChecksPass => "automated_checks_pass",
            CheckKind::RecordOfWorkExists => "record_of_work_exists",
            CheckKind::ReferencesCorrectArtifact => "references_correct_artifact",
            CheckKind::CommitExists => "commit_exists",
            CheckKind::NoUnexpectedChanges => "no_unexpected_changes",
        }
    }
}

/// The kinds of worker the engine can dispatch.
///
/// Each kind owns the checks its invocations must pass and the lifecycle move
/// it performs on success.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum WorkerKind {
    Planning,
    Design,
    Architecture,
    Build,
    Review,
    Test,
    Deploy,
}

impl WorkerKind {
    pub const ALL: [WorkerKind; 7] = [
        WorkerKind::Planning,
        WorkerKind::Design,
        WorkerKind::Architecture,
        WorkerKind::Build,
        WorkerKind::Review,
        WorkerKind::Test,
        WorkerKind::Deploy,
    ];

    /// Checks that must all pass before an invocation of this kind counts as verified.
    pub fn required_checks(self) -> &'static [CheckKind] {
        match self {
            WorkerKind::Planning => &[CheckKind::RecordOfWorkExists],
            WorkerKind::Design | WorkerKind::Architecture => {
                &[CheckKind::RecordOfWorkExists, CheckKind::ResourceModified]
            }
            WorkerKind::Build => &[
                CheckKind::ResourceModified,
                CheckKind::AutomatedChecksPass,
                CheckKind::RecordOfWorkExists,
            ],
            WorkerKind::Review => &[
                CheckKind::RecordOfWorkExists,
                CheckKind::ReferencesCorrectArtifact,
            ],
            WorkerKind::Test => &[CheckKind::AutomatedChecksPass, CheckKind::RecordOfWorkExists],
            WorkerKind::Deploy => &[
                CheckKind::CommitExists,
                CheckKind::AutomatedChecksPass,
                CheckKind::RecordOfWorkExists,
            ],
        }
    }

    /// The state this kind of worker moves a task into once verified.
    pub fn target_state(self) -> TaskState {
        match self {
            WorkerKind::Planning => TaskState::ReadyForDesign,
            WorkerKind::Design => TaskState::ReadyForArch,
            WorkerKind::Architecture => TaskState::ReadyForBuild,
            WorkerKind::Build => TaskState::ReadyForReview,
            WorkerKind::Review => TaskState::ReadyForTest,
            WorkerKind::Test => TaskState::ReadyForDeploy,
            WorkerKind::Deploy => TaskState::Done,
        }
    }

    pub fn as_label(self) -> &'static str {
        match self {
            WorkerKind::Planning => "planning",
            WorkerKind::Design => "design",
            WorkerKind::Architecture => "architecture",
            WorkerKind::Build => "build",
            WorkerKind::Review => "review",
            WorkerKind::Test => "test",
            WorkerKind::Deploy => "deploy",
        }
    }
}

impl fmt::Display for WorkerKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

impl FromStr for WorkerKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let lower = s.trim().to_ascii_lowercase();
        Self::ALL
            .iter()
            .find(|kind| kind.as_label() == lower)
            .copied()
            .ok_or_else(|| format!("unknown worker kind '{}'", s))
    }
}

/// How an assignment intends to use a resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum Intent {
    Read,
    #[default]
    Write,
}

/// A resource (file path, directory, glob or external record id) an assignment touches.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct ResourceClaim {
    pub resource: String,
    #[serde(default)]
    pub intent: Intent,
}

impl ResourceClaim {
    pub fn write(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            intent: Intent::Write,
        }
    }

    pub fn read(resource: impl Into<String>) -> Self {
        Self {
            resource: resource.into(),
            intent: Intent::Read,
        }
    }
}

/// What the caller expects the worker to leave behind, used by verification.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Expectations {
    /// Target handed to the CI runner when automated checks are required.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub target: Option<String>,
    /// Artifact (commit, branch, PR number) a review must reference.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub artifact_ref: Option<String>,
    /// Value the record of work must carry in its `state` field.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_record_state: Option<String>,
    /// Explicit lifecycle target; defaults to the worker kind's target state.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub to_state: Option<TaskState>,
}

/// A proposed unit of work for one task.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Assignment {
    pub task_id: String,
    pub worker_kind: WorkerKind,
    #[serde(default)]
    pub resources: Vec<ResourceClaim>,
    /// Breaker-guarded services the worker will call.
    #[serde(default)]
    pub external_resources: Vec<String>,
    /// A timeout during a destructive stage holds the rest of the batch for review.
    #[serde(default)]
    pub destructive: bool,
    #[serde(flatten)]
    pub expectations: Expectations,
}

impl Assignment {
    pub fn new(task_id: impl Into<String>, worker_kind: WorkerKind) -> Self {
        Self {
            task_id: task_id.into(),
            worker_kind,
            resources: Vec::new(),
            external_resources: Vec::new(),
            destructive: false,
            expectations: Expectations::default(),
        }
    }

    pub fn with_write(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(ResourceClaim::write(resource));
        self
    }

    pub fn with_read(mut self, resource: impl Into<String>) -> Self {
        self.resources.push(ResourceClaim::read(resource));
        self
    }

    pub fn with_external(mut self, resource: impl Into<String>) -> Self {
        self.external_resources.push(resource.into());
        self
    }

    pub fn with_target(mut self, target: impl Into<String>) -> Self {
        self.expectations.target = Some(target.into());
        self
    }

    pub fn with_artifact_ref(mut self, artifact_ref: impl Into<String>) -> Self {
        self.expectations.artifact_ref = Some(artifact_ref.into());
        self
    }

    pub fn with_expected_record_state(mut self, state: impl Into<String>) -> Self {
        self.expectations.expected_record_state = Some(state.into());
        self
    }

    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Resources this assignment intends to write.
    pub fn write_set(&self) -> impl Iterator<Item = &str> {
        self.resources
            .iter()
            .filter(|claim| claim.intent == Intent::Write)
            .map(|claim| claim.resource.as_str())
    }

    /// The state a verified invocation of this assignment moves the task into.
    pub fn target_state(&self) -> TaskState {
        self.expectations
            .to_state
            .unwrap_or_else(|| self.worker_kind.target_state())
    }
}

/// The worker's own account of how the invocation went. Never trusted.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "snake_case")]
pub enum SelfReportedStatus {
    Success,
    #[default]
    Failure,
    Timeout,
    Error,
    /// Cancelled before or while running.
    Cancelled,
    /// Never started: a destructive sibling timed out.
    HeldForReview,
}

impl SelfReportedStatus {
    pub fn as_label(self) -> &'static str {
        match self {
            SelfReportedStatus::Success => "success",
            SelfReportedStatus::Failure => "failure",
            SelfReportedStatus::Timeout => "timeout",
            SelfReportedStatus::Error => "error",
            SelfReportedStatus::Cancelled => "cancelled",
            SelfReportedStatus::HeldForReview => "held_for_review",
        }
    }
}

impl fmt::Display for SelfReportedStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_label())
    }
}

/// Something a worker claims to have produced.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ClaimedArtifact {
    CommitCreated { reference: String },
    BranchCreated { name: String },
    PullRequestOpened { number: u64 },
    RecordCreated { record_id: String },
    RecordUpdated {
        record_id: String,
        #[serde(default)]
        fields: Map<String, Value>,
    },
    FileWritten { path: String },
    ChecksPassed { target: String },
}

impl ClaimedArtifact {
    /// Stable key used to name the per-artifact verification check.
    pub fn check_key(&self) -> String {
        match self {
            ClaimedArtifact::CommitCreated { reference } => format!("artifact:commit:{}", reference),
            ClaimedArtifact::BranchCreated { name } => format!("artifact:branch:{}", name),
            ClaimedArtifact::PullRequestOpened { number } => format!("artifact:pr:{}", number),
            ClaimedArtifact::RecordCreated { record_id } => format!("artifact:record:{}", record_id),
            ClaimedArtifact::RecordUpdated { record_id, .. } => {
                format!("artifact:record:{}", record_id)
            }
            ClaimedArtifact::FileWritten { path } => format!("artifact:file:{}", path),
            ClaimedArtifact::ChecksPassed { target } => format!("artifact:checks:{}", target),
        }
    }

    /// Whether the artifact is a file write or a commit.
    pub fn is_write(&self) -> bool {
        matches!(
            self,
            ClaimedArtifact::CommitCreated { .. } | ClaimedArtifact::FileWritten { .. }
        )
    }

    pub fn record_id(&self) -> Option<&str> {
        match self {
            ClaimedArtifact::RecordCreated { record_id }
            | ClaimedArtifact::RecordUpdated { record_id, .. } => Some(record_id),
            _ => None,
        }
    }
}

/// One execution of a worker against a task.
///
/// Built by the dispatcher once the worker has finished; immutable afterwards.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WorkerInvocation {
    pub invocation_id: String,
    pub batch_id: String,
    pub task_id: String,
    pub worker_kind: WorkerKind,
    pub input_resources: Vec<ResourceClaim>,
    #[serde(default)]
    pub external_resources: Vec<String>,
    #[serde(default)]
    pub expectations: Expectations,
    pub started_at: DateTime<Utc>,
    pub completed_at: DateTime<Utc>,
    /// Forwarded from the worker. Verification never reads it.
    pub self_reported_status: SelfReportedStatus,
    #[serde(default)]
    pub claimed_artifacts: Vec<ClaimedArtifact>,
    /// Opaque structured output of the worker.
    #[serde(default)]
    pub output: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

impl WorkerInvocation {
    /// Write resources declared by the assignment.
    pub fn declared_writes(&self) -> impl Iterator<Item = &str> {
        self.input_resources
            .iter()
            .filter(|claim| claim.intent == Intent::Write)
            .map(|claim| claim.resource.as_str())
    }

    pub fn target_state(&self) -> TaskState {
        self.expectations
            .to_state
            .unwrap_or_else(|| self.worker_kind.target_state())
    }

    pub fn duration(&self) -> chrono::Duration {
        self.completed_at - self.started_at
    }
}
