//! Core data model shared by every component.

mod invocation;
mod task;
mod verification;

pub use invocation::{
    Assignment, CheckKind, ClaimedArtifact, Expectations, Intent, ResourceClaim,
    SelfReportedStatus, WorkerInvocation, WorkerKind,
};
pub use task::{Actor, Blocker, Estimate, Task, TaskState, Transition};
pub use verification::{CheckOutcome, VerificationResult};
