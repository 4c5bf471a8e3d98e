//! taskgate: orchestration and verification engine for multi-agent task backlogs.
//!
//! The engine schedules worker invocations against a persisted backlog without
//! ever trusting what a worker says about its own work:
//!
//! - [`conflict`] splits a batch so no two concurrent invocations write the same resource
//! - [`limiter`] and [`breaker`] bound concurrency and isolate failing external services
//! - [`dispatch`] runs workers with per-invocation timeouts and batch cancellation
//! - [`verify`] re-derives every claimed artifact from ground truth
//! - [`state`] keeps the append-only task lifecycle and only accepts verified transitions
//! - [`hooks`] turns completions into suggestions or automatic transitions
//! - [`orchestrator`] wires the whole data flow for drivers such as the CLI

pub mod breaker;
pub mod config;
pub mod conflict;
pub mod dispatch;
pub mod error;
pub mod hooks;
pub mod limiter;
pub mod model;
pub mod orchestrator;
pub mod ports;
pub mod state;
pub mod store;
pub mod timeout;
pub mod verify;

pub use config::EngineConfig;
pub use error::{EngineError, EngineResult};
pub use model::{
    Assignment, ClaimedArtifact, Intent, ResourceClaim, SelfReportedStatus, Task, TaskState,
    Transition, VerificationResult, WorkerInvocation, WorkerKind,
};
pub use orchestrator::{BatchReport, OutcomeCode, Orchestrator};
