//! Bounded, cancellable execution of worker invocations.
//!
//! Each assignment runs as its own tokio task inside a [`JoinSet`]. A task
//! first waits for a [`ConcurrencySlot`], then runs the registered [`Worker`]
//! under the per-invocation timeout. Whatever happens, exactly one
//! [`WorkerInvocation`] comes back per assignment, in input order.

mod command;

pub use command::CommandWorker;

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;
use tokio::sync::watch;
use tokio::task::JoinSet;
use tokio::time::Instant;
use tracing::{debug, info, warn};

use crate::limiter::{ConcurrencyLimiter, ConcurrencySlot};
use crate::model::{Assignment, ClaimedArtifact, SelfReportedStatus, WorkerInvocation, WorkerKind};
use crate::timeout::TimeoutConfig;

/// Errors a worker can report instead of output.
#[derive(Error, Debug)]
pub enum WorkerError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("worker exited with status {code}: {stderr}")]
    Exit { code: i32, stderr: String },

    #[error("worker produced unreadable output: {0}")]
    InvalidOutput(String),

    #[error("{0}")]
    Failed(String),
}

/// What a worker hands back. None of it is trusted until verified.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct WorkerOutput {
    #[serde(default)]
    pub self_reported_status: SelfReportedStatus,
    #[serde(default)]
    pub claimed_artifacts: Vec<ClaimedArtifact>,
    #[serde(default)]
    pub output: Value,
}

impl WorkerOutput {
    pub fn success() -> Self {
        Self {
            self_reported_status: SelfReportedStatus::Success,
            ..Self::default()
        }
    }

    pub fn with_artifact(mut self, artifact: ClaimedArtifact) -> Self {
        self.claimed_artifacts.push(artifact);
        self
    }

    pub fn with_output(mut self, output: Value) -> Self {
        self.output = output;
        self
    }
}

/// Per-invocation context handed to a worker.
#[derive(Debug, Clone)]
pub struct WorkerContext {
    pub invocation_id: String,
    pub batch_id: String,
    cancel: watch::Receiver<bool>,
}

impl WorkerContext {
    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    /// Resolves once the batch is cancelled.
    pub async fn cancelled(&mut self) {
        wait_cancelled(&mut self.cancel).await
    }
}

/// Something that can carry out an assignment.
///
/// Dropping the returned future must stop the work; the dispatcher drops it
/// on timeout and on cancellation.
#[async_trait]
pub trait Worker: Send + Sync {
    async fn run(&self, assignment: &Assignment, ctx: WorkerContext) -> Result<WorkerOutput, WorkerError>;
}

/// Cancellation handle for one dispatched batch.
#[derive(Debug, Clone)]
pub struct BatchHandle {
    batch_id: String,
    cancel: Arc<watch::Sender<bool>>,
}

impl BatchHandle {
    pub fn batch_id(&self) -> &str {
        &self.batch_id
    }

    /// Cancel every queued and running invocation of the batch.
    pub fn cancel(&self) {
        info!(batch_id = %self.batch_id, "Cancelling batch");
        self.cancel.send_replace(true);
    }

    pub fn is_cancelled(&self) -> bool {
        *self.cancel.borrow()
    }

    fn subscribe(&self) -> watch::Receiver<bool> {
        self.cancel.subscribe()
    }
}

/// Runs batches of assignments against registered workers.
pub struct WorkerDispatcher {
    workers: HashMap<WorkerKind, Arc<dyn Worker>>,
    worker_timeouts: HashMap<WorkerKind, Duration>,
    limiter: Arc<ConcurrencyLimiter>,
    timeouts: TimeoutConfig,
    batch_counter: AtomicU64,
}

impl WorkerDispatcher {
    pub fn new(limiter: Arc<ConcurrencyLimiter>, timeouts: TimeoutConfig) -> Self {
        Self {
            workers: HashMap::new(),
            worker_timeouts: HashMap::new(),
            limiter,
            timeouts,
            batch_counter: AtomicU64::new(0),
        }
    }

    pub fn with_worker(mut self, kind: WorkerKind, worker: Arc<dyn Worker>) -> Self {
        self.workers.insert(kind, worker);
        self
    }

    /// Override the invocation timeout for one worker kind.
    pub fn with_worker_timeout(mut self, kind: WorkerKind, timeout: Duration) -> Self {
        self.worker_timeouts.insert(kind, timeout);
        self
    }

    pub fn has_worker(&self, kind: WorkerKind) -> bool {
        self.workers.contains_key(&kind)
    }

    pub fn limiter(&self) -> &Arc<ConcurrencyLimiter> {
        &self.limiter
    }

    /// A fresh handle for the next batch.
    pub fn new_batch(&self) -> BatchHandle {
        let seq = self.batch_counter.fetch_add(1, Ordering::SeqCst) + 1;
        let (cancel, _) = watch::channel(false);
        BatchHandle {
            batch_id: format!("batch-{}-{}", Utc::now().format("%Y%m%d%H%M%S%3f"), seq),
            cancel: Arc::new(cancel),
        }
    }

    /// Run every assignment and return one invocation per assignment, in order.
    pub async fn dispatch(&self, batch: &BatchHandle, assignments: Vec<Assignment>) -> Vec<WorkerInvocation> {
        let held = Arc::new(AtomicBool::new(false));
        let deadline = Instant::now() + self.timeouts.batch_timeout;
        let mut join_set = JoinSet::new();
        let mut results: Vec<Option<WorkerInvocation>> = vec![None; assignments.len()];

        info!(
            batch_id = %batch.batch_id,
            assignments = assignments.len(),
            available = self.limiter.available(),
            "Dispatching batch"
        );

        for (index, assignment) in assignments.iter().enumerate() {
            let invocation_id = format!("{}-{:03}", batch.batch_id, index + 1);
            let Some(worker) = self.workers.get(&assignment.worker_kind).cloned() else {
                warn!(
                    task_id = %assignment.task_id,
                    worker_kind = %assignment.worker_kind,
                    "No worker registered for kind"
                );
                let now = Utc::now();
                results[index] = Some(finished(
                    assignment,
                    &batch.batch_id,
                    invocation_id,
                    now,
                    Completion::Error(format!("no worker registered for kind '{}'", assignment.worker_kind)),
                ));
                continue;
            };

            let run = Run {
                assignment: assignment.clone(),
                invocation_id,
                batch_id: batch.batch_id.clone(),
                worker,
                limiter: Arc::clone(&self.limiter),
                timeout: self
                    .timeouts
                    .effective_invocation_timeout(self.worker_timeouts.get(&assignment.worker_kind).copied()),
                cancel: batch.subscribe(),
                held: Arc::clone(&held),
                deadline,
                batch_timeout: self.timeouts.batch_timeout,
            };
            join_set.spawn(async move { (index, run.execute().await) });
        }

        while let Some(joined) = join_set.join_next().await {
            match joined {
                Ok((index, invocation)) => results[index] = Some(invocation),
                Err(err) => warn!(batch_id = %batch.batch_id, error = %err, "Invocation task failed to join"),
            }
        }

        // A panicking worker still yields an invocation.
        results
            .into_iter()
            .zip(assignments.iter())
            .enumerate()
            .map(|(index, (result, assignment))| {
                result.unwrap_or_else(|| {
                    finished(
                        assignment,
                        &batch.batch_id,
                        format!("{}-{:03}", batch.batch_id, index + 1),
                        Utc::now(),
                        Completion::Error("worker task panicked".to_string()),
                    )
                })
            })
            .collect()
    }
}

/// How an invocation ended, before it is turned into a record.
enum Completion {
    Output(WorkerOutput),
    Error(String),
    Timeout(Duration),
    /// The sub-batch deadline fired; carries the configured batch timeout.
    BatchDeadline(Duration),
    Cancelled,
    Held,
}

/// Everything one spawned invocation needs.
struct Run {
    assignment: Assignment,
    invocation_id: String,
    batch_id: String,
    worker: Arc<dyn Worker>,
    limiter: Arc<ConcurrencyLimiter>,
    timeout: Duration,
    cancel: watch::Receiver<bool>,
    held: Arc<AtomicBool>,
    /// End of the sub-batch; nothing starts or keeps running past it.
    deadline: Instant,
    batch_timeout: Duration,
}

impl Run {
    async fn execute(mut self) -> WorkerInvocation {
        let queued_at = Utc::now();
        let slot: ConcurrencySlot = tokio::select! {
            biased;
            _ = wait_cancelled(&mut self.cancel) => return self.finish(queued_at, Completion::Cancelled),
            slot = tokio::time::timeout_at(self.deadline, self.limiter.acquire(&self.assignment.external_resources)) => match slot {
                Ok(Ok(slot)) => slot,
                Ok(Err(err)) => return self.finish(queued_at, Completion::Error(err.to_string())),
                Err(_) => return self.finish(queued_at, Completion::BatchDeadline(self.batch_timeout)),
            },
        };

        if *self.cancel.borrow() {
            return self.finish(queued_at, Completion::Cancelled);
        }
        if self.held.load(Ordering::SeqCst) {
            debug!(invocation_id = %self.invocation_id, "Holding invocation for review");
            return self.finish(queued_at, Completion::Held);
        }
        if Instant::now() >= self.deadline {
            return self.finish(queued_at, Completion::BatchDeadline(self.batch_timeout));
        }

        let started_at = Utc::now();
        debug!(
            invocation_id = %self.invocation_id,
            task_id = %self.assignment.task_id,
            worker_kind = %self.assignment.worker_kind,
            "Starting worker"
        );
        let ctx = WorkerContext {
            invocation_id: self.invocation_id.clone(),
            batch_id: self.batch_id.clone(),
            cancel: self.cancel.clone(),
        };

        let limit = self
            .timeout
            .min(self.deadline.saturating_duration_since(Instant::now()));
        let mut cancel = self.cancel.clone();
        let completion = tokio::select! {
            biased;
            _ = wait_cancelled(&mut cancel) => Completion::Cancelled,
            result = tokio::time::timeout(limit, self.worker.run(&self.assignment, ctx)) => match result {
                Ok(Ok(output)) => Completion::Output(output),
                Ok(Err(err)) => Completion::Error(err.to_string()),
                Err(_) if limit < self.timeout => Completion::BatchDeadline(self.batch_timeout),
                Err(_) => Completion::Timeout(limit),
            },
        };
        if matches!(completion, Completion::Timeout(_) | Completion::BatchDeadline(_)) {
            warn!(
                invocation_id = %self.invocation_id,
                task_id = %self.assignment.task_id,
                timeout_ms = limit.as_millis() as u64,
                destructive = self.assignment.destructive,
                "Worker invocation timed out"
            );
            if self.assignment.destructive {
                self.held.store(true, Ordering::SeqCst);
            }
        }
        drop(slot);
        self.finish(started_at, completion)
    }

    fn finish(&self, started_at: DateTime<Utc>, completion: Completion) -> WorkerInvocation {
        finished(
            &self.assignment,
            &self.batch_id,
            self.invocation_id.clone(),
            started_at,
            completion,
        )
    }
}

fn finished(
    assignment: &Assignment,
    batch_id: &str,
    invocation_id: String,
    started_at: DateTime<Utc>,
    completion: Completion,
) -> WorkerInvocation {
    let (status, artifacts, output, error) = match completion {
        Completion::Output(out) => (out.self_reported_status, out.claimed_artifacts, out.output, None),
        Completion::Error(message) => (SelfReportedStatus::Error, Vec::new(), Value::Null, Some(message)),
        Completion::Timeout(after) => (
            SelfReportedStatus::Timeout,
            Vec::new(),
            Value::Null,
            Some(format!("timed out after {}ms", after.as_millis())),
        ),
        Completion::BatchDeadline(after) => (
            SelfReportedStatus::Timeout,
            Vec::new(),
            Value::Null,
            Some(format!("batch deadline of {}ms reached", after.as_millis())),
        ),
        Completion::Cancelled => (
            SelfReportedStatus::Cancelled,
            Vec::new(),
            Value::Null,
            Some("batch cancelled".to_string()),
        ),
        Completion::Held => (
            SelfReportedStatus::HeldForReview,
            Vec::new(),
            Value::Null,
            Some("held after a destructive invocation timed out".to_string()),
        ),
    };

    WorkerInvocation {
        invocation_id,
        batch_id: batch_id.to_string(),
        task_id: assignment.task_id.clone(),
        worker_kind: assignment.worker_kind,
        input_resources: assignment.resources.clone(),
        external_resources: assignment.external_resources.clone(),
        expectations: assignment.expectations.clone(),
        started_at,
        completed_at: Utc::now(),
        self_reported_status: status,
        claimed_artifacts: artifacts,
        output,
        error,
    }
}

async fn wait_cancelled(rx: &mut watch::Receiver<bool>) {
    loop {
        if *rx.borrow_and_update() {
            return;
        }
        if rx.changed().await.is_err() {
            // Sender gone without cancelling: never resolves.
            std::future::pending::<()>().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::limiter::LimitsConfig;
    use std::sync::atomic::AtomicUsize;

    /// Sleeps, then reports success with one claimed file; tracks peak concurrency.
    struct SleepyWorker {
        delay: Duration,
        running: AtomicUsize,
        peak: AtomicUsize,
        calls: AtomicUsize,
    }

    impl SleepyWorker {
        fn new(delay: Duration) -> Arc<Self> {
            Arc::new(Self {
                delay,
                running: AtomicUsize::new(0),
                peak: AtomicUsize::new(0),
                calls: AtomicUsize::new(0),
            })
        }
    }

    #[async_trait]
    impl Worker for SleepyWorker {
        async fn run(&self, assignment: &Assignment, _ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let now = self.running.fetch_add(1, Ordering::SeqCst) + 1;
            self.peak.fetch_max(now, Ordering::SeqCst);
            tokio::time::sleep(self.delay).await;
            self.running.fetch_sub(1, Ordering::SeqCst);
            Ok(WorkerOutput::success().with_artifact(ClaimedArtifact::FileWritten {
                path: format!("{}.txt", assignment.task_id),
            }))
        }
    }

    /// Sleeps for a task-specific time so timeouts can hit one sibling.
    struct PerTaskDelay;

    #[async_trait]
    impl Worker for PerTaskDelay {
        async fn run(&self, assignment: &Assignment, _ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
            let secs = if assignment.task_id == "slow" { 120 } else { 1 };
            tokio::time::sleep(Duration::from_secs(secs)).await;
            Ok(WorkerOutput::success())
        }
    }

    struct FailingWorker;

    #[async_trait]
    impl Worker for FailingWorker {
        async fn run(&self, _assignment: &Assignment, _ctx: WorkerContext) -> Result<WorkerOutput, WorkerError> {
            Err(WorkerError::Failed("model refused".to_string()))
        }
    }

    fn dispatcher(max: usize, timeout: Duration) -> WorkerDispatcher {
        let limiter = Arc::new(ConcurrencyLimiter::new(LimitsConfig::default().with_max_concurrency(max)));
        WorkerDispatcher::new(limiter, TimeoutConfig::new().with_invocation_timeout(timeout))
    }

    fn build(task: &str) -> Assignment {
        Assignment::new(task, WorkerKind::Build).with_write(format!("src/{}", task))
    }

    #[tokio::test(start_paused = true)]
    async fn test_one_invocation_per_assignment_in_order() {
        let worker = SleepyWorker::new(Duration::from_secs(1));
        let dispatcher = dispatcher(3, Duration::from_secs(60)).with_worker(WorkerKind::Build, worker.clone());
        let batch = dispatcher.new_batch();

        let invocations = dispatcher
            .dispatch(&batch, vec![build("a"), build("b"), build("c")])
            .await;

        let tasks: Vec<&str> = invocations.iter().map(|i| i.task_id.as_str()).collect();
        assert_eq!(tasks, vec!["a", "b", "c"]);
        for invocation in &invocations {
            assert_eq!(invocation.self_reported_status, SelfReportedStatus::Success);
            assert_eq!(invocation.batch_id, batch.batch_id());
            assert!(invocation.invocation_id.starts_with(batch.batch_id()));
            assert_eq!(invocation.claimed_artifacts.len(), 1);
        }
        assert_eq!(worker.calls.load(Ordering::SeqCst), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_global_ceiling_queues_extra_assignments() {
        let worker = SleepyWorker::new(Duration::from_secs(5));
        let dispatcher = dispatcher(2, Duration::from_secs(60)).with_worker(WorkerKind::Build, worker.clone());
        let batch = dispatcher.new_batch();

        let assignments = (0..6).map(|n| build(&format!("t{}", n))).collect();
        let invocations = dispatcher.dispatch(&batch, assignments).await;

        assert_eq!(invocations.len(), 6);
        assert_eq!(worker.peak.load(Ordering::SeqCst), 2);
        assert_eq!(dispatcher.limiter().available(), 2);
    }

    #[tokio::test(start_paused = true)]
    async fn test_per_resource_ceiling() {
        let worker = SleepyWorker::new(Duration::from_secs(5));
        let limiter = Arc::new(ConcurrencyLimiter::new(
            LimitsConfig::default().with_max_concurrency(10).with_per_resource_limit(1),
        ));
        let dispatcher = WorkerDispatcher::new(limiter, TimeoutConfig::new())
            .with_worker(WorkerKind::Build, worker.clone());
        let batch = dispatcher.new_batch();

        let assignments = (0..3)
            .map(|n| build(&format!("t{}", n)).with_external("tracker-api"))
            .collect();
        dispatcher.dispatch(&batch, assignments).await;
        assert_eq!(worker.peak.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_timeout_only_affects_that_invocation() {
        let dispatcher = dispatcher(3, Duration::from_secs(30)).with_worker(WorkerKind::Build, Arc::new(PerTaskDelay));
        let batch = dispatcher.new_batch();

        let invocations = dispatcher
            .dispatch(&batch, vec![build("fast"), build("slow"), build("other")])
            .await;

        assert_eq!(invocations[0].self_reported_status, SelfReportedStatus::Success);
        assert_eq!(invocations[1].self_reported_status, SelfReportedStatus::Timeout);
        assert!(invocations[1].error.as_deref().unwrap_or("").contains("30000ms"));
        assert_eq!(invocations[2].self_reported_status, SelfReportedStatus::Success);
        assert_eq!(dispatcher.limiter().available(), 3);
    }

    #[tokio::test(start_paused = true)]
    async fn test_destructive_timeout_holds_unstarted_siblings() {
        let worker = SleepyWorker::new(Duration::from_secs(300));
        let dispatcher = dispatcher(1, Duration::from_secs(10)).with_worker(WorkerKind::Build, worker.clone());
        let batch = dispatcher.new_batch();

        let invocations = dispatcher
            .dispatch(&batch, vec![build("migrate").destructive(), build("b"), build("c")])
            .await;

        assert_eq!(invocations[0].self_reported_status, SelfReportedStatus::Timeout);
        assert_eq!(invocations[1].self_reported_status, SelfReportedStatus::HeldForReview);
        assert_eq!(invocations[2].self_reported_status, SelfReportedStatus::HeldForReview);
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_cancel_stops_running_and_queued() {
        let worker = SleepyWorker::new(Duration::from_secs(600));
        let dispatcher = Arc::new(
            dispatcher(1, Duration::from_secs(3600)).with_worker(WorkerKind::Build, worker.clone()),
        );
        let batch = dispatcher.new_batch();

        let handle = {
            let dispatcher = Arc::clone(&dispatcher);
            let batch = batch.clone();
            tokio::spawn(async move { dispatcher.dispatch(&batch, vec![build("a"), build("b")]).await })
        };
        tokio::time::sleep(Duration::from_secs(1)).await;
        batch.cancel();

        let invocations = handle.await.expect("join");
        assert!(invocations
            .iter()
            .all(|i| i.self_reported_status == SelfReportedStatus::Cancelled));
        assert_eq!(worker.calls.load(Ordering::SeqCst), 1);
        assert_eq!(dispatcher.limiter().available(), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_batch_timeout_bounds_queued_invocations() {
        let worker = SleepyWorker::new(Duration::from_secs(50));
        let limiter = Arc::new(ConcurrencyLimiter::new(LimitsConfig::default().with_max_concurrency(1)));
        let timeouts = TimeoutConfig::new()
            .with_invocation_timeout(Duration::from_secs(60))
            .with_batch_timeout(Duration::from_secs(80));
        let dispatcher = WorkerDispatcher::new(limiter, timeouts).with_worker(WorkerKind::Build, worker.clone());
        let batch = dispatcher.new_batch();

        let invocations = dispatcher
            .dispatch(&batch, vec![build("a"), build("b"), build("c")])
            .await;

        assert_eq!(invocations[0].self_reported_status, SelfReportedStatus::Success);
        assert_eq!(invocations[1].self_reported_status, SelfReportedStatus::Timeout);
        assert_eq!(invocations[2].self_reported_status, SelfReportedStatus::Timeout);
        for queued in &invocations[1..] {
            let error = queued.error.as_deref().unwrap_or("");
            assert!(error.contains("batch deadline of 80000ms"), "{}", error);
        }
        assert_eq!(worker.calls.load(Ordering::SeqCst), 2);
    }

    #[tokio::test]
    async fn test_missing_worker_and_worker_error() {
        let dispatcher = dispatcher(2, Duration::from_secs(5)).with_worker(WorkerKind::Review, Arc::new(FailingWorker));
        let batch = dispatcher.new_batch();

        let invocations = dispatcher
            .dispatch(&batch, vec![build("a"), Assignment::new("b", WorkerKind::Review)])
            .await;

        assert_eq!(invocations[0].self_reported_status, SelfReportedStatus::Error);
        assert!(invocations[0].claimed_artifacts.is_empty());
        assert!(invocations[0].error.as_deref().unwrap_or("").contains("no worker registered"));
        assert_eq!(invocations[1].self_reported_status, SelfReportedStatus::Error);
        assert_eq!(invocations[1].error.as_deref(), Some("model refused"));
    }

    #[test]
    fn test_batch_ids_are_unique() {
        let dispatcher = dispatcher(1, Duration::from_secs(1));
        assert_ne!(dispatcher.new_batch().batch_id(), dispatcher.new_batch().batch_id());
    }
}
