//! In-memory collaborators with call counting and failure injection.
//!
//! Used by tests and dry runs: every call is counted, and a queue of
//! injected errors is drained before the real answer is given.

use std::collections::{BTreeMap, HashMap, HashSet, VecDeque};
use std::sync::atomic::{AtomicU32, AtomicU64, Ordering};
use std::sync::Mutex;

use async_trait::async_trait;

use super::{CheckRun, CheckRunner, Fields, PortError, PortResult, PullRequest, TaskTracker, VcsHost};

/// Queue of errors handed out before any real answer.
#[derive(Debug, Default)]
struct Faults {
    queue: Mutex<VecDeque<PortError>>,
    calls: AtomicU32,
}

impl Faults {
    fn push(&self, err: PortError, times: usize) {
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        for _ in 0..times {
            queue.push_back(err.clone());
        }
    }

    /// Count the call and return the next injected error, if any.
    fn enter(&self) -> PortResult<()> {
        self.calls.fetch_add(1, Ordering::SeqCst);
        let mut queue = self.queue.lock().unwrap_or_else(|p| p.into_inner());
        match queue.pop_front() {
            Some(err) => Err(err),
            None => Ok(()),
        }
    }

    fn calls(&self) -> u32 {
        self.calls.load(Ordering::SeqCst)
    }
}

/// Tracker keeping records in a map.
#[derive(Debug, Default)]
pub struct MemoryTracker {
    records: Mutex<BTreeMap<String, Fields>>,
    next_id: AtomicU64,
    faults: Faults,
}

impl MemoryTracker {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a record directly, bypassing call counting.
    pub fn insert(&self, id: impl Into<String>, fields: Fields) {
        self.lock().insert(id.into(), fields);
    }

    pub fn record(&self, id: &str) -> Option<Fields> {
        self.lock().get(id).cloned()
    }

    /// Fail the next `times` calls with `err`.
    pub fn fail_next(&self, err: PortError, times: usize) {
        self.faults.push(err, times);
    }

    pub fn calls(&self) -> u32 {
        self.faults.calls()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, BTreeMap<String, Fields>> {
        self.records.lock().unwrap_or_else(|p| p.into_inner())
    }
}

#[async_trait]
impl TaskTracker for MemoryTracker {
    async fn create_record(&self, fields: Fields) -> PortResult<String> {
        self.faults.enter()?;
        let id = format!("REC-{}", self.next_id.fetch_add(1, Ordering::SeqCst) + 1);
        self.lock().insert(id.clone(), fields);
        Ok(id)
    }

    async fn update_record(&self, id: &str, fields: Fields) -> PortResult<()> {
        self.faults.enter()?;
        let mut records = self.lock();
        let record = records
            .get_mut(id)
            .ok_or_else(|| PortError::NotFound(format!("record '{}'", id)))?;
        record.extend(fields);
        Ok(())
    }

    async fn query_record(&self, id: &str) -> PortResult<Option<Fields>> {
        self.faults.enter()?;
        Ok(self.lock().get(id).cloned())
    }
}

/// Version-control host backed by in-memory sets.
#[derive(Debug, Default)]
pub struct MemoryVcs {
    commits: Mutex<HashSet<String>>,
    branches: Mutex<HashSet<String>>,
    pull_requests: Mutex<HashMap<u64, PullRequest>>,
    faults: Faults,
}

impl MemoryVcs {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add_commit(&self, reference: impl Into<String>) {
        self.commits
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(reference.into());
    }

    pub fn add_branch(&self, name: impl Into<String>) {
        self.branches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(name.into());
    }

    pub fn add_pull_request(&self, pull_request: PullRequest) {
        self.pull_requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(pull_request.number, pull_request);
    }

    pub fn fail_next(&self, err: PortError, times: usize) {
        self.faults.push(err, times);
    }

    pub fn calls(&self) -> u32 {
        self.faults.calls()
    }
}

#[async_trait]
impl VcsHost for MemoryVcs {
    async fn branch_exists(&self, name: &str) -> PortResult<bool> {
        self.faults.enter()?;
        Ok(self
            .branches
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(name))
    }

    async fn commit_exists(&self, reference: &str) -> PortResult<bool> {
        self.faults.enter()?;
        Ok(self
            .commits
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .contains(reference))
    }

    async fn pr_exists(&self, number: u64) -> PortResult<Option<PullRequest>> {
        self.faults.enter()?;
        Ok(self
            .pull_requests
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(&number)
            .cloned())
    }
}

/// Check runner answering from a per-target script.
#[derive(Debug)]
pub struct ScriptedCheckRunner {
    results: Mutex<HashMap<String, CheckRun>>,
    fallback: CheckRun,
    faults: Faults,
}

impl Default for ScriptedCheckRunner {
    fn default() -> Self {
        Self::passing()
    }
}

impl ScriptedCheckRunner {
    /// Every target passes unless scripted otherwise.
    pub fn passing() -> Self {
        Self::with_fallback(CheckRun {
            exit_code: 0,
            output: "all checks passed".to_string(),
        })
    }

    /// Every target fails unless scripted otherwise.
    pub fn failing() -> Self {
        Self::with_fallback(CheckRun {
            exit_code: 1,
            output: "checks failed".to_string(),
        })
    }

    fn with_fallback(fallback: CheckRun) -> Self {
        Self {
            results: Mutex::new(HashMap::new()),
            fallback,
            faults: Faults::default(),
        }
    }

    pub fn script(&self, target: impl Into<String>, run: CheckRun) {
        self.results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .insert(target.into(), run);
    }

    pub fn fail_next(&self, err: PortError, times: usize) {
        self.faults.push(err, times);
    }

    pub fn calls(&self) -> u32 {
        self.faults.calls()
    }
}

#[async_trait]
impl CheckRunner for ScriptedCheckRunner {
    async fn run_checks(&self, target: &str) -> PortResult<CheckRun> {
        self.faults.enter()?;
        Ok(self
            .results
            .lock()
            .unwrap_or_else(|p| p.into_inner())
            .get(target)
            .cloned()
            .unwrap_or_else(|| self.fallback.clone()))
    }
}
