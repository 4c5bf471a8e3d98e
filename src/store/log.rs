use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use super::{StoreError, StoreResult};
use crate::model::{Estimate, Task, Transition};

const TASKS_FILE_NAME: &str = "tasks.jsonl";
const TRANSITIONS_FILE_NAME: &str = "transitions.jsonl";

/// The immutable part of a task, written once when it joins the backlog.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TaskDefinition {
    pub id: String,
    pub title: String,
    pub priority: u32,
    pub estimate: Estimate,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub external_id: Option<String>,
    pub created_at: DateTime<Utc>,
}

impl TaskDefinition {
    pub fn from_task(task: &Task) -> Self {
        Self {
            id: task.id.clone(),
            title: task.title.clone(),
            priority: task.priority,
            estimate: task.estimate,
            external_id: task.external_id.clone(),
            created_at: task.created_at,
        }
    }

    pub fn into_task(self) -> Task {
        let mut task = Task::new(self.id, self.title)
            .with_priority(self.priority)
            .with_estimate(self.estimate);
        task.external_id = self.external_id;
        task.created_at = self.created_at;
        task
    }
}

/// One line of the transition log.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogEntry {
    pub task_id: String,
    #[serde(flatten)]
    pub transition: Transition,
}

/// Append-only JSON Lines log of task definitions and transitions.
///
/// Current task state is never stored; it is rebuilt by replaying both files.
#[derive(Debug)]
pub struct StateLog {
    state_dir: PathBuf,
    writer: Mutex<()>,
}

impl StateLog {
    /// Open (creating if needed) the log under `state_dir`.
    ///
    /// A trailing line cut short by a crash is truncated so later appends
    /// start on a fresh line.
    pub fn open(state_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let state_dir = state_dir.into();
        fs::create_dir_all(&state_dir)?;
        let log = Self {
            state_dir,
            writer: Mutex::new(()),
        };
        log.repair_tail(&log.tasks_path())?;
        log.repair_tail(&log.transitions_path())?;
        Ok(log)
    }

    pub fn state_dir(&self) -> &Path {
        &self.state_dir
    }

    pub fn append_task(&self, definition: &TaskDefinition) -> StoreResult<()> {
        let json = serde_json::to_string(definition)?;
        self.append_line(&self.tasks_path(), &json)
    }

    pub fn append_transition(&self, task_id: &str, transition: &Transition) -> StoreResult<()> {
        let entry = LogEntry {
            task_id: task_id.to_string(),
            transition: transition.clone(),
        };
        let json = serde_json::to_string(&entry)?;
        self.append_line(&self.transitions_path(), &json)
    }

    /// Rebuild every task by replaying definitions, then transitions, in order.
    pub fn replay(&self) -> StoreResult<BTreeMap<String, Task>> {
        let mut tasks = BTreeMap::new();
        for (line, definition) in read_entries::<TaskDefinition>(&self.tasks_path())? {
            if tasks.contains_key(&definition.id) {
                return Err(StoreError::Corrupt {
                    path: self.tasks_path(),
                    line,
                    reason: format!("task '{}' defined twice", definition.id),
                });
            }
            tasks.insert(definition.id.clone(), definition.into_task());
        }

        let mut replayed = 0usize;
        for (line, entry) in read_entries::<LogEntry>(&self.transitions_path())? {
            let task = tasks.get_mut(&entry.task_id).ok_or_else(|| StoreError::Corrupt {
                path: self.transitions_path(),
                line,
                reason: format!("transition for unknown task '{}'", entry.task_id),
            })?;
            task.record(entry.transition);
            replayed += 1;
        }

        debug!(tasks = tasks.len(), transitions = replayed, "Replayed state log");
        Ok(tasks)
    }

    fn tasks_path(&self) -> PathBuf {
        self.state_dir.join(TASKS_FILE_NAME)
    }

    fn transitions_path(&self) -> PathBuf {
        self.state_dir.join(TRANSITIONS_FILE_NAME)
    }

    /// One `write_all` per line: with `O_APPEND` that keeps lines from
    /// separate processes sharing the log whole.
    fn append_line(&self, path: &Path, json: &str) -> StoreResult<()> {
        let mut line = Vec::with_capacity(json.len() + 1);
        line.extend_from_slice(json.as_bytes());
        line.push(b'\n');

        let _guard = self.writer.lock().unwrap_or_else(|p| p.into_inner());
        let mut file = fs::OpenOptions::new().create(true).append(true).open(path)?;
        file.write_all(&line)?;
        file.sync_all()?;
        Ok(())
    }

    fn repair_tail(&self, path: &Path) -> StoreResult<()> {
        let content = match fs::read_to_string(path) {
            Ok(content) => content,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(()),
            Err(err) => return Err(StoreError::Io(err)),
        };
        if content.is_empty() || content.ends_with('\n') {
            return Ok(());
        }
        let keep = content.rfind('\n').map(|i| i + 1).unwrap_or(0);
        warn!(
            path = %path.display(),
            dropped_bytes = content.len() - keep,
            "Truncating partial trailing log line"
        );
        let file = fs::OpenOptions::new().write(true).open(path)?;
        file.set_len(keep as u64)?;
        file.sync_all()?;
        Ok(())
    }
}

/// Parse every non-empty line, numbering from 1.
///
/// An unparseable final line without a newline is a torn write and is skipped;
/// anywhere else it is corruption.
fn read_entries<T: DeserializeOwned>(path: &Path) -> StoreResult<Vec<(usize, T)>> {
    let content = match fs::read_to_string(path) {
        Ok(content) => content,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
        Err(err) => return Err(StoreError::Io(err)),
    };
    let torn_tail = !content.is_empty() && !content.ends_with('\n');
    let lines: Vec<&str> = content.split('\n').collect();
    let last = lines.len().saturating_sub(1);

    let mut entries = Vec::new();
    for (index, raw) in lines.iter().enumerate() {
        if raw.trim().is_empty() {
            continue;
        }
        match serde_json::from_str::<T>(raw) {
            Ok(entry) => entries.push((index + 1, entry)),
            Err(err) if torn_tail && index == last => {
                warn!(path = %path.display(), line = index + 1, error = %err, "Ignoring torn trailing line");
            }
            Err(err) => {
                return Err(StoreError::Corrupt {
                    path: path.to_path_buf(),
                    line: index + 1,
                    reason: err.to_string(),
                })
            }
        }
    }
    Ok(entries)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{Actor, TaskState};
    use tempfile::TempDir;

    fn override_to(from: TaskState, to: TaskState) -> Transition {
        Transition {
            from_state: from,
            to_state: to,
            actor: Actor::Operator("ops".to_string()),
            timestamp: Utc::now(),
            evidence_ref: None,
            invocation_id: None,
            manual_override: true,
            annotation: false,
            note: Some("seed".to_string()),
        }
    }

    #[test]
    fn test_replay_rebuilds_state_and_history() {
        let temp_dir = TempDir::new().expect("temp dir");
        let log = StateLog::open(temp_dir.path().join("state")).expect("log");
        let task = Task::new("T-1", "Parser").with_priority(1);
        log.append_task(&TaskDefinition::from_task(&task)).expect("task");
        log.append_transition("T-1", &override_to(TaskState::Backlog, TaskState::ReadyForDesign))
            .expect("t1");
        log.append_transition("T-1", &override_to(TaskState::ReadyForDesign, TaskState::Blocked))
            .expect("t2");

        let reopened = StateLog::open(temp_dir.path().join("state")).expect("reopen");
        let tasks = reopened.replay().expect("replay");
        let task = &tasks["T-1"];
        assert_eq!(task.state, TaskState::Blocked);
        assert_eq!(task.priority, 1);
        assert_eq!(task.history.len(), 2);
        assert_eq!(task.blockers.len(), 1);
        assert_eq!(task.return_state(), Some(TaskState::ReadyForDesign));
    }

    #[test]
    fn test_torn_trailing_line_is_ignored_and_repaired() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dir = temp_dir.path().join("state");
        let log = StateLog::open(&dir).expect("log");
        log.append_task(&TaskDefinition::from_task(&Task::new("T-1", "One")))
            .expect("task");
        log.append_transition("T-1", &override_to(TaskState::Backlog, TaskState::OnHold))
            .expect("transition");

        let path = dir.join(TRANSITIONS_FILE_NAME);
        let mut file = fs::OpenOptions::new().append(true).open(&path).expect("open");
        write!(file, "{{\"task_id\":\"T-1\",\"from_st").expect("torn write");
        drop(file);

        assert_eq!(log.replay().expect("replay")["T-1"].state, TaskState::OnHold);

        let reopened = StateLog::open(&dir).expect("reopen");
        reopened
            .append_transition("T-1", &override_to(TaskState::OnHold, TaskState::Backlog))
            .expect("append after repair");
        let tasks = reopened.replay().expect("replay");
        assert_eq!(tasks["T-1"].state, TaskState::Backlog);
        assert_eq!(tasks["T-1"].history.len(), 2);
    }

    #[test]
    fn test_corrupt_interior_line_is_an_error() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dir = temp_dir.path().join("state");
        let log = StateLog::open(&dir).expect("log");
        log.append_task(&TaskDefinition::from_task(&Task::new("T-1", "One")))
            .expect("task");
        fs::OpenOptions::new()
            .append(true)
            .open(dir.join(TASKS_FILE_NAME))
            .and_then(|mut f| writeln!(f, "not json"))
            .expect("garbage");
        log.append_task(&TaskDefinition::from_task(&Task::new("T-2", "Two")))
            .expect("task");

        match log.replay() {
            Err(StoreError::Corrupt { line, .. }) => assert_eq!(line, 2),
            other => panic!("expected corruption, got {:?}", other.map(|t| t.len())),
        }
    }

    #[test]
    fn test_appends_from_separate_handles_stay_line_aligned() {
        let temp_dir = TempDir::new().expect("temp dir");
        let dir = temp_dir.path().join("state");
        let first = StateLog::open(&dir).expect("log");
        first
            .append_task(&TaskDefinition::from_task(&Task::new("T-1", "One")))
            .expect("task");

        let writers: Vec<_> = (0..2)
            .map(|_| {
                let log = StateLog::open(&dir).expect("second handle");
                std::thread::spawn(move || {
                    for _ in 0..50 {
                        log.append_transition("T-1", &override_to(TaskState::Backlog, TaskState::OnHold))
                            .expect("append");
                    }
                })
            })
            .collect();
        for writer in writers {
            writer.join().expect("writer thread");
        }

        let tasks = first.replay().expect("replay");
        assert_eq!(tasks["T-1"].history.len(), 100);
    }

    #[test]
    fn test_transition_for_unknown_task_is_corrupt() {
        let temp_dir = TempDir::new().expect("temp dir");
        let log = StateLog::open(temp_dir.path()).expect("log");
        log.append_transition("ghost", &override_to(TaskState::Backlog, TaskState::OnHold))
            .expect("append");
        assert!(matches!(log.replay(), Err(StoreError::Corrupt { .. })));
    }
}
