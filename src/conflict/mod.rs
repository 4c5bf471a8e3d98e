//! Pre-flight write-conflict detection for a batch of assignments.
//!
//! Resources are compared after normalization. Anything that could refer to
//! the same thing is treated as overlapping: identical paths, a directory and
//! a path below it, and a glob and anything it could match.

use std::collections::BTreeSet;

use glob::Pattern;
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tracing::{debug, info};

use crate::model::{Assignment, Intent};

const GLOB_META: [char; 3] = ['*', '?', '['];

/// What to do when a batch contains conflicting assignments.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictPolicy {
    /// Split into sequential sub-batches.
    #[default]
    Split,
    /// Refuse the whole batch.
    Reject,
}

/// Two assignments that must not run concurrently.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ResourceConflict {
    pub resource: String,
    pub first_task: String,
    pub second_task: String,
}

/// Errors raised while checking a batch.
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConflictError {
    #[error("assignment for task '{task_id}' declares an invalid resource '{resource}'")]
    InvalidResource { task_id: String, resource: String },

    #[error("assignment at position {index} has an empty task id")]
    EmptyTaskId { index: usize },

    #[error("batch rejected: {} conflicting assignment pair(s)", .conflicts.len())]
    Rejected { conflicts: Vec<ResourceConflict> },
}

/// Result type for conflict detection.
pub type ConflictResult<T> = Result<T, ConflictError>;

/// Write footprint of one assignment after normalization.
#[derive(Debug)]
struct Footprint {
    task_id: String,
    writes: BTreeSet<String>,
}

/// Splits or rejects batches whose assignments write overlapping resources.
#[derive(Debug, Clone, Default)]
pub struct ConflictDetector {
    policy: ConflictPolicy,
}

impl ConflictDetector {
    pub fn new(policy: ConflictPolicy) -> Self {
        Self { policy }
    }

    pub fn policy(&self) -> ConflictPolicy {
        self.policy
    }

    /// Partition `assignments` into sub-batches that are each conflict-free.
    ///
    /// Assignments are placed greedily into the first sub-batch they do not
    /// conflict with, in input order. Nothing is ever dropped.
    pub fn check_batch(&self, assignments: &[Assignment]) -> ConflictResult<Vec<Vec<Assignment>>> {
        let footprints = footprints(assignments)?;

        if self.policy == ConflictPolicy::Reject {
            let conflicts = pairwise_conflicts(&footprints);
            if !conflicts.is_empty() {
                info!(conflicts = conflicts.len(), "Rejecting conflicting batch");
                return Err(ConflictError::Rejected { conflicts });
            }
        }

        let mut groups: Vec<Vec<usize>> = Vec::new();
        for (index, footprint) in footprints.iter().enumerate() {
            let slot = groups.iter().position(|group| {
                group
                    .iter()
                    .all(|&other| conflict_between(&footprints[other], footprint).is_none())
            });
            match slot {
                Some(position) => groups[position].push(index),
                None => groups.push(vec![index]),
            }
        }

        if groups.len() > 1 {
            info!(
                assignments = assignments.len(),
                sub_batches = groups.len(),
                "Split batch to avoid write conflicts"
            );
        }

        Ok(groups
            .into_iter()
            .map(|group| group.into_iter().map(|i| assignments[i].clone()).collect())
            .collect())
    }

    /// Every conflicting pair in the batch, in input order.
    pub fn find_conflicts(&self, assignments: &[Assignment]) -> ConflictResult<Vec<ResourceConflict>> {
        let footprints = footprints(assignments)?;
        Ok(pairwise_conflicts(&footprints))
    }
}

fn footprints(assignments: &[Assignment]) -> ConflictResult<Vec<Footprint>> {
    assignments
        .iter()
        .enumerate()
        .map(|(index, assignment)| {
            if assignment.task_id.trim().is_empty() {
                return Err(ConflictError::EmptyTaskId { index });
            }

            // A resource declared with both intents resolves to write.
            let mut writes = BTreeSet::new();
            let mut reads = BTreeSet::new();
            for claim in &assignment.resources {
                let resource = normalize(&claim.resource).ok_or_else(|| {
                    ConflictError::InvalidResource {
                        task_id: assignment.task_id.clone(),
                        resource: claim.resource.clone(),
                    }
                })?;
                if is_glob(&resource) && Pattern::new(&resource).is_err() {
                    return Err(ConflictError::InvalidResource {
                        task_id: assignment.task_id.clone(),
                        resource: claim.resource.clone(),
                    });
                }
                match claim.intent {
                    Intent::Write => {
                        writes.insert(resource);
                    }
                    Intent::Read => {
                        reads.insert(resource);
                    }
                }
            }
            debug!(
                task_id = %assignment.task_id,
                writes = writes.len(),
                reads = reads.difference(&writes).count(),
                "Computed assignment footprint"
            );

            Ok(Footprint {
                task_id: assignment.task_id.clone(),
                writes,
            })
        })
        .collect()
}

fn pairwise_conflicts(footprints: &[Footprint]) -> Vec<ResourceConflict> {
    let mut conflicts = Vec::new();
    for (i, first) in footprints.iter().enumerate() {
        for second in &footprints[i + 1..] {
            if let Some(resource) = conflict_between(first, second) {
                conflicts.push(ResourceConflict {
                    resource,
                    first_task: first.task_id.clone(),
                    second_task: second.task_id.clone(),
                });
            }
        }
    }
    conflicts
}

/// The resource two footprints collide on, if any. Same task always collides.
fn conflict_between(a: &Footprint, b: &Footprint) -> Option<String> {
    if a.task_id == b.task_id {
        return Some(format!("task:{}", a.task_id));
    }
    a.writes.iter().find_map(|left| {
        b.writes
            .iter()
            .find(|right| overlaps(left, right))
            .map(|right| {
                if left.len() <= right.len() {
                    left.to_string()
                } else {
                    right.to_string()
                }
            })
    })
}

/// Normalize a resource name: trim, drop leading `./`, collapse `//`, drop trailing `/`.
///
/// Returns `None` for names that are empty after normalization.
pub fn normalize(resource: &str) -> Option<String> {
    let mut value = resource.trim();
    while let Some(rest) = value.strip_prefix("./") {
        value = rest;
    }
    let mut normalized = String::with_capacity(value.len());
    for part in value.split('/') {
        if part.is_empty() || part == "." {
            continue;
        }
        if !normalized.is_empty() {
            normalized.push('/');
        }
        normalized.push_str(part);
    }
    if value.starts_with('/') {
        normalized.insert(0, '/');
    }
    if normalized.is_empty() || normalized == "/" {
        None
    } else {
        Some(normalized)
    }
}

/// Whether two normalized resources could refer to the same thing.
pub fn overlaps(a: &str, b: &str) -> bool {
    if a == b || is_path_prefix(a, b) || is_path_prefix(b, a) {
        return true;
    }
    match (is_glob(a), is_glob(b)) {
        (false, false) => false,
        (true, false) => glob_touches(a, b),
        (false, true) => glob_touches(b, a),
        (true, true) => {
            let (left, right) = (literal_prefix(a), literal_prefix(b));
            left.starts_with(right) || right.starts_with(left)
        }
    }
}

fn is_glob(resource: &str) -> bool {
    resource.contains(GLOB_META)
}

fn is_path_prefix(dir: &str, path: &str) -> bool {
    path.len() > dir.len() && path.starts_with(dir) && path[dir.len()..].starts_with('/')
}

fn literal_prefix(pattern: &str) -> &str {
    match pattern.find(GLOB_META) {
        Some(index) => &pattern[..index],
        None => pattern,
    }
}

/// A glob touches a path if it matches it, or if the path is a directory the glob reaches into.
fn glob_touches(pattern: &str, path: &str) -> bool {
    let matches = Pattern::new(pattern)
        .map(|compiled| compiled.matches(path))
        // Unparseable globs are rejected earlier; treat any leftover as overlapping.
        .unwrap_or(true);
    if matches {
        return true;
    }
    let literal = literal_prefix(pattern);
    literal.starts_with(path) && literal[path.len()..].starts_with('/')
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::WorkerKind;

    fn write(task: &str, resources: &[&str]) -> Assignment {
        resources
            .iter()
            .fold(Assignment::new(task, WorkerKind::Build), |a, r| a.with_write(*r))
    }

    fn task_ids(batches: &[Vec<Assignment>]) -> Vec<Vec<String>> {
        batches
            .iter()
            .map(|batch| batch.iter().map(|a| a.task_id.clone()).collect())
            .collect()
    }

    #[test]
    fn test_shared_write_splits_into_two_sub_batches() {
        let detector = ConflictDetector::default();
        let batch = vec![
            write("A", &["src/utils"]),
            write("B", &["docs/guide.md"]),
            write("C", &["./src/utils/"]),
        ];

        let batches = detector.check_batch(&batch).expect("split");
        assert_eq!(
            task_ids(&batches),
            vec![vec!["A".to_string(), "B".to_string()], vec!["C".to_string()]]
        );
    }

    #[test]
    fn test_read_write_pairs_do_not_conflict() {
        let detector = ConflictDetector::default();
        let batch = vec![
            write("A", &["src/lib.rs"]),
            Assignment::new("B", WorkerKind::Review).with_read("src/lib.rs"),
            Assignment::new("C", WorkerKind::Review).with_read("src/lib.rs"),
        ];

        let batches = detector.check_batch(&batch).expect("no split");
        assert_eq!(batches.len(), 1);
        assert_eq!(batches[0].len(), 3);
    }

    #[test]
    fn test_zero_resource_assignments_always_parallelize() {
        let detector = ConflictDetector::default();
        let batch = vec![
            Assignment::new("A", WorkerKind::Planning),
            write("B", &["src"]),
            Assignment::new("C", WorkerKind::Planning),
        ];
        assert_eq!(detector.check_batch(&batch).expect("ok").len(), 1);
    }

    #[test]
    fn test_same_task_twice_conflicts() {
        let detector = ConflictDetector::default();
        let batch = vec![
            Assignment::new("A", WorkerKind::Design),
            Assignment::new("A", WorkerKind::Architecture),
        ];
        let batches = detector.check_batch(&batch).expect("split");
        assert_eq!(batches.len(), 2);

        let conflicts = detector.find_conflicts(&batch).expect("conflicts");
        assert_eq!(conflicts[0].resource, "task:A");
    }

    #[test]
    fn test_mixed_intents_resolve_to_write() {
        let detector = ConflictDetector::default();
        let batch = vec![
            Assignment::new("A", WorkerKind::Build)
                .with_read("src/main.rs")
                .with_write("src/main.rs"),
            write("B", &["src/main.rs"]),
        ];
        assert_eq!(detector.check_batch(&batch).expect("split").len(), 2);
    }

    #[test]
    fn test_empty_resource_is_invalid() {
        let detector = ConflictDetector::default();
        let batch = vec![write("A", &["  ./ "])];
        assert!(matches!(
            detector.check_batch(&batch),
            Err(ConflictError::InvalidResource { .. })
        ));
    }

    #[test]
    fn test_empty_task_id_is_rejected() {
        let detector = ConflictDetector::default();
        let batch = vec![write("A", &["x"]), write(" ", &["y"])];
        assert_eq!(
            detector.check_batch(&batch).unwrap_err(),
            ConflictError::EmptyTaskId { index: 1 }
        );
    }

    #[test]
    fn test_reject_policy_refuses_conflicting_batch() {
        let detector = ConflictDetector::new(ConflictPolicy::Reject);
        let batch = vec![write("A", &["src/utils"]), write("C", &["src/utils/mod.rs"])];

        match detector.check_batch(&batch) {
            Err(ConflictError::Rejected { conflicts }) => {
                assert_eq!(conflicts.len(), 1);
                assert_eq!(conflicts[0].resource, "src/utils");
                assert_eq!(conflicts[0].first_task, "A");
            }
            other => panic!("expected rejection, got {:?}", other),
        }

        let clean = vec![write("A", &["src/a.rs"]), write("B", &["src/b.rs"])];
        assert_eq!(detector.check_batch(&clean).expect("clean").len(), 1);
    }

    #[test]
    fn test_normalize() {
        assert_eq!(normalize("./src/utils/").as_deref(), Some("src/utils"));
        assert_eq!(normalize("src//utils/./x").as_deref(), Some("src/utils/x"));
        assert_eq!(normalize("/abs/path/").as_deref(), Some("/abs/path"));
        assert_eq!(normalize("record:T-1").as_deref(), Some("record:T-1"));
        assert_eq!(normalize(""), None);
        assert_eq!(normalize("./"), None);
    }

    #[test]
    fn test_overlap_rules() {
        assert!(overlaps("src/utils", "src/utils"));
        assert!(overlaps("src", "src/utils/mod.rs"));
        assert!(!overlaps("src/util", "src/utils"));
        assert!(overlaps("src/*.rs", "src/lib.rs"));
        assert!(overlaps("src/utils/*.rs", "src/utils"));
        assert!(!overlaps("src/*.rs", "docs/guide.md"));
        assert!(overlaps("src/**/*.rs", "src/a/*.toml"));
        assert!(!overlaps("docs/*.md", "src/*.rs"));
    }

    #[test]
    fn test_overlapping_writes_never_share_a_sub_batch() {
        let pool = [
            "src", "src/utils", "src/utils/mod.rs", "src/*.rs", "docs", "docs/a.md", "tests",
            "record:T-9",
        ];
        let detector = ConflictDetector::default();

        // Deterministic pseudo-random batches over the resource pool.
        let mut seed: u64 = 0x5eed;
        for round in 0..200 {
            let mut batch = Vec::new();
            let size = 2 + (round % 6);
            for i in 0..size {
                seed = seed.wrapping_mul(6364136223846793005).wrapping_add(1442695040888963407);
                let first = pool[(seed >> 33) as usize % pool.len()];
                let second = pool[(seed >> 17) as usize % pool.len()];
                let mut assignment = Assignment::new(format!("T-{}", i), WorkerKind::Build)
                    .with_write(first);
                if seed % 3 == 0 {
                    assignment = assignment.with_read(second);
                } else if seed % 3 == 1 {
                    assignment = assignment.with_write(second);
                }
                batch.push(assignment);
            }

            let batches = detector.check_batch(&batch).expect("split");
            let total: usize = batches.iter().map(Vec::len).sum();
            assert_eq!(total, batch.len(), "no assignment may be dropped");

            for sub in &batches {
                assert!(
                    detector.find_conflicts(sub).expect("conflicts").is_empty(),
                    "sub-batch {:?} contains a conflict",
                    sub.iter().map(|a| &a.task_id).collect::<Vec<_>>()
                );
            }
        }
    }
}
