//! Individual checks. Each one queries a collaborator and records the raw answer.

use std::collections::{BTreeMap, BTreeSet};
use std::io;
use std::path::Path;

use chrono::{DateTime, SubsecRound, Utc};
use serde_json::Value;

use super::VerificationEngine;
use crate::conflict::normalize;
use crate::model::{CheckKind, CheckOutcome, ClaimedArtifact, WorkerInvocation};
use crate::ports::{Fields, PrState};

/// Answers already fetched during one verification, so a record or commit
/// referenced by several checks is only asked for once.
#[derive(Debug, Default)]
pub(super) struct RecordCache {
    records: BTreeMap<String, Result<Option<Fields>, String>>,
    commits: BTreeMap<String, Result<bool, String>>,
}

impl VerificationEngine {
    pub(super) async fn run_check(
        &self,
        kind: CheckKind,
        invocation: &WorkerInvocation,
        cache: &mut RecordCache,
    ) -> CheckOutcome {
        match kind {
            CheckKind::ResourceModified => self.resource_modified(invocation, cache).await,
            CheckKind::AutomatedChecksPass => {
                let target = invocation
                    .expectations
                    .target
                    .clone()
                    .or_else(|| self.config.default_check_target.clone());
                match target {
                    Some(target) => self.checks_pass(&target).await,
                    None => CheckOutcome::fail("no check target was declared for this assignment"),
                }
            }
            CheckKind::RecordOfWorkExists => self.record_of_work(invocation, cache).await,
            CheckKind::ReferencesCorrectArtifact => self.references_artifact(invocation, cache).await,
            CheckKind::CommitExists => {
                let commits: Vec<&str> = invocation
                    .claimed_artifacts
                    .iter()
                    .filter_map(|a| match a {
                        ClaimedArtifact::CommitCreated { reference } => Some(reference.as_str()),
                        _ => None,
                    })
                    .collect();
                if commits.is_empty() {
                    return CheckOutcome::fail("no commit was claimed");
                }
                let mut evidence = Vec::new();
                let mut found = false;
                for reference in commits {
                    let outcome = self.commit_check(reference, cache).await;
                    found |= outcome.pass;
                    evidence.push(outcome.evidence);
                }
                outcome(found, evidence)
            }
            CheckKind::NoUnexpectedChanges => no_unexpected_changes(invocation),
        }
    }

    /// The `artifact:*` check for one claimed artifact.
    pub(super) async fn check_artifact(
        &self,
        artifact: &ClaimedArtifact,
        invocation: &WorkerInvocation,
        cache: &mut RecordCache,
    ) -> CheckOutcome {
        match artifact {
            ClaimedArtifact::CommitCreated { reference } => self.commit_check(reference, cache).await,
            ClaimedArtifact::BranchCreated { name } => {
                let vcs = &self.vcs;
                let name = name.as_str();
                match self
                    .guarded(&self.config.vcs_resource, "branch_exists", move || vcs.branch_exists(name))
                    .await
                {
                    Ok(true) => CheckOutcome::pass(format!("branch {} exists", name)),
                    Ok(false) => CheckOutcome::fail(format!("branch {} not found on host", name)),
                    Err(err) => CheckOutcome::fail(err),
                }
            }
            ClaimedArtifact::PullRequestOpened { number } => {
                let vcs = &self.vcs;
                let number = *number;
                match self
                    .guarded(&self.config.vcs_resource, "pr_exists", move || vcs.pr_exists(number))
                    .await
                {
                    Ok(Some(pr)) if pr.state == PrState::Closed => {
                        CheckOutcome::fail(format!("pull request #{} is closed ({})", number, pr.url))
                    }
                    Ok(Some(pr)) => CheckOutcome::pass(format!(
                        "pull request #{} is {:?} at {}",
                        number, pr.state, pr.url
                    )),
                    Ok(None) => CheckOutcome::fail(format!("pull request #{} not found on host", number)),
                    Err(err) => CheckOutcome::fail(err),
                }
            }
            ClaimedArtifact::RecordCreated { record_id } => match self.query_record(record_id, cache).await {
                Ok(Some(_)) => CheckOutcome::pass(format!("record {} exists", record_id)),
                Ok(None) => CheckOutcome::fail(format!("record {} not found in tracker", record_id)),
                Err(err) => CheckOutcome::fail(err),
            },
            ClaimedArtifact::RecordUpdated { record_id, fields } => {
                match self.query_record(record_id, cache).await {
                    Ok(Some(actual)) => {
                        let mismatched: Vec<String> = fields
                            .iter()
                            .filter(|(key, expected)| actual.get(key.as_str()) != Some(*expected))
                            .map(|(key, expected)| {
                                format!(
                                    "{} is {} (claimed {})",
                                    key,
                                    actual.get(key.as_str()).cloned().unwrap_or(Value::Null),
                                    expected
                                )
                            })
                            .collect();
                        if mismatched.is_empty() {
                            CheckOutcome::pass(format!(
                                "record {} carries {} claimed field(s)",
                                record_id,
                                fields.len()
                            ))
                        } else {
                            CheckOutcome::fail(format!("record {}: {}", record_id, mismatched.join("; ")))
                        }
                    }
                    Ok(None) => CheckOutcome::fail(format!("record {} not found in tracker", record_id)),
                    Err(err) => CheckOutcome::fail(err),
                }
            }
            ClaimedArtifact::FileWritten { path } => self.file_check(path, invocation.started_at).await,
            ClaimedArtifact::ChecksPassed { target } => self.checks_pass(target).await,
        }
    }

    async fn resource_modified(&self, invocation: &WorkerInvocation, cache: &mut RecordCache) -> CheckOutcome {
        let declared: Vec<String> = invocation.declared_writes().filter_map(normalize).collect();
        if declared.is_empty() {
            return CheckOutcome::fail("no write resources were declared");
        }

        let mut evidence = Vec::new();
        let mut modified = false;
        for artifact in &invocation.claimed_artifacts {
            match artifact {
                ClaimedArtifact::FileWritten { path } => {
                    let inside = normalize(path)
                        .map(|p| declared.iter().any(|r| within(r, &p)))
                        .unwrap_or(false);
                    if !inside {
                        evidence.push(format!("{} is outside the declared write set", path));
                        continue;
                    }
                    let outcome = self.file_check(path, invocation.started_at).await;
                    modified |= outcome.pass;
                    evidence.push(outcome.evidence);
                }
                ClaimedArtifact::CommitCreated { reference } => {
                    let outcome = self.commit_check(reference, cache).await;
                    modified |= outcome.pass;
                    evidence.push(outcome.evidence);
                }
                _ => {}
            }
        }

        if evidence.is_empty() {
            return CheckOutcome::fail(format!(
                "no written file or commit was claimed for {}",
                declared.join(", ")
            ));
        }
        outcome(modified, evidence)
    }

    async fn record_of_work(&self, invocation: &WorkerInvocation, cache: &mut RecordCache) -> CheckOutcome {
        let ids = claimed_records(invocation);
        if ids.is_empty() {
            return CheckOutcome::fail("no record of work was claimed");
        }

        let expected_state = invocation.expectations.expected_record_state.as_deref();
        let mut evidence = Vec::new();
        let mut found = false;
        for id in ids {
            match self.query_record(id, cache).await {
                Ok(Some(fields)) => {
                    let owner = fields.get("task_id").and_then(Value::as_str);
                    let state = fields.get("state").and_then(Value::as_str);
                    if owner.is_none() {
                        evidence.push(format!("record {} carries no task_id", id));
                    } else if owner != Some(invocation.task_id.as_str()) {
                        evidence.push(format!(
                            "record {} belongs to task {}",
                            id,
                            owner.unwrap_or_default()
                        ));
                    } else if expected_state.is_some() && state != expected_state {
                        evidence.push(format!(
                            "record {} has state {:?}, expected {:?}",
                            id,
                            state.unwrap_or("<none>"),
                            expected_state.unwrap_or_default()
                        ));
                    } else {
                        found = true;
                        evidence.push(match state {
                            Some(state) => format!("record {} exists with state {:?}", id, state),
                            None => format!("record {} exists", id),
                        });
                    }
                }
                Ok(None) => evidence.push(format!("record {} not found in tracker", id)),
                Err(err) => evidence.push(err),
            }
        }
        outcome(found, evidence)
    }

    async fn references_artifact(&self, invocation: &WorkerInvocation, cache: &mut RecordCache) -> CheckOutcome {
        let Some(expected) = invocation.expectations.artifact_ref.as_deref() else {
            return CheckOutcome::fail("no artifact reference was declared for this review");
        };
        let ids = claimed_records(invocation);
        if ids.is_empty() {
            return CheckOutcome::fail(format!("no record of work was claimed to reference {}", expected));
        }

        let mut evidence = Vec::new();
        let mut found = false;
        for id in ids {
            match self.query_record(id, cache).await {
                Ok(Some(fields)) => {
                    if fields.values().any(|value| mentions(value, expected)) {
                        found = true;
                        evidence.push(format!("record {} references {}", id, expected));
                    } else {
                        evidence.push(format!("record {} does not reference {}", id, expected));
                    }
                }
                Ok(None) => evidence.push(format!("record {} not found in tracker", id)),
                Err(err) => evidence.push(err),
            }
        }
        outcome(found, evidence)
    }

    async fn checks_pass(&self, target: &str) -> CheckOutcome {
        let runner = &self.checks;
        match self
            .guarded(&self.config.ci_resource, "run_checks", move || runner.run_checks(target))
            .await
        {
            Ok(run) => {
                let evidence = format!("checks for {} exited with {}\n{}", target, run.exit_code, run.output);
                if run.passed() {
                    CheckOutcome::pass(evidence)
                } else {
                    CheckOutcome::fail(evidence)
                }
            }
            Err(err) => CheckOutcome::fail(err),
        }
    }

    async fn commit_check(&self, reference: &str, cache: &mut RecordCache) -> CheckOutcome {
        let answer = match cache.commits.get(reference) {
            Some(hit) => hit.clone(),
            None => {
                let vcs = &self.vcs;
                let answer = self
                    .guarded(&self.config.vcs_resource, "commit_exists", move || vcs.commit_exists(reference))
                    .await;
                cache.commits.insert(reference.to_string(), answer.clone());
                answer
            }
        };
        match answer {
            Ok(true) => CheckOutcome::pass(format!("commit {} exists", reference)),
            Ok(false) => CheckOutcome::fail(format!("commit {} not found on host", reference)),
            Err(err) => CheckOutcome::fail(err),
        }
    }

    async fn query_record(&self, id: &str, cache: &mut RecordCache) -> Result<Option<Fields>, String> {
        if let Some(hit) = cache.records.get(id) {
            return hit.clone();
        }
        let tracker = &self.tracker;
        let answer = self
            .guarded(&self.config.tracker_resource, "query_record", move || tracker.query_record(id))
            .await;
        cache.records.insert(id.to_string(), answer.clone());
        answer
    }

    /// The file must exist and have been modified no earlier than `since`.
    async fn file_check(&self, path: &str, since: DateTime<Utc>) -> CheckOutcome {
        let Some(relative) = normalize(path).filter(|p| is_workspace_relative(p)) else {
            return CheckOutcome::fail(format!("{} is not a path inside the workspace", path));
        };
        // Whole seconds: some filesystems only keep coarse mtimes.
        let since = since.trunc_subsecs(0);
        match tokio::fs::metadata(self.workspace_root.join(&relative)).await {
            Ok(meta) => match meta.modified().map(DateTime::<Utc>::from) {
                Ok(modified) if modified >= since => CheckOutcome::pass(format!(
                    "{} written at {} ({} bytes)",
                    relative,
                    modified.to_rfc3339(),
                    meta.len()
                )),
                Ok(modified) => CheckOutcome::fail(format!(
                    "{} last modified at {}, before the invocation started at {}",
                    relative,
                    modified.to_rfc3339(),
                    since.to_rfc3339()
                )),
                Err(err) => CheckOutcome::fail(format!("{} has no modification time: {}", relative, err)),
            },
            Err(err) if err.kind() == io::ErrorKind::NotFound => {
                CheckOutcome::fail(format!("{} not found in workspace", relative))
            }
            Err(err) => CheckOutcome::fail(format!("{} could not be read: {}", relative, err)),
        }
    }
}

/// Claimed writes must stay inside the declared write set; an assignment with
/// no resources may not claim any file or commit at all.
pub(super) fn no_unexpected_changes(invocation: &WorkerInvocation) -> CheckOutcome {
    if invocation.input_resources.is_empty() {
        let writes: Vec<String> = invocation
            .claimed_artifacts
            .iter()
            .filter(|a| a.is_write())
            .map(ClaimedArtifact::check_key)
            .collect();
        return if writes.is_empty() {
            CheckOutcome::pass("no resources declared and no writes claimed")
        } else {
            CheckOutcome::fail(format!("no resources were declared but claimed {}", writes.join(", ")))
        };
    }

    let declared: Vec<String> = invocation.declared_writes().filter_map(normalize).collect();
    let outside: Vec<&str> = invocation
        .claimed_artifacts
        .iter()
        .filter_map(|a| match a {
            ClaimedArtifact::FileWritten { path } => Some(path.as_str()),
            _ => None,
        })
        .filter(|path| {
            !normalize(path)
                .map(|p| declared.iter().any(|r| within(r, &p)))
                .unwrap_or(false)
        })
        .collect();

    if outside.is_empty() {
        CheckOutcome::pass(format!("all claimed writes are within {}", declared.join(", ")))
    } else {
        CheckOutcome::fail(format!("writes outside the declared set: {}", outside.join(", ")))
    }
}

fn outcome(pass: bool, evidence: Vec<String>) -> CheckOutcome {
    let evidence = evidence.join("\n");
    if pass {
        CheckOutcome::pass(evidence)
    } else {
        CheckOutcome::fail(evidence)
    }
}

fn claimed_records(invocation: &WorkerInvocation) -> Vec<&str> {
    let ids: BTreeSet<&str> = invocation
        .claimed_artifacts
        .iter()
        .filter_map(ClaimedArtifact::record_id)
        .collect();
    ids.into_iter().collect()
}

/// Whether a normalized `path` falls within a normalized declared `resource`.
pub(super) fn within(resource: &str, path: &str) -> bool {
    if resource == path {
        return true;
    }
    if path.len() > resource.len() && path.starts_with(resource) && path.as_bytes()[resource.len()] == b'/' {
        return true;
    }
    resource.contains(['*', '?', '['])
        && glob::Pattern::new(resource)
            .map(|pattern| pattern.matches(path))
            .unwrap_or(false)
}

fn is_workspace_relative(path: &str) -> bool {
    let path = Path::new(path);
    !path.is_absolute()
        && path
            .components()
            .all(|c| matches!(c, std::path::Component::Normal(_)))
}

fn mentions(value: &Value, needle: &str) -> bool {
    match value {
        Value::String(text) => text.contains(needle),
        Value::Number(number) => number.to_string() == needle,
        Value::Array(items) => items.iter().any(|item| mentions(item, needle)),
        Value::Object(map) => map.values().any(|item| mentions(item, needle)),
        _ => false,
    }
}
