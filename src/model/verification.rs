//! Verification verdicts and their per-check evidence.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};

use super::WorkerKind;

/// Outcome of a single independently derived check.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CheckOutcome {
    pub pass: bool,
    /// Raw evidence from the external system (or the reason no evidence exists).
    pub evidence: String,
    pub required: bool,
}

impl CheckOutcome {
    pub fn pass(evidence: impl Into<String>) -> Self {
        Self {
            pass: true,
            evidence: evidence.into(),
            required: true,
        }
    }

    pub fn fail(evidence: impl Into<String>) -> Self {
        Self {
            pass: false,
            evidence: evidence.into(),
            required: true,
        }
    }

    pub fn optional(mut self) -> Self {
        self.required = false;
        self
    }
}

/// Verdict for one invocation.
///
/// `verified` is only ever computed from the checks; there is no way to build
/// a result that claims verification without a passing required check. A
/// stored `verified` flag is ignored on load and recomputed.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(from = "StoredVerdict")]
pub struct VerificationResult {
    pub invocation_id: String,
    pub task_id: String,
    pub worker_kind: WorkerKind,
    pub checks: BTreeMap<String, CheckOutcome>,
    verified: bool,
    pub verified_at: DateTime<Utc>,
}

/// Archived form of a verdict, minus the derived `verified` flag.
#[derive(Deserialize)]
struct StoredVerdict {
    invocation_id: String,
    task_id: String,
    worker_kind: WorkerKind,
    checks: BTreeMap<String, CheckOutcome>,
    verified_at: DateTime<Utc>,
}

impl From<StoredVerdict> for VerificationResult {
    fn from(stored: StoredVerdict) -> Self {
        Self {
            verified: all_required_pass(&stored.checks),
            invocation_id: stored.invocation_id,
            task_id: stored.task_id,
            worker_kind: stored.worker_kind,
            checks: stored.checks,
            verified_at: stored.verified_at,
        }
    }
}

fn all_required_pass(checks: &BTreeMap<String, CheckOutcome>) -> bool {
    let mut required = checks.values().filter(|c| c.required).peekable();
    required.peek().is_some() && required.all(|c| c.pass)
}

impl VerificationResult {
    /// Build a verdict: verified iff there is at least one required check and all of them pass.
    pub fn from_checks(
        invocation_id: impl Into<String>,
        task_id: impl Into<String>,
        worker_kind: WorkerKind,
        checks: BTreeMap<String, CheckOutcome>,
    ) -> Self {
        let verified = all_required_pass(&checks);
        Self {
            invocation_id: invocation_id.into(),
            task_id: task_id.into(),
            worker_kind,
            checks,
            verified,
            verified_at: Utc::now(),
        }
    }

    pub fn is_verified(&self) -> bool {
        self.verified
    }

    /// Add a check after the fact, recomputing the verdict.
    ///
    /// Adding a failing required check can only ever revoke verification.
    pub fn with_check(mut self, name: impl Into<String>, outcome: CheckOutcome) -> Self {
        self.checks.insert(name.into(), outcome);
        self.verified = all_required_pass(&self.checks);
        self
    }

    /// Required checks that did not pass, with their evidence.
    pub fn failing_checks(&self) -> Vec<(&str, &CheckOutcome)> {
        self.checks
            .iter()
            .filter(|(_, c)| c.required && !c.pass)
            .map(|(name, c)| (name.as_str(), c))
            .collect()
    }

    /// Content-addressed reference used by transitions: `<invocation_id>#<digest>`.
    pub fn evidence_ref(&self) -> String {
        let mut hasher = Sha256::new();
        hasher.update(self.invocation_id.as_bytes());
        for (name, outcome) in &self.checks {
            hasher.update(name.as_bytes());
            hasher.update([outcome.pass as u8, outcome.required as u8]);
            hasher.update(outcome.evidence.as_bytes());
        }
        hasher.update(self.verified_at.to_rfc3339().as_bytes());
        let digest = hex::encode(hasher.finalize());
        format!("{}#{}", self.invocation_id, &digest[..16])
    }

    /// One-line summary for logs and reports.
    pub fn summary(&self) -> String {
        let failing = self.failing_checks();
        if self.verified {
            format!("verified ({} checks passed)", self.checks.len())
        } else if self.checks.values().all(|c| !c.required) {
            "not verified: no required checks were performed".to_string()
        } else {
            let names: Vec<&str> = failing.iter().map(|(name, _)| *name).collect();
            format!("not verified: failing {}", names.join(", "))
        }
    }
}
