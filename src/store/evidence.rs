use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::debug;

use super::{validate_id, StoreError, StoreResult};
use crate::model::{VerificationResult, WorkerInvocation};

const RECORD_EXTENSION: &str = "json";

/// Archived verdict together with the invocation it judged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EvidenceRecord {
    pub evidence_ref: String,
    pub invocation: WorkerInvocation,
    pub verification: VerificationResult,
    pub archived_at: DateTime<Utc>,
}

/// Immutable archive of verification results, one file per verdict.
///
/// Files are named `<invocation_id>.<digest>.json` after the evidence ref, so
/// re-verifying an invocation adds a record instead of replacing one.
#[derive(Debug, Clone)]
pub struct EvidenceStore {
    root_dir: PathBuf,
}

impl EvidenceStore {
    pub fn new(root_dir: impl Into<PathBuf>) -> StoreResult<Self> {
        let root_dir = root_dir.into();
        fs::create_dir_all(&root_dir)?;
        Ok(Self { root_dir })
    }

    pub fn root_dir(&self) -> &Path {
        &self.root_dir
    }

    /// Archive a verdict and return its evidence ref.
    pub fn save(
        &self,
        invocation: &WorkerInvocation,
        verification: &VerificationResult,
    ) -> StoreResult<String> {
        validate_id(&invocation.invocation_id)?;
        let evidence_ref = verification.evidence_ref();
        let record = EvidenceRecord {
            evidence_ref: evidence_ref.clone(),
            invocation: invocation.clone(),
            verification: verification.clone(),
            archived_at: Utc::now(),
        };

        let path = self.path_for(&evidence_ref)?;
        let json = serde_json::to_string_pretty(&record)?;
        let temp_path = path.with_extension(format!("{}.tmp", RECORD_EXTENSION));

        let mut file = fs::File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, &path)?;

        debug!(
            invocation_id = %invocation.invocation_id,
            evidence_ref = %evidence_ref,
            "Archived verification evidence"
        );
        Ok(evidence_ref)
    }

    /// Load the record an evidence ref points at.
    pub fn load(&self, evidence_ref: &str) -> StoreResult<Option<EvidenceRecord>> {
        let path = self.path_for(evidence_ref)?;
        match fs::read_to_string(&path) {
            Ok(content) => Ok(Some(serde_json::from_str(&content)?)),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(err) => Err(StoreError::Io(err)),
        }
    }

    /// Every archived record for a task, oldest first.
    pub fn list_for_task(&self, task_id: &str) -> StoreResult<Vec<EvidenceRecord>> {
        let mut records = Vec::new();
        for entry in fs::read_dir(&self.root_dir)? {
            let path = entry?.path();
            if path.extension().and_then(|e| e.to_str()) != Some(RECORD_EXTENSION) {
                continue;
            }
            let content = fs::read_to_string(&path)?;
            let record: EvidenceRecord = serde_json::from_str(&content)?;
            if record.invocation.task_id == task_id {
                records.push(record);
            }
        }
        records.sort_by(|a, b| a.archived_at.cmp(&b.archived_at));
        Ok(records)
    }

    /// The most recently archived record for a task.
    pub fn latest_for_task(&self, task_id: &str) -> StoreResult<Option<EvidenceRecord>> {
        Ok(self.list_for_task(task_id)?.pop())
    }

    fn path_for(&self, evidence_ref: &str) -> StoreResult<PathBuf> {
        let (invocation_id, digest) = evidence_ref
            .split_once('#')
            .ok_or_else(|| StoreError::InvalidId(evidence_ref.to_string()))?;
        validate_id(invocation_id)?;
        if digest.is_empty() || !digest.chars().all(|c| c.is_ascii_hexdigit()) {
            return Err(StoreError::InvalidId(evidence_ref.to_string()));
        }
        Ok(self
            .root_dir
            .join(format!("{}.{}.{}", invocation_id, digest, RECORD_EXTENSION)))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::{CheckOutcome, SelfReportedStatus, WorkerKind};
    use std::collections::BTreeMap;
    use tempfile::TempDir;

    fn invocation(id: &str, task: &str) -> WorkerInvocation {
        WorkerInvocation {
            invocation_id: id.to_string(),
            batch_id: "batch-1".to_string(),
            task_id: task.to_string(),
            worker_kind: WorkerKind::Review,
            input_resources: Vec::new(),
            external_resources: Vec::new(),
            expectations: Default::default(),
            started_at: Utc::now(),
            completed_at: Utc::now(),
            self_reported_status: SelfReportedStatus::Success,
            claimed_artifacts: Vec::new(),
            output: serde_json::Value::Null,
            error: None,
        }
    }

    fn verdict(inv: &WorkerInvocation, pass: bool) -> VerificationResult {
        let mut checks = BTreeMap::new();
        let outcome = if pass {
            CheckOutcome::pass("record REC-1 exists")
        } else {
            CheckOutcome::fail("record REC-1 missing")
        };
        checks.insert("record_of_work_exists".to_string(), outcome);
        VerificationResult::from_checks(&inv.invocation_id, &inv.task_id, inv.worker_kind, checks)
    }

    #[test]
    fn test_save_and_load_by_ref() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::new(temp_dir.path().join("evidence")).expect("store");
        let inv = invocation("inv-1", "T-1");
        let result = verdict(&inv, true);

        let evidence_ref = store.save(&inv, &result).expect("save");
        assert_eq!(evidence_ref, result.evidence_ref());

        let record = store.load(&evidence_ref).expect("load").expect("exists");
        assert!(record.verification.is_verified());
        assert_eq!(record.invocation.task_id, "T-1");
        assert!(store.load("inv-1#00ff").expect("load").is_none());
    }

    #[test]
    fn test_reverification_adds_a_record() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::new(temp_dir.path()).expect("store");
        let inv = invocation("inv-2", "T-9");

        let first = store.save(&inv, &verdict(&inv, false)).expect("first");
        std::thread::sleep(std::time::Duration::from_millis(5));
        let second = store.save(&inv, &verdict(&inv, true)).expect("second");
        assert_ne!(first, second);

        let records = store.list_for_task("T-9").expect("list");
        assert_eq!(records.len(), 2);
        let latest = store.latest_for_task("T-9").expect("latest").expect("some");
        assert_eq!(latest.evidence_ref, second);
        assert!(store.latest_for_task("T-404").expect("latest").is_none());
    }

    #[test]
    fn test_rejects_malformed_refs() {
        let temp_dir = TempDir::new().expect("temp dir");
        let store = EvidenceStore::new(temp_dir.path()).expect("store");
        for bad in ["no-hash", "../x#abcd", "inv-1#zz", "inv-1#"] {
            assert!(matches!(store.load(bad), Err(StoreError::InvalidId(_))), "{}", bad);
        }
    }
}
