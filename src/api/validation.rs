//! Purpose: Provide a stable, serializable validation report for a store/index pair.
//! Exports: `ValidationReport`, `ValidationStatus`, `ValidationIssue`.
//! Role: Shared contract for `matriculas verify` and library callers.
//! Invariants: Reports are additive-only; the issue list is capped, the count is not.
//! Invariants: Validation never mutates either artifact.

use std::collections::HashSet;
use std::path::PathBuf;

use serde::Serialize;

use crate::core::dataset::ArtifactPaths;
use crate::core::index::NameIndex;
use crate::core::normalize::normalize;
use crate::core::store::{RecordStore, StoreFingerprint};

pub const MAX_REPORTED_ISSUES: usize = 50;

#[derive(Clone, Copy, Debug, Eq, PartialEq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ValidationStatus {
    Ok,
    Corrupt,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationIssue {
    pub code: String,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub key: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub offset: Option<u64>,
}

#[derive(Clone, Debug, Eq, PartialEq, Serialize)]
pub struct ValidationReport {
    pub store_path: PathBuf,
    pub index_path: PathBuf,
    pub status: ValidationStatus,
    pub store_records: u64,
    pub index_keys: usize,
    pub index_offsets: usize,
    pub unindexed_records: u64,
    pub issue_count: usize,
    pub issues: Vec<ValidationIssue>,
    pub remediation_hints: Vec<String>,
}

impl ValidationReport {
    fn new(paths: &ArtifactPaths) -> Self {
        Self {
            store_path: paths.store.clone(),
            index_path: paths.index.clone(),
            status: ValidationStatus::Ok,
            store_records: 0,
            index_keys: 0,
            index_offsets: 0,
            unindexed_records: 0,
            issue_count: 0,
            issues: Vec::new(),
            remediation_hints: Vec::new(),
        }
    }

    fn push(&mut self, issue: ValidationIssue) {
        self.issue_count += 1;
        self.status = ValidationStatus::Corrupt;
        if self.issues.len() < MAX_REPORTED_ISSUES {
            self.issues.push(issue);
        }
    }

    fn finish(mut self) -> Self {
        if self.status == ValidationStatus::Corrupt {
            self.remediation_hints = vec![
                "The index and store disagree. Rebuild the dataset with `matriculas build <input>`."
                    .to_string(),
            ];
        }
        self
    }
}

fn issue(code: &str, message: impl Into<String>, key: Option<&str>, offset: Option<u64>) -> ValidationIssue {
    ValidationIssue {
        code: code.to_string(),
        message: message.into(),
        key: key.map(str::to_string),
        offset,
    }
}

/// Full scan: fingerprint, every indexed offset, and coverage of every stored record.
pub(crate) fn validate_pair_report(
    paths: &ArtifactPaths,
    store: &RecordStore,
    index: &NameIndex,
    expected: &StoreFingerprint,
) -> ValidationReport {
    let mut report = ValidationReport::new(paths);
    report.store_records = store.record_count();
    report.index_keys = index.key_count();
    report.index_offsets = index.offset_count();

    let actual = store.fingerprint();
    if actual != *expected {
        report.push(issue(
            "fingerprint_mismatch",
            format!(
                "store has {} bytes / sha256 {}, index was built from {} bytes / sha256 {}",
                actual.len, actual.sha256, expected.len, expected.sha256
            ),
            None,
            None,
        ));
    }
    if store.trailing_bytes() != 0 {
        report.push(issue(
            "trailing_bytes",
            format!("{} bytes after the last whole record", store.trailing_bytes()),
            None,
            Some(store.len() - store.trailing_bytes()),
        ));
    }

    let mut seen = HashSet::new();
    for (key, offsets) in index.iter() {
        if normalize(key) != key {
            report.push(issue("unnormalized_key", "index key is not in normal form", Some(key), None));
        }
        for offset in offsets {
            if !seen.insert(*offset) {
                report.push(issue(
                    "duplicate_offset",
                    "offset is indexed more than once",
                    Some(key),
                    Some(offset.get()),
                ));
                continue;
            }
            match store.read_at(*offset) {
                Ok(record) => {
                    if normalize(&record.municipio) != key {
                        report.push(issue(
                            "key_mismatch",
                            format!("record name {:?} does not normalize to its key", record.municipio),
                            Some(key),
                            Some(offset.get()),
                        ));
                    }
                }
                Err(err) => {
                    let code = format!("{:?}", err.kind());
                    report.push(issue(&code, err.to_string(), Some(key), Some(offset.get())));
                }
            }
        }
    }

    let mut unindexed = 0;
    for (offset, record) in store.records() {
        if let Err(err) = &record {
            if !seen.contains(&offset) {
                let code = format!("{:?}", err.kind());
                report.push(issue(&code, err.to_string(), None, Some(offset.get())));
            }
        }
        if !seen.contains(&offset) {
            unindexed += 1;
        }
    }
    report.unindexed_records = unindexed;
    if unindexed > 0 {
        report.push(issue(
            "unindexed_records",
            format!("{unindexed} stored records are not reachable from the index"),
            None,
            None,
        ));
    }

    report.finish()
}
