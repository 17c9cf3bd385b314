//! Purpose: Structured schema for non-fatal stderr notices (skipped rows, build summaries).
//! Exports: `Notice`, `notice_json`.
//! Role: Shared contract helper for CLI diagnostics that are not errors.
//! Invariants: Notices never alter stdout payloads or the exit code.
//! Invariants: Fields are additive-only.
use serde_json::{Map, Value, json};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Notice {
    pub kind: String,
    pub time: String,
    pub cmd: String,
    pub dataset: String,
    pub message: String,
    pub details: Map<String, Value>,
}

pub fn notice_json(notice: &Notice) -> Value {
    json!({
        "notice": {
            "kind": notice.kind,
            "time": notice.time,
            "cmd": notice.cmd,
            "dataset": notice.dataset,
            "message": notice.message,
            "details": Value::Object(notice.details.clone()),
        }
    })
}
