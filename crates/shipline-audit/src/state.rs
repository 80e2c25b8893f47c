//! Continuity snapshot persisted between runs.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use tracing::{debug, warn};

use shipline_core::files::{JsonLoad, load_json, posix, write_json_atomic};
use shipline_core::{lenient, now_ts, round3};

use crate::error::AuditResult;
use crate::verify::Verification;

const STATE_SCHEMA_VERSION: u64 = 1;

/// Checkpoint of a verified ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditStateSnapshot {
    pub schema_version: u64,
    pub updated_at: f64,
    pub log_path: String,
    pub entry_count: u64,
    pub last_hash: String,
    pub last_ts: f64,
    pub file_size: u64,
}

impl AuditStateSnapshot {
    /// Read a snapshot from a JSON object, tolerating missing or
    /// mistyped fields.
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let text = |key: &str| {
            obj.get(key)
                .and_then(Value::as_str)
                .unwrap_or_default()
                .to_string()
        };
        Self {
            schema_version: lenient::int(obj.get("schema_version"))
                .map(|v| v.max(0) as u64)
                .unwrap_or(STATE_SCHEMA_VERSION),
            updated_at: lenient::float(obj.get("updated_at")).unwrap_or(0.0),
            log_path: text("log_path"),
            entry_count: lenient::int(obj.get("entry_count"))
                .map(|v| v.max(0) as u64)
                .unwrap_or(0),
            last_hash: text("last_hash"),
            last_ts: lenient::float(obj.get("last_ts")).unwrap_or(0.0),
            file_size: lenient::int(obj.get("file_size"))
                .map(|v| v.max(0) as u64)
                .unwrap_or(0),
        }
    }
}

/// Load the snapshot at `path`. Absent, unreadable, malformed, or empty
/// documents all yield `None`.
pub fn load_state(path: &Path) -> Option<AuditStateSnapshot> {
    match load_json(path) {
        Ok(JsonLoad::Loaded(Value::Object(obj))) if !obj.is_empty() => {
            Some(AuditStateSnapshot::from_object(&obj))
        }
        Ok(JsonLoad::Missing) => None,
        Ok(other) => {
            warn!(path = %path.display(), ?other, "ignoring unusable audit state");
            None
        }
        Err(err) => {
            warn!(path = %path.display(), %err, "audit state unreadable");
            None
        }
    }
}

/// Atomically persist `state` to `path`.
pub fn write_state(path: &Path, state: &AuditStateSnapshot) -> AuditResult<()> {
    write_json_atomic(path, state)?;
    debug!(
        path = %path.display(),
        entry_count = state.entry_count,
        "audit state written"
    );
    Ok(())
}

/// Snapshot the result of a verification of `log_path`.
pub fn build_state_snapshot(log_path: &Path, verification: &Verification) -> AuditStateSnapshot {
    AuditStateSnapshot {
        schema_version: STATE_SCHEMA_VERSION,
        updated_at: round3(now_ts()),
        log_path: posix(log_path),
        entry_count: verification.entry_count as u64,
        last_hash: verification.last_hash.clone(),
        last_ts: round3(verification.last_ts),
        file_size: std::fs::metadata(log_path).map(|m| m.len()).unwrap_or(0),
    }
}
