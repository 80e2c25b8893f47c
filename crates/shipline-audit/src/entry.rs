//! Ledger entries and their hashes.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use sha2::{Digest, Sha256};

use shipline_core::canonical_json;

/// Schema version stamped on new entries.
pub const ENTRY_SCHEMA_VERSION: u64 = 1;

/// Fields every entry must carry.
pub const REQUIRED_ENTRY_FIELDS: [&str; 10] = [
    "schema_version",
    "seq",
    "ts",
    "action",
    "actor",
    "source",
    "status",
    "context",
    "prev_hash",
    "entry_hash",
];

/// One line of the ledger.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub schema_version: u64,
    /// 1-based position in the chain.
    pub seq: u64,
    /// Epoch seconds, rounded to milliseconds.
    pub ts: f64,
    pub action: String,
    pub actor: String,
    pub source: String,
    pub status: String,
    pub context: Map<String, Value>,
    /// `entry_hash` of the previous entry, empty for the first.
    pub prev_hash: String,
    pub entry_hash: String,
}

impl AuditEntry {
    /// JSON object form of the entry, including `entry_hash`.
    pub fn to_value(&self) -> Value {
        json!({
            "schema_version": self.schema_version,
            "seq": self.seq,
            "ts": self.ts,
            "action": self.action,
            "actor": self.actor,
            "source": self.source,
            "status": self.status,
            "context": Value::Object(self.context.clone()),
            "prev_hash": self.prev_hash,
            "entry_hash": self.entry_hash,
        })
    }

    /// Fill in `entry_hash` from the other fields.
    pub fn seal(mut self) -> Self {
        self.entry_hash = match self.to_value() {
            Value::Object(map) => compute_entry_hash(&map),
            _ => String::new(),
        };
        self
    }

    /// The newline-free canonical line written to the ledger.
    pub fn canonical_line(&self) -> String {
        canonical_json(&self.to_value())
    }
}

/// SHA-256 (lower hex) of the canonical JSON of every field except
/// `entry_hash`. Unknown extra fields are part of the hashed payload.
pub fn compute_entry_hash(entry: &Map<String, Value>) -> String {
    let payload: Map<String, Value> = entry
        .iter()
        .filter(|(k, _)| k.as_str() != "entry_hash")
        .map(|(k, v)| (k.clone(), v.clone()))
        .collect();
    let text = canonical_json(&Value::Object(payload));
    hex::encode(Sha256::digest(text.as_bytes()))
}
