//! shipline-audit — tamper-evident ledger of control-plane actions.
//!
//! Every action is appended as one line of canonical JSON to an NDJSON log.
//! Each entry carries the SHA-256 of its own canonical payload and the hash
//! of the entry before it, so any edit, reorder, or deletion breaks the
//! chain.
//!
//! # Architecture
//!
//! ```text
//! AuditChain
//!   ├── append_entry()     verify → build → hash → append line → snapshot
//!   ├── record_operation() never-failing wrapper for callers
//!   └── verify()           per-entry checks + continuity against snapshot
//!
//! AuditStateSnapshot  {log_path, entry_count, last_hash, last_ts, file_size}
//! ```
//!
//! The snapshot is written only after a fully-ok verification. A later run
//! compares the live log against it to detect truncation or a rewritten
//! history that would otherwise verify on its own.

pub mod chain;
pub mod entry;
pub mod error;
pub mod state;
pub mod verify;

pub use chain::{AuditChain, AuditEvent, AuditRecord, DEFAULT_LOG_PATH, DEFAULT_STATE_PATH};
pub use entry::{AuditEntry, REQUIRED_ENTRY_FIELDS, compute_entry_hash};
pub use error::{AuditError, AuditResult};
pub use state::{AuditStateSnapshot, build_state_snapshot, load_state, write_state};
pub use verify::{ParseError, Verification, VerifyOptions, verify_chain};
