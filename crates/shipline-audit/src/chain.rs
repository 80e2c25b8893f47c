//! Appending to the ledger.

use std::env;
use std::fs::{self, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{info, warn};

use shipline_core::files::posix;
use shipline_core::{failing_ids, now_ts, round3};

use crate::entry::{AuditEntry, ENTRY_SCHEMA_VERSION};
use crate::error::{AuditError, AuditResult};
use crate::state::{build_state_snapshot, load_state, write_state};
use crate::verify::{Verification, VerifyOptions, verify_chain};

pub const DEFAULT_LOG_PATH: &str = ".data/audit/operations_audit_chain.ndjson";
pub const DEFAULT_STATE_PATH: &str = ".data/audit/operations_audit_chain_state.json";

/// Environment overrides consulted when no explicit path is given.
pub const LOG_PATH_ENV: &str = "SHIPLINE_AUDIT_LOG";
pub const STATE_PATH_ENV: &str = "SHIPLINE_AUDIT_STATE_FILE";

/// An action to be recorded.
#[derive(Debug, Clone, Default)]
pub struct AuditEvent {
    pub action: String,
    pub actor: String,
    pub source: String,
    pub status: String,
    pub context: Map<String, Value>,
}

impl AuditEvent {
    pub fn new(action: impl Into<String>) -> Self {
        Self {
            action: action.into(),
            ..Default::default()
        }
    }

    pub fn actor(mut self, actor: impl Into<String>) -> Self {
        self.actor = actor.into();
        self
    }

    pub fn source(mut self, source: impl Into<String>) -> Self {
        self.source = source.into();
        self
    }

    pub fn status(mut self, status: impl Into<String>) -> Self {
        self.status = status.into();
        self
    }

    pub fn context(mut self, context: Map<String, Value>) -> Self {
        self.context = context;
        self
    }
}

/// Outcome of [`AuditChain::record_operation`], embedded in reports.
#[derive(Debug, Clone, Default, Serialize)]
pub struct AuditRecord {
    pub ok: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub skipped: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub log_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state_path: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub entry: Option<AuditEntry>,
}

impl AuditRecord {
    /// Recording was turned off by the caller.
    pub fn skipped() -> Self {
        Self {
            ok: true,
            skipped: true,
            ..Default::default()
        }
    }
}

/// The ledger file and its continuity snapshot.
#[derive(Debug, Clone)]
pub struct AuditChain {
    pub log_path: PathBuf,
    pub state_path: PathBuf,
}

impl AuditChain {
    pub fn new(log_path: impl Into<PathBuf>, state_path: impl Into<PathBuf>) -> Self {
        Self {
            log_path: log_path.into(),
            state_path: state_path.into(),
        }
    }

    /// Explicit paths win, then the environment, then the defaults.
    pub fn resolve(log_path: Option<&Path>, state_path: Option<&Path>) -> Self {
        Self::new(
            pick_path(log_path, LOG_PATH_ENV, DEFAULT_LOG_PATH),
            pick_path(state_path, STATE_PATH_ENV, DEFAULT_STATE_PATH),
        )
    }

    /// Verify the ledger against the persisted snapshot.
    pub fn verify(&self, opts: &VerifyOptions) -> Verification {
        let state = load_state(&self.state_path);
        verify_chain(&self.log_path, state.as_ref(), opts)
    }

    /// Append `event` stamped with the current time.
    pub fn append_entry(&self, event: &AuditEvent, strict: bool, update_state: bool) -> AuditResult<AuditEntry> {
        self.append_entry_at(event, now_ts(), strict, update_state)
    }

    /// Append `event` stamped with `now`.
    ///
    /// With `strict`, an existing chain that fails verification is left
    /// untouched and [`AuditError::ChainInvalid`] is returned. With
    /// `update_state`, the chain is re-verified after the write and the
    /// snapshot refreshed.
    pub fn append_entry_at(
        &self,
        event: &AuditEvent,
        now: f64,
        strict: bool,
        update_state: bool,
    ) -> AuditResult<AuditEntry> {
        let state = load_state(&self.state_path);
        let before = verify_chain(
            &self.log_path,
            state.as_ref(),
            &VerifyOptions {
                strict: true,
                ..Default::default()
            },
        );
        if strict && !before.ok {
            let failing = failing_ids(&before.checks);
            warn!(log = %self.log_path.display(), ?failing, "refusing to append to invalid audit chain");
            return Err(AuditError::ChainInvalid { failing });
        }

        let entry = AuditEntry {
            schema_version: ENTRY_SCHEMA_VERSION,
            seq: before.entry_count as u64 + 1,
            ts: round3(now).max(before.last_ts),
            action: event.action.trim().to_string(),
            actor: or_default(&event.actor, "system"),
            source: or_default(&event.source, "unknown"),
            status: or_default(&event.status, "ok"),
            context: event.context.clone(),
            prev_hash: before.last_hash.clone(),
            entry_hash: String::new(),
        }
        .seal();

        self.write_line(&entry.canonical_line())?;

        if update_state {
            let after = verify_chain(
                &self.log_path,
                state.as_ref(),
                &VerifyOptions {
                    require_log: true,
                    strict: true,
                    ..Default::default()
                },
            );
            if strict && !after.ok {
                return Err(AuditError::PostWriteInvalid {
                    failing: failing_ids(&after.checks),
                });
            }
            write_state(&self.state_path, &build_state_snapshot(&self.log_path, &after))?;
        }

        info!(
            seq = entry.seq,
            action = %entry.action,
            status = %entry.status,
            "audit entry appended"
        );
        Ok(entry)
    }

    /// Append `event`, reporting failure in the returned record instead of
    /// as an error unless `strict` is set.
    pub fn record_operation(&self, event: &AuditEvent, strict: bool) -> AuditResult<AuditRecord> {
        let log_path = Some(posix(&self.log_path));
        let state_path = Some(posix(&self.state_path));
        match self.append_entry(event, true, true) {
            Ok(entry) => Ok(AuditRecord {
                ok: true,
                log_path,
                state_path,
                entry: Some(entry),
                ..Default::default()
            }),
            Err(err) if strict => Err(err),
            Err(err) => {
                warn!(action = %event.action, %err, "audit record failed");
                Ok(AuditRecord {
                    ok: false,
                    error: Some(err.to_string()),
                    log_path,
                    state_path,
                    ..Default::default()
                })
            }
        }
    }

    fn write_line(&self, line: &str) -> AuditResult<()> {
        let io_err = |source| AuditError::Io {
            path: self.log_path.clone(),
            source,
        };
        if let Some(parent) = self.log_path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(|source| AuditError::Io {
                path: parent.to_path_buf(),
                source,
            })?;
        }
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.log_path)
            .map_err(io_err)?;
        file.write_all(format!("{line}\n").as_bytes()).map_err(io_err)?;
        file.flush().map_err(io_err)
    }
}

fn pick_path(explicit: Option<&Path>, env_key: &str, default: &str) -> PathBuf {
    if let Some(path) = explicit.filter(|p| !p.as_os_str().is_empty()) {
        return path.to_path_buf();
    }
    match env::var(env_key) {
        Ok(value) if !value.trim().is_empty() => PathBuf::from(value.trim()),
        _ => PathBuf::from(default),
    }
}

fn or_default(value: &str, default: &str) -> String {
    let value = value.trim();
    let chosen = if value.is_empty() { default } else { value };
    chosen.to_string()
}
