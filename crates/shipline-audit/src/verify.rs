//! Chain verification.
//!
//! Re-reads the whole ledger and checks, for every entry in order: schema
//! fields, sequence continuity, non-empty attribution, context shape,
//! timestamp ordering, the back-link to the previous hash, and the entry's
//! own hash. Continuity against a persisted snapshot catches truncation
//! and wholesale rewrites that a self-consistent chain would hide.

use std::fs;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use shipline_core::files::posix;
use shipline_core::{Check, Severity, enforced_ok, lenient, now_ts, round3};

use crate::entry::{REQUIRED_ENTRY_FIELDS, compute_entry_hash};
use crate::state::AuditStateSnapshot;

/// Parse errors reported in the verification value are capped at this many.
const MAX_REPORTED_PARSE_ERRORS: usize = 20;

#[derive(Debug, Clone, Default)]
pub struct VerifyOptions {
    /// Fail when the log does not exist or is empty.
    pub require_log: bool,
    /// Fail when no continuity snapshot is available.
    pub require_state: bool,
    /// Enforce the non-empty attribution checks instead of warning.
    pub strict: bool,
    /// Maximum age of the newest entry in seconds; `0` disables the check.
    pub max_age_s: f64,
    /// Clock override for the freshness check.
    pub now_ts: Option<f64>,
}

/// A ledger line that could not be used.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ParseError {
    pub line: usize,
    pub error: String,
}

/// Result of verifying a ledger.
#[derive(Debug, Clone, Serialize)]
pub struct Verification {
    pub ok: bool,
    pub log_path: String,
    pub entry_count: usize,
    pub last_hash: String,
    pub last_ts: f64,
    pub checks: Vec<Check>,
    pub parse_errors: Vec<ParseError>,
    /// Stored `entry_hash` of every entry, in order.
    #[serde(skip)]
    pub hash_chain: Vec<String>,
}

/// Verify the ledger at `log_path`, optionally against a snapshot.
pub fn verify_chain(
    log_path: &Path,
    state: Option<&AuditStateSnapshot>,
    opts: &VerifyOptions,
) -> Verification {
    let now = opts.now_ts.unwrap_or_else(now_ts);
    let log_display = posix(log_path);
    let mut checks = Vec::new();
    let mut parse_errors = Vec::new();

    let log_exists = log_path.exists();
    checks.push(Check::enforce(
        "audit_log_exists",
        log_exists || !opts.require_log,
        log_display.as_str(),
        "audit chain log exists when required",
    ));

    let entries = if log_exists {
        read_entries(log_path, &mut parse_errors)
    } else {
        Vec::new()
    };

    checks.push(Check::enforce(
        "audit_log_parse_ok",
        parse_errors.is_empty(),
        json!({
            "errors": parse_errors.iter().take(MAX_REPORTED_PARSE_ERRORS).collect::<Vec<_>>(),
            "count": parse_errors.len(),
        }),
        "all audit entries should be valid json objects",
    ));

    if opts.require_log {
        checks.push(Check::enforce(
            "audit_log_non_empty",
            !entries.is_empty(),
            entries.len(),
            "audit chain should contain at least one entry",
        ));
    }

    let attribution = Severity::enforce_if(opts.strict);
    let mut prior_hash = String::new();
    let mut prior_ts = 0.0_f64;
    let mut hash_chain = Vec::with_capacity(entries.len());

    for (i, entry) in entries.iter().enumerate() {
        let index = i + 1;

        let missing: Vec<&str> = REQUIRED_ENTRY_FIELDS
            .iter()
            .copied()
            .filter(|name| !entry.contains_key(*name))
            .collect();
        checks.push(Check::enforce(
            format!("entry_{index}_required_fields"),
            missing.is_empty(),
            json!({ "missing": missing }),
            "entry contains required schema fields",
        ));

        let seq = lenient::int(entry.get("seq")).unwrap_or(0);
        checks.push(Check::enforce(
            format!("entry_{index}_seq_continuous"),
            seq == index as i64,
            seq,
            format!("sequence should equal {index}"),
        ));

        for field in ["action", "actor", "source", "status"] {
            let value = text_field(entry.get(field));
            let value = value.trim();
            checks.push(Check::new(
                format!("entry_{index}_{field}_present"),
                !value.is_empty(),
                value,
                format!("{field} should be non-empty"),
                attribution,
            ));
        }

        let context = entry.get("context");
        checks.push(Check::enforce(
            format!("entry_{index}_context_is_object"),
            matches!(context, Some(Value::Object(_))),
            type_name(context),
            "context should be a json object",
        ));

        let ts = lenient::float(entry.get("ts")).unwrap_or(0.0);
        checks.push(Check::enforce(
            format!("entry_{index}_timestamp_positive"),
            ts > 0.0,
            ts,
            "timestamp should be > 0",
        ));
        checks.push(Check::enforce(
            format!("entry_{index}_timestamp_monotonic"),
            prior_ts <= 0.0 || ts >= prior_ts,
            json!({ "prev_ts": prior_ts, "ts": ts }),
            "timestamps should be non-decreasing",
        ));
        if ts > 0.0 {
            prior_ts = ts;
        }

        let prev_hash = text_field(entry.get("prev_hash"));
        checks.push(Check::enforce(
            format!("entry_{index}_prev_hash_match"),
            prev_hash == prior_hash,
            json!({ "prev_hash": prev_hash, "expected_prev_hash": prior_hash }),
            "prev_hash should match prior entry hash",
        ));

        let stored_hash = text_field(entry.get("entry_hash"));
        let computed_hash = compute_entry_hash(entry);
        checks.push(Check::enforce(
            format!("entry_{index}_hash_match"),
            !stored_hash.is_empty() && stored_hash == computed_hash,
            json!({ "entry_hash": stored_hash, "computed_hash": computed_hash }),
            "entry hash should match canonical payload hash",
        ));

        prior_hash = stored_hash.clone();
        hash_chain.push(stored_hash);
    }

    let last_ts = prior_ts.max(0.0);
    if opts.max_age_s > 0.0 && !entries.is_empty() {
        let age_s = (now - last_ts).max(0.0);
        checks.push(Check::enforce(
            "audit_last_entry_fresh",
            age_s <= opts.max_age_s,
            json!({ "age_s": round3(age_s), "max_age_s": opts.max_age_s }),
            "latest audit entry should be fresh enough",
        ));
    }

    checks.push(Check::enforce(
        "audit_state_present",
        state.is_some() || !opts.require_state,
        json!({ "state_file_present": state.is_some() }),
        "audit continuity state exists when required",
    ));

    if let Some(state) = state {
        check_continuity(&mut checks, state, &log_display, &hash_chain, &prior_hash);
    }

    let ok = enforced_ok(&checks);
    if !ok {
        warn!(log = %log_display, entries = entries.len(), "audit chain verification failed");
    } else {
        debug!(log = %log_display, entries = entries.len(), "audit chain verified");
    }

    Verification {
        ok,
        log_path: log_display,
        entry_count: entries.len(),
        last_hash: prior_hash,
        last_ts: round3(last_ts),
        checks,
        parse_errors,
        hash_chain,
    }
}

fn check_continuity(
    checks: &mut Vec<Check>,
    state: &AuditStateSnapshot,
    log_display: &str,
    hash_chain: &[String],
    current_last_hash: &str,
) {
    let state_log_path = state.log_path.trim();
    if !state_log_path.is_empty() {
        checks.push(Check::warn(
            "audit_state_log_path_match",
            state_log_path.replace('\\', "/") == log_display,
            json!({ "state_log_path": state_log_path, "log_path": log_display }),
            "state snapshot should point to the same log file",
        ));
    }

    let state_count = state.entry_count as usize;
    if state_count == 0 {
        return;
    }
    let current_count = hash_chain.len();
    let (ok, value) = if current_count < state_count {
        (
            false,
            json!({
                "state_count": state_count,
                "current_count": current_count,
                "state_last_hash": state.last_hash,
                "reason": "truncated",
            }),
        )
    } else if current_count == state_count {
        (
            current_last_hash == state.last_hash,
            json!({
                "state_count": state_count,
                "current_count": current_count,
                "state_last_hash": state.last_hash,
                "current_last_hash": current_last_hash,
            }),
        )
    } else {
        let bridge_hash = hash_chain[state_count - 1].as_str();
        (
            bridge_hash == state.last_hash,
            json!({
                "state_count": state_count,
                "current_count": current_count,
                "state_last_hash": state.last_hash,
                "bridge_hash": bridge_hash,
            }),
        )
    };
    checks.push(Check::enforce(
        "audit_append_only_state_continuity",
        ok,
        value,
        "current chain should continue from persisted state snapshot",
    ));
}

/// Parse every non-blank line; unusable lines are recorded, not fatal.
fn read_entries(log_path: &Path, parse_errors: &mut Vec<ParseError>) -> Vec<Map<String, Value>> {
    let text = match fs::read(log_path) {
        Ok(bytes) => String::from_utf8_lossy(&bytes).into_owned(),
        Err(e) => {
            parse_errors.push(ParseError {
                line: 0,
                error: format!("read error: {e}"),
            });
            return Vec::new();
        }
    };
    let mut entries = Vec::new();
    for (i, raw) in text.lines().enumerate() {
        let line = raw.trim();
        if line.is_empty() {
            continue;
        }
        match serde_json::from_str::<Value>(line) {
            Ok(Value::Object(map)) => entries.push(map),
            Ok(_) => parse_errors.push(ParseError {
                line: i + 1,
                error: "entry is not a json object".into(),
            }),
            Err(e) => parse_errors.push(ParseError {
                line: i + 1,
                error: e.to_string(),
            }),
        }
    }
    entries
}

/// String form of a scalar field; `null` and absent are empty.
fn text_field(value: Option<&Value>) -> String {
    match value {
        None | Some(Value::Null) => String::new(),
        Some(Value::String(s)) => s.clone(),
        Some(other) => other.to_string(),
    }
}

fn type_name(value: Option<&Value>) -> &'static str {
    match value {
        None => "missing",
        Some(Value::Null) => "null",
        Some(Value::Bool(_)) => "boolean",
        Some(Value::Number(_)) => "number",
        Some(Value::String(_)) => "string",
        Some(Value::Array(_)) => "array",
        Some(Value::Object(_)) => "object",
    }
}
