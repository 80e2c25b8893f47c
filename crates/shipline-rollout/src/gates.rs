//! Gate evaluation against external health reports.
//!
//! Each gate names a glob of JSON reports written by other tooling
//! (preflight runs, load tests, guard sweeps). The newest match is read
//! and judged on presence, freshness, and its own `ok` verdict. A broken
//! report fails its gate; it never fails the run outright.

use std::fs;
use std::path::{Path, PathBuf};
use std::time::UNIX_EPOCH;

use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{debug, warn};

use shipline_core::files::posix;
use shipline_core::{Check, Severity, lenient, round3};

use crate::policy::GatePolicy;

/// Report fields tried, in order, for the report's timestamp.
const TIMESTAMP_FIELDS: [&str; 3] = ["ended_at", "generated_at", "started_at"];

/// Evidence row for one gate.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GateEvidence {
    pub id: String,
    pub pattern: String,
    pub required: bool,
    pub require_ok: bool,
    pub report_path: String,
    pub report_exists: bool,
    pub report_ok: bool,
    /// Seconds, or `"inf"` when the report has no usable timestamp.
    pub age_s: Value,
    pub max_age_s: f64,
    pub passed: bool,
}

/// All gates of a policy, evaluated.
#[derive(Debug, Clone, Default)]
pub struct GateOutcome {
    pub checks: Vec<Check>,
    pub evidence: Vec<GateEvidence>,
}

impl GateOutcome {
    /// True when any required gate did not pass.
    pub fn failed_required(&self) -> bool {
        self.evidence.iter().any(|row| row.required && !row.passed)
    }
}

/// Evaluate `gates` at time `now`. Required gates are enforced only when
/// `strict`.
pub fn evaluate_gates(gates: &[GatePolicy], strict: bool, now: f64) -> GateOutcome {
    let mut outcome = GateOutcome::default();
    for gate in gates {
        let (check, evidence) = evaluate_gate(gate, strict, now);
        outcome.checks.push(check);
        outcome.evidence.push(evidence);
    }
    outcome
}

fn evaluate_gate(gate: &GatePolicy, strict: bool, now: f64) -> (Check, GateEvidence) {
    let report_path = if gate.pattern.is_empty() {
        None
    } else {
        latest_report(&gate.pattern)
    };
    let report = report_path.as_deref().and_then(load_report);

    let mut report_ts = report.as_ref().map(report_timestamp).unwrap_or(0.0);
    if report_ts <= 0.0 {
        report_ts = report_path.as_deref().map(modified_ts).unwrap_or(0.0);
    }
    let age_s = (report_ts > 0.0).then(|| now - report_ts);

    let report_exists = report.is_some();
    let report_ok = report
        .as_ref()
        .is_some_and(|r| lenient::truthy(r.get("ok")));
    let fresh = age_s.is_some_and(|age| age <= gate.max_age_s);
    let passed = report_exists && fresh && (!gate.require_ok || report_ok);

    let report_path = report_path.as_deref().map(posix).unwrap_or_default();
    let age_value = match age_s {
        Some(age) => json!(round3(age)),
        None => json!("inf"),
    };
    debug!(gate = %gate.id, passed, report = %report_path, "gate evaluated");

    let check = Check::new(
        format!("gate::{}", gate.id),
        passed,
        json!({
            "pattern": gate.pattern,
            "report_path": report_path,
            "exists": report_exists,
            "report_ok": report_ok,
            "age_s": age_value,
            "max_age_s": gate.max_age_s,
            "required": gate.required,
            "require_ok": gate.require_ok,
        }),
        "gate report exists, fresh, and healthy",
        Severity::enforce_if(strict && gate.required),
    );
    let evidence = GateEvidence {
        id: gate.id.clone(),
        pattern: gate.pattern.clone(),
        required: gate.required,
        require_ok: gate.require_ok,
        report_path,
        report_exists,
        report_ok,
        age_s: age_value,
        max_age_s: gate.max_age_s,
        passed,
    };
    (check, evidence)
}

/// The most recently modified file matching `pattern`.
pub fn latest_report(pattern: &str) -> Option<PathBuf> {
    let paths = match glob::glob(pattern) {
        Ok(paths) => paths,
        Err(err) => {
            warn!(%pattern, %err, "invalid gate report pattern");
            return None;
        }
    };
    paths
        .filter_map(Result::ok)
        .filter(|p| p.is_file())
        .map(|p| (modified_ts(&p), p))
        .max_by(|a, b| a.0.total_cmp(&b.0))
        .map(|(_, p)| p)
}

/// Read a report as a JSON object. Anything else yields `None`.
pub fn load_report(path: &Path) -> Option<Map<String, Value>> {
    let text = fs::read_to_string(path).ok()?;
    match serde_json::from_str(&text) {
        Ok(Value::Object(obj)) => Some(obj),
        Ok(_) => None,
        Err(err) => {
            debug!(path = %path.display(), %err, "gate report unparseable");
            None
        }
    }
}

/// First positive of `ended_at`, `generated_at`, `started_at`; 0 if none.
pub fn report_timestamp(report: &Map<String, Value>) -> f64 {
    TIMESTAMP_FIELDS
        .iter()
        .filter_map(|key| lenient::float(report.get(*key)))
        .find(|ts| *ts > 0.0)
        .unwrap_or(0.0)
}

fn modified_ts(path: &Path) -> f64 {
    fs::metadata(path)
        .and_then(|m| m.modified())
        .ok()
        .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}
