//! One rollout run, start to finish.
//!
//! Loads state and policy, evaluates gates and the observation window,
//! plans the next step, optionally applies it, records the run in the
//! audit chain, and produces a report. Every decision is visible in the
//! report's check rows.

use std::fs;
use std::path::{Path, PathBuf};
use std::sync::LazyLock;

use regex::Regex;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::{info, warn};

use shipline_audit::{AuditChain, AuditEvent, AuditRecord};
use shipline_channels::{ChannelStore, Provenance};
use shipline_core::files::{posix, write_json_atomic};
use shipline_core::{Check, Severity, enforced_ok, is_semver, now_ts, round3};

use crate::applier::{ApplyResult, TrafficSpec, apply_plan};
use crate::error::RolloutResult;
use crate::gates::{GateEvidence, evaluate_gates};
use crate::observation::Observation;
use crate::planner::{Plan, PlanAction, plan};
use crate::policy::{RolloutPolicy, StagePolicy};
use crate::traffic::validate_template;

/// Audit action recorded for every run.
pub const AUDIT_ACTION: &str = "release_rollout_execute";
/// Audit source recorded for every run.
pub const AUDIT_SOURCE: &str = "shipline_rollout";
/// Directory for reports when no output path is given.
pub const DEFAULT_OUT_DIR: &str = ".data/out";

static VERSION_LINE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r#"(?m)^\s*(?:__version__|version)\s*=\s*"([^"]+)""#).expect("valid regex")
});

/// Audit recording settings for a run.
#[derive(Debug, Clone, Default)]
pub struct AuditSettings {
    pub log_path: Option<PathBuf>,
    pub state_path: Option<PathBuf>,
    pub skip: bool,
    /// A failed record fails the run.
    pub strict: bool,
}

/// Inputs of one rollout run.
#[derive(Debug, Clone)]
pub struct RolloutRequest {
    pub channels_file: PathBuf,
    pub policy_file: PathBuf,
    /// Read for a `version = "x"` line when no target is given.
    pub version_file: Option<PathBuf>,
    pub target_version: Option<String>,
    pub actor: String,
    pub reason: String,
    pub apply: bool,
    pub dry_run: bool,
    pub traffic: TrafficSpec,
    pub allow_gate_failures: bool,
    pub strict: bool,
    pub correlation_id: String,
    pub release_candidate_id: String,
    pub audit: AuditSettings,
    pub out: Option<PathBuf>,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Correlation {
    pub correlation_id: String,
    pub release_candidate_id: String,
}

/// Channel state as found at the start of the run.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StateSummary {
    pub canary_version: String,
    pub stable_version: String,
    pub canary_rollout_percent: i64,
    pub stable_rollout_percent: i64,
    pub history_entries: usize,
}

/// The full record of a run.
#[derive(Debug, Clone, Serialize)]
pub struct RolloutReport {
    pub ok: bool,
    pub started_at: f64,
    pub ended_at: f64,
    pub duration_s: f64,
    pub strict: bool,
    pub dry_run: bool,
    pub run_apply: bool,
    pub target_version: String,
    pub correlation: Correlation,
    pub channels_file: String,
    pub policy_file: String,
    pub state: StateSummary,
    pub stages: StagePolicy,
    pub plan: Plan,
    pub apply_result: ApplyResult,
    pub gate_evidence: Vec<GateEvidence>,
    pub checks: Vec<Check>,
    pub next_actions: Vec<String>,
    pub audit: AuditRecord,
    /// Where the report was written.
    #[serde(skip)]
    pub out_path: PathBuf,
    #[serde(skip)]
    audit_strict: bool,
}

impl RolloutReport {
    /// 2 when a strict run failed, else 0.
    pub fn exit_code(&self) -> i32 {
        if (self.strict || self.audit_strict) && !self.ok {
            2
        } else {
            0
        }
    }
}

/// Run a rollout now.
pub fn execute(req: &RolloutRequest) -> RolloutResult<RolloutReport> {
    execute_at(req, now_ts())
}

/// Run a rollout as if it started at `started`.
pub fn execute_at(req: &RolloutRequest, started: f64) -> RolloutResult<RolloutReport> {
    let mut checks = Vec::new();

    let (mut store, store_loaded) = match ChannelStore::load(&req.channels_file) {
        Ok(store) => (store, true),
        Err(err) => {
            warn!(path = %req.channels_file.display(), %err, "channel store unreadable");
            (ChannelStore::default(), false)
        }
    };
    let (policy, policy_source) = RolloutPolicy::load(&req.policy_file);

    let target_version = resolve_target_version(req);
    let run_apply = req.apply && !req.dry_run;
    let (correlation_id, release_candidate_id) = resolve_ids(req, &target_version, started);

    let channels_path = posix(&req.channels_file);
    let policy_path = posix(&req.policy_file);
    let target_valid = is_semver(&target_version);

    checks.push(Check::enforce(
        "channels_store_loaded",
        store_loaded,
        channels_path.as_str(),
        "release channels store is available",
    ));
    checks.push(Check::enforce(
        "rollout_policy_loaded",
        policy_source.is_usable(),
        policy_path.as_str(),
        "rollout policy is available",
    ));
    checks.push(Check::enforce(
        "target_version_semver",
        target_valid,
        target_version.as_str(),
        "semantic version x.y.z",
    ));
    checks.push(Check::enforce(
        "correlation_id_present",
        !correlation_id.is_empty(),
        correlation_id.as_str(),
        "correlation id should be present for rollout traceability",
    ));
    checks.push(Check::enforce(
        "release_candidate_id_present",
        !release_candidate_id.is_empty(),
        release_candidate_id.as_str(),
        "release candidate id should be present for rollout traceability",
    ));

    let state = StateSummary {
        canary_version: store.channels.canary.version.clone(),
        stable_version: store.channels.stable.version.clone(),
        canary_rollout_percent: store.channels.canary.rollout_percent,
        stable_rollout_percent: store.channels.stable.rollout_percent,
        history_entries: store.history.len(),
    };

    // ── Gates and observation ──
    let gates = evaluate_gates(&policy.gates, req.strict, started);
    checks.extend(gates.checks.iter().cloned());
    let gate_failed_required = gates.failed_required();

    let plan = plan(&target_version, &store.channels, &policy.stages.canary);
    let action = plan.action;
    let reason = match req.reason.trim() {
        "" => plan.reason.as_str(),
        given => given,
    };
    let provenance = Provenance::new(reason, req.actor.clone())
        .with_ids(&correlation_id, &release_candidate_id);

    let observation = Observation::evaluate(
        action,
        &store,
        &target_version,
        policy.stages.min_stage_observe_s,
        started,
    );
    let observe_ok = observation.is_met();
    checks.push(observation.check(req.strict));

    // ── Apply gating ──
    let command = req.traffic.command.trim();
    let should_execute_traffic = run_apply && action.is_mutation();
    let template = validate_template(command);
    let template_invalid = !command.is_empty() && !template.ok;

    let mut apply_blocked = (gate_failed_required && !req.allow_gate_failures)
        || !observe_ok
        || !target_valid
        || !store_loaded;
    if should_execute_traffic && template_invalid {
        apply_blocked = true;
    }

    let traffic_strict = req.strict || req.traffic.required;
    checks.push(Check::new(
        "traffic_apply_template_valid",
        !should_execute_traffic || command.is_empty() || !template_invalid,
        serde_json::to_value(&template).unwrap_or(Value::Null),
        "traffic apply command template only uses supported placeholders and valid braces",
        Severity::enforce_if(traffic_strict),
    ));
    checks.push(Check::new(
        "traffic_apply_command_present_when_required",
        !should_execute_traffic || !req.traffic.required || !command.is_empty(),
        json!({
            "should_execute_traffic": should_execute_traffic,
            "traffic_apply_required": req.traffic.required,
            "traffic_apply_command_present": !command.is_empty(),
        }),
        "traffic apply command should be provided when traffic apply is required",
        Severity::enforce_if(req.traffic.required),
    ));
    checks.push(Check::enforce(
        "rollout_apply_not_blocked",
        !run_apply || !apply_blocked,
        json!({
            "run_apply": run_apply,
            "gate_failed_required": gate_failed_required,
            "allow_gate_failures": req.allow_gate_failures,
            "observe_ok": observe_ok,
            "traffic_template_invalid": template_invalid,
            "target_version_valid": target_valid,
            "store_loaded": store_loaded,
        }),
        "apply mode requires healthy gates and observation window unless override",
    ));

    // ── Apply ──
    let apply_result = if run_apply && !apply_blocked {
        apply_plan(
            &mut store,
            &req.channels_file,
            &plan,
            &provenance,
            &req.traffic,
            round3(now_ts()),
        )?
    } else {
        let mut skipped = ApplyResult::skipped(action, apply_blocked, &provenance);
        if !run_apply && !req.dry_run {
            skipped.reason = Some("planning_only_run".into());
        }
        skipped
    };

    if should_execute_traffic {
        let (ok, value) = match &apply_result.traffic_apply {
            Some(outcome) => (
                outcome.ok,
                serde_json::to_value(outcome).unwrap_or(Value::Null),
            ),
            None => (false, json!({})),
        };
        checks.push(Check::new(
            "traffic_apply_command_ok",
            ok,
            value,
            "traffic apply command executes successfully",
            Severity::enforce_if(traffic_strict),
        ));
    }

    let next_actions = next_actions(
        action,
        gate_failed_required && !req.allow_gate_failures,
        run_apply && apply_blocked,
    );

    // ── Audit ──
    let pre_audit_ok = enforced_ok(&checks);
    let audit = if req.audit.skip {
        AuditRecord::skipped()
    } else {
        let chain = AuditChain::resolve(req.audit.log_path.as_deref(), req.audit.state_path.as_deref());
        let mut context = Map::new();
        context.insert("target_version".into(), json!(target_version));
        context.insert("plan_action".into(), json!(action.as_str()));
        context.insert("run_apply".into(), json!(run_apply));
        context.insert("dry_run".into(), json!(req.dry_run || !run_apply));
        context.insert("strict".into(), json!(req.strict));
        context.insert("report_ok".into(), json!(pre_audit_ok));
        context.insert("apply_applied".into(), json!(apply_result.applied));
        context.insert("apply_blocked".into(), json!(apply_result.blocked));
        context.insert("correlation_id".into(), json!(correlation_id));
        context.insert("release_candidate_id".into(), json!(release_candidate_id));
        let event = AuditEvent::new(AUDIT_ACTION)
            .actor(req.actor.clone())
            .source(AUDIT_SOURCE)
            .status(if pre_audit_ok { "ok" } else { "failed" })
            .context(context);
        chain.record_operation(&event, false)?
    };
    checks.push(Check::new(
        "audit_chain_recorded",
        audit.ok,
        serde_json::to_value(&audit).unwrap_or(Value::Null),
        "rollout execution should be recorded in tamper-evident audit chain",
        Severity::enforce_if(req.audit.strict),
    ));

    let ended = now_ts();
    let out_path = req
        .out
        .clone()
        .unwrap_or_else(|| default_out_path(ended));
    let report = RolloutReport {
        ok: enforced_ok(&checks),
        started_at: round3(started),
        ended_at: round3(ended),
        duration_s: round3((ended - started).max(0.0)),
        strict: req.strict,
        dry_run: req.dry_run || !run_apply,
        run_apply,
        target_version,
        correlation: Correlation {
            correlation_id,
            release_candidate_id,
        },
        channels_file: channels_path,
        policy_file: policy_path,
        state,
        stages: policy.stages,
        plan,
        apply_result,
        gate_evidence: gates.evidence,
        checks,
        next_actions,
        audit,
        out_path,
        audit_strict: req.audit.strict,
    };
    write_json_atomic(&report.out_path, &report)?;

    info!(
        ok = report.ok,
        action = action.as_str(),
        target = %report.target_version,
        applied = report.apply_result.applied,
        out = %report.out_path.display(),
        "rollout run finished"
    );
    Ok(report)
}

/// `.data/out/release_rollout_executor_<epoch>.json`
pub fn default_out_path(ts: f64) -> PathBuf {
    Path::new(DEFAULT_OUT_DIR).join(format!("release_rollout_executor_{}.json", ts as i64))
}

/// First `version = "x"` (or `__version__ = "x"`) line of `text`.
pub fn extract_version(text: &str) -> Option<String> {
    VERSION_LINE
        .captures(text)
        .map(|caps| caps[1].trim().to_string())
}

fn resolve_target_version(req: &RolloutRequest) -> String {
    if let Some(target) = req.target_version.as_deref().map(str::trim).filter(|t| !t.is_empty()) {
        return target.to_string();
    }
    req.version_file
        .as_deref()
        .and_then(|path| fs::read_to_string(path).ok())
        .and_then(|text| extract_version(&text))
        .unwrap_or_default()
}

/// Each id falls back to the other, then to one generated from the run.
fn resolve_ids(req: &RolloutRequest, target_version: &str, started: f64) -> (String, String) {
    let mut correlation_id = req.correlation_id.trim().to_string();
    let mut release_candidate_id = req.release_candidate_id.trim().to_string();
    if release_candidate_id.is_empty() {
        release_candidate_id = correlation_id.clone();
    }
    if correlation_id.is_empty() {
        correlation_id = release_candidate_id.clone();
    }
    let epoch = started as i64;
    if correlation_id.is_empty() {
        correlation_id = format!("rollout-{epoch}");
    }
    if release_candidate_id.is_empty() {
        release_candidate_id = format!("rc-{}-{epoch}", target_version.replace('.', "-"));
    }
    (correlation_id, release_candidate_id)
}

fn next_actions(action: PlanAction, gates_blocking: bool, apply_blocked: bool) -> Vec<String> {
    let mut out = Vec::new();
    if gates_blocking {
        out.push(
            "Required rollout gates failed: rerun release guards/preflight until gate reports become healthy."
                .to_string(),
        );
    }
    let hint = match action {
        PlanAction::SetCanary => {
            Some("Start canary with target version; continue observing before next stage.")
        }
        PlanAction::RolloutCanary => Some(
            "Canary stage advanced; wait observation window and rerun executor for next stage.",
        ),
        PlanAction::PromoteStable => {
            Some("Promote canary to stable and continue post-release observation.")
        }
        PlanAction::Noop => Some("Rollout already converged for target version."),
        PlanAction::RolloutStable => None,
    };
    out.extend(hint.map(str::to_string));
    if apply_blocked {
        out.push(
            "Apply mode was blocked by gate/observe checks. Use --allow-gate-failures only for emergency cases."
                .to_string(),
        );
    }
    out
}
