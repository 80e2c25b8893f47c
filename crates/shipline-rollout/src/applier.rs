//! Apply-or-revert.
//!
//! The plan is applied to the in-memory store first. When a traffic
//! command is configured it runs against the mutated state; only if it
//! succeeds is the mutation persisted. On failure the pre-apply snapshot
//! is written back, so the document on disk is exactly what it was.

use std::path::Path;

use serde::Serialize;
use tracing::{info, warn};

use shipline_channels::{ChannelStore, Channels, FULL_ROLLOUT, HistoryAction, Provenance};

use crate::error::RolloutResult;
use crate::planner::{Plan, PlanAction};
use crate::traffic::{TemplateContext, TrafficOutcome, run_traffic_command};

/// How the traffic shift is driven.
#[derive(Debug, Clone, PartialEq)]
pub struct TrafficSpec {
    /// Command template; empty when none was given.
    pub command: String,
    pub timeout_s: f64,
    /// A missing or failing command fails the apply.
    pub required: bool,
}

/// What the apply step did, embedded in the rollout report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ApplyResult {
    pub applied: bool,
    pub action: PlanAction,
    pub blocked: bool,
    pub dry_run: bool,
    #[serde(skip_serializing_if = "std::ops::Not::not")]
    pub reverted: bool,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_rollout_percent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_percent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub traffic_apply: Option<TrafficOutcome>,
    pub correlation_id: String,
    pub release_candidate_id: String,
}

impl ApplyResult {
    /// Nothing was applied.
    pub fn skipped(action: PlanAction, blocked: bool, provenance: &Provenance) -> Self {
        Self {
            applied: false,
            action,
            blocked,
            dry_run: true,
            reverted: false,
            target_version: None,
            from_version: None,
            from_rollout_percent: None,
            rollout_percent: None,
            reason: None,
            traffic_apply: None,
            correlation_id: provenance.correlation_id.clone(),
            release_candidate_id: provenance.release_candidate_id.clone(),
        }
    }
}

/// Apply `plan` to `store`, drive traffic, and persist to `path` or
/// revert. `store` reflects what is on disk afterwards.
pub fn apply_plan(
    store: &mut ChannelStore,
    path: &Path,
    plan: &Plan,
    provenance: &Provenance,
    traffic: &TrafficSpec,
    now: f64,
) -> RolloutResult<ApplyResult> {
    let before = store.clone();
    let mut result = ApplyResult::skipped(plan.action, false, provenance);
    result.dry_run = false;

    let traffic_outcome = if plan.action.is_mutation() {
        mutate(store, plan, provenance, now, &mut result);
        result.applied = true;
        if !traffic.command.trim().is_empty() {
            let ctx = template_context(&result, &before.channels, &store.channels, provenance);
            run_traffic_command(&traffic.command, &ctx, traffic.timeout_s)
        } else if traffic.required {
            TrafficOutcome::not_run("required_command_missing", false, "")
        } else {
            TrafficOutcome::not_run("optional_command_missing", true, "")
        }
    } else {
        result.reason = Some(plan.reason.as_str().to_string());
        TrafficOutcome::not_run("not_required", true, traffic.command.trim())
    };

    if traffic_outcome.ok {
        store.save(path)?;
        info!(action = plan.action.as_str(), path = %path.display(), "rollout applied");
    } else {
        before.save(path)?;
        *store = before;
        result.applied = false;
        result.reverted = true;
        result.blocked = true;
        warn!(
            action = plan.action.as_str(),
            reason = %traffic_outcome.reason,
            "traffic apply failed, channel store reverted"
        );
    }
    result.traffic_apply = Some(traffic_outcome);
    Ok(result)
}

/// Apply the channel mutation and history row for `plan`.
fn mutate(
    store: &mut ChannelStore,
    plan: &Plan,
    provenance: &Provenance,
    now: f64,
    result: &mut ApplyResult,
) {
    let target = plan.target_version.clone().unwrap_or_default();
    result.target_version = Some(target.clone());

    match plan.action {
        PlanAction::SetCanary => {
            let rollout = plan.rollout_percent.unwrap_or(5).clamp(0, 100);
            let canary = &mut store.channels.canary;
            let old = std::mem::replace(&mut canary.version, target.clone());
            canary.rollout_percent = rollout;
            canary.updated_at = now;
            store.record_history(now, HistoryAction::Set, "canary", &old, &target, provenance);
            result.from_version = Some(old);
            result.rollout_percent = Some(rollout);
        }
        PlanAction::RolloutCanary => {
            let canary = &mut store.channels.canary;
            let from = canary.rollout_percent;
            let rollout = plan.rollout_percent.unwrap_or(from).clamp(0, 100);
            canary.rollout_percent = rollout;
            canary.updated_at = now;
            store.record_history(now, HistoryAction::Rollout, "canary", &target, &target, provenance);
            result.from_rollout_percent = Some(from);
            result.rollout_percent = Some(rollout);
        }
        PlanAction::PromoteStable => {
            let stable = &mut store.channels.stable;
            let old = std::mem::replace(&mut stable.version, target.clone());
            stable.rollout_percent = FULL_ROLLOUT;
            stable.updated_at = now;
            store.record_history(
                now,
                HistoryAction::Promote,
                "canary->stable",
                &old,
                &target,
                provenance,
            );
            result.from_version = Some(old);
            result.rollout_percent = Some(FULL_ROLLOUT);
        }
        PlanAction::RolloutStable => {
            let stable = &mut store.channels.stable;
            let from = stable.rollout_percent;
            stable.rollout_percent = FULL_ROLLOUT;
            stable.updated_at = now;
            store.record_history(now, HistoryAction::Rollout, "stable", &target, &target, provenance);
            result.from_rollout_percent = Some(from);
            result.rollout_percent = Some(FULL_ROLLOUT);
        }
        PlanAction::Noop => {}
    }
}

fn template_context(
    result: &ApplyResult,
    before: &Channels,
    after: &Channels,
    provenance: &Provenance,
) -> TemplateContext {
    let target = result.target_version.clone().unwrap_or_default();
    TemplateContext {
        action: result.action.as_str().to_string(),
        target_version: target.clone(),
        from_version: result.from_version.clone().unwrap_or_default(),
        to_version: target,
        correlation_id: provenance.correlation_id.clone(),
        release_candidate_id: provenance.release_candidate_id.clone(),
        from_rollout_percent: result.from_rollout_percent.unwrap_or(0).to_string(),
        to_rollout_percent: result.rollout_percent.unwrap_or(0).to_string(),
        canary_rollout_percent: after.canary.rollout_percent.to_string(),
        stable_rollout_percent: after.stable.rollout_percent.to_string(),
        canary_version: after.canary.version.clone(),
        stable_version: after.stable.version.clone(),
        before_canary_rollout_percent: before.canary.rollout_percent.to_string(),
        before_stable_rollout_percent: before.stable.rollout_percent.to_string(),
        before_canary_version: before.canary.version.clone(),
        before_stable_version: before.stable.version.clone(),
    }
}
