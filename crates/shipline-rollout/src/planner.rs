//! Rollout planner — the next step towards a target version.
//!
//! A pure decision table over the current channel state. Rules are tried
//! in order and the first match wins:
//!
//! 1. stable already serves the target at 100% → `noop`
//! 2. canary does not serve the target → `set_canary` at the first stage
//! 3. stable does not serve the target → advance canary to the next stage,
//!    or `promote_stable` once every stage is done
//! 4. stable serves the target below 100% → `rollout_stable`
//! 5. otherwise → `noop`

use serde::Serialize;

use shipline_channels::{Channels, DEFAULT_CANARY_ROLLOUT, FULL_ROLLOUT};

/// What the plan does.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanAction {
    Noop,
    SetCanary,
    RolloutCanary,
    PromoteStable,
    RolloutStable,
}

impl PlanAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanAction::Noop => "noop",
            PlanAction::SetCanary => "set_canary",
            PlanAction::RolloutCanary => "rollout_canary",
            PlanAction::PromoteStable => "promote_stable",
            PlanAction::RolloutStable => "rollout_stable",
        }
    }

    /// Whether applying the plan changes the store.
    pub fn is_mutation(&self) -> bool {
        !matches!(self, PlanAction::Noop)
    }

    /// Whether the canary must have dwelt on its stage first.
    pub fn needs_observation(&self) -> bool {
        matches!(self, PlanAction::RolloutCanary | PlanAction::PromoteStable)
    }
}

/// Why the planner chose its action.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanReason {
    TargetAlreadyStable,
    StartCanaryStage,
    AdvanceCanaryStage,
    CanaryStagesCompleted,
    NormalizeStableRollout,
    NoChangeNeeded,
}

impl PlanReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanReason::TargetAlreadyStable => "target_already_stable",
            PlanReason::StartCanaryStage => "start_canary_stage",
            PlanReason::AdvanceCanaryStage => "advance_canary_stage",
            PlanReason::CanaryStagesCompleted => "canary_stages_completed",
            PlanReason::NormalizeStableRollout => "normalize_stable_rollout",
            PlanReason::NoChangeNeeded => "no_change_needed",
        }
    }
}

/// A computed, never-persisted rollout step.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Plan {
    pub action: PlanAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub target_version: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_rollout_percent: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub rollout_percent: Option<i64>,
    pub reason: PlanReason,
}

impl Plan {
    fn noop(reason: PlanReason) -> Self {
        Self {
            action: PlanAction::Noop,
            target_version: None,
            from_rollout_percent: None,
            rollout_percent: None,
            reason,
        }
    }

    fn step(
        action: PlanAction,
        target: &str,
        from_rollout_percent: Option<i64>,
        rollout_percent: i64,
        reason: PlanReason,
    ) -> Self {
        Self {
            action,
            target_version: Some(target.to_string()),
            from_rollout_percent,
            rollout_percent: Some(rollout_percent),
            reason,
        }
    }
}

/// Decide the next step for `target` given the current channels and the
/// ascending canary ladder.
pub fn plan(target: &str, channels: &Channels, canary_stages: &[i64]) -> Plan {
    let canary = &channels.canary;
    let stable = &channels.stable;

    if stable.version == target && stable.rollout_percent >= FULL_ROLLOUT {
        return Plan::noop(PlanReason::TargetAlreadyStable);
    }
    if canary.version != target {
        let start = canary_stages.first().copied().unwrap_or(DEFAULT_CANARY_ROLLOUT);
        return Plan::step(PlanAction::SetCanary, target, None, start, PlanReason::StartCanaryStage);
    }
    if stable.version != target {
        return match next_stage(canary.rollout_percent, canary_stages) {
            Some(next) => Plan::step(
                PlanAction::RolloutCanary,
                target,
                Some(canary.rollout_percent),
                next,
                PlanReason::AdvanceCanaryStage,
            ),
            None => Plan::step(
                PlanAction::PromoteStable,
                target,
                None,
                FULL_ROLLOUT,
                PlanReason::CanaryStagesCompleted,
            ),
        };
    }
    if stable.rollout_percent < FULL_ROLLOUT {
        return Plan::step(
            PlanAction::RolloutStable,
            target,
            Some(stable.rollout_percent),
            FULL_ROLLOUT,
            PlanReason::NormalizeStableRollout,
        );
    }
    Plan::noop(PlanReason::NoChangeNeeded)
}

/// First stage strictly above `current`.
fn next_stage(current: i64, stages: &[i64]) -> Option<i64> {
    stages.iter().copied().find(|stage| *stage > current)
}
