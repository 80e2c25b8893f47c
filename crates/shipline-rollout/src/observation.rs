//! Canary observation window.

use serde_json::{Value, json};

use shipline_channels::{ChannelStore, HistoryAction};
use shipline_core::{Check, Severity, round3};

use crate::planner::PlanAction;

/// How long the canary has served the target at its current stage.
#[derive(Debug, Clone, PartialEq)]
pub struct Observation {
    /// False when the plan does not advance the canary.
    pub required: bool,
    pub min_stage_observe_s: f64,
    /// Latest canary change for the target, 0 when unknown.
    pub latest_canary_change_ts: f64,
    /// `None` when there is no usable change timestamp.
    pub observe_delta_s: Option<f64>,
}

impl Observation {
    /// Evaluate the window for `action` at time `now`.
    pub fn evaluate(
        action: PlanAction,
        store: &ChannelStore,
        target: &str,
        min_stage_observe_s: f64,
        now: f64,
    ) -> Self {
        if !action.needs_observation() {
            return Self {
                required: false,
                min_stage_observe_s,
                latest_canary_change_ts: 0.0,
                observe_delta_s: None,
            };
        }
        let latest = latest_canary_change_ts(store, target);
        Self {
            required: true,
            min_stage_observe_s,
            latest_canary_change_ts: latest,
            observe_delta_s: (latest > 0.0).then(|| now - latest),
        }
    }

    /// A missing timestamp counts as infinitely old.
    pub fn is_met(&self) -> bool {
        !self.required
            || self
                .observe_delta_s
                .is_none_or(|delta| delta >= self.min_stage_observe_s)
    }

    pub fn to_value(&self) -> Value {
        if !self.required {
            return json!({ "required": false });
        }
        json!({
            "required": true,
            "min_stage_observe_s": self.min_stage_observe_s,
            "latest_canary_change_ts": round3(self.latest_canary_change_ts),
            "observe_delta_s": match self.observe_delta_s {
                Some(delta) => json!(round3(delta)),
                None => json!("inf"),
            },
        })
    }

    pub fn check(&self, strict: bool) -> Check {
        Check::new(
            "canary_observation_window_met",
            self.is_met(),
            self.to_value(),
            "canary has been observed for minimum stage interval",
            Severity::enforce_if(strict),
        )
    }
}

/// Timestamp of the newest canary `set`/`rollout` to `target`, falling back
/// to the canary's `updated_at`.
fn latest_canary_change_ts(store: &ChannelStore, target: &str) -> f64 {
    store
        .entries()
        .rev()
        .find(|row| {
            row.channel == "canary"
                && row.to_version == target
                && matches!(row.action, HistoryAction::Set | HistoryAction::Rollout)
        })
        .map(|row| row.ts)
        .unwrap_or(store.channels.canary.updated_at)
}
