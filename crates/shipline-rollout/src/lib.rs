//! shipline-rollout — staged canary → stable rollouts.
//!
//! This crate decides the next rollout step for a target version, guards it
//! with external gate reports and a canary observation window, and applies
//! it to the channel store, optionally shifting real traffic through an
//! operator-supplied command with automatic revert on failure.
//!
//! # Components
//!
//! - **`policy`** — Stage ladders and gate definitions (JSON or TOML)
//! - **`gates`** — Gate report discovery and evaluation
//! - **`planner`** — Pure decision table for the next step
//! - **`observation`** — Canary dwell-time check
//! - **`traffic`** — Command templates: validate, render, execute
//! - **`applier`** — Apply-or-revert against the channel store
//! - **`executor`** — One run: checks, apply, audit record, report

pub mod applier;
pub mod error;
pub mod executor;
pub mod gates;
pub mod observation;
pub mod planner;
pub mod policy;
pub mod traffic;

pub use applier::{ApplyResult, TrafficSpec, apply_plan};
pub use error::{RolloutError, RolloutResult};
pub use executor::{AuditSettings, RolloutReport, RolloutRequest, execute, execute_at};
pub use gates::{GateEvidence, GateOutcome, evaluate_gates, latest_report, load_report};
pub use observation::Observation;
pub use planner::{Plan, PlanAction, PlanReason, plan};
pub use policy::{GatePolicy, PolicySource, RolloutPolicy, StagePolicy};
pub use traffic::{
    CommandTemplate, PLACEHOLDERS, TemplateContext, TemplateError, TemplateValidation,
    TrafficOutcome, run_traffic_command, validate_template,
};
