use std::path::PathBuf;

use clap::Args;

use shipline_rollout::traffic::DEFAULT_TIMEOUT_S;
use shipline_rollout::{AuditSettings, RolloutRequest, TrafficSpec};

use super::print_json;

#[derive(Args)]
pub struct RolloutArgs {
    /// Channel store document.
    #[arg(long, default_value = "security/release_channels.json")]
    channels_file: PathBuf,
    /// Rollout policy (JSON, or TOML by extension).
    #[arg(long, default_value = "security/release_rollout_policy.json")]
    policy: PathBuf,
    /// File with a `version = "x.y.z"` line, read when no target is given.
    #[arg(long, default_value = "Cargo.toml")]
    version_file: PathBuf,
    #[arg(long)]
    target_version: Option<String>,
    #[arg(long, default_value = "release-bot")]
    actor: String,
    /// History reason; defaults to the plan's reason.
    #[arg(long, default_value = "")]
    reason: String,
    /// Apply the planned step instead of only planning it.
    #[arg(long)]
    apply: bool,
    #[arg(long)]
    dry_run: bool,
    /// Command template run after the store is mutated, e.g.
    /// `deployctl shift {target_version} {to_rollout_percent}`.
    #[arg(long, default_value = "")]
    traffic_apply_command: String,
    /// Seconds; clamped to 0.1..=86400.
    #[arg(long, default_value_t = DEFAULT_TIMEOUT_S, value_parser = parse_timeout)]
    traffic_apply_timeout_s: f64,
    /// Fail the apply when no traffic command is given or it fails.
    #[arg(long)]
    traffic_apply_required: bool,
    /// Apply even when required gates fail.
    #[arg(long)]
    allow_gate_failures: bool,
    #[arg(long)]
    strict: bool,
    #[arg(long, env = "SHIPLINE_CORRELATION_ID", default_value = "")]
    correlation_id: String,
    #[arg(long, env = "SHIPLINE_RELEASE_CANDIDATE_ID", default_value = "")]
    release_candidate_id: String,
    #[arg(long, env = "SHIPLINE_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
    #[arg(long, env = "SHIPLINE_AUDIT_STATE_FILE")]
    audit_state_file: Option<PathBuf>,
    #[arg(long)]
    skip_audit_log: bool,
    /// Fail the run when the audit entry cannot be recorded.
    #[arg(long)]
    audit_strict: bool,
    /// Report path; defaults to `.data/out/release_rollout_executor_<epoch>.json`.
    #[arg(long)]
    out: Option<PathBuf>,
}

impl RolloutArgs {
    fn into_request(self) -> RolloutRequest {
        RolloutRequest {
            channels_file: self.channels_file,
            policy_file: self.policy,
            version_file: Some(self.version_file),
            target_version: self.target_version,
            actor: self.actor,
            reason: self.reason,
            apply: self.apply,
            dry_run: self.dry_run,
            traffic: TrafficSpec {
                command: self.traffic_apply_command,
                timeout_s: self.traffic_apply_timeout_s,
                required: self.traffic_apply_required,
            },
            allow_gate_failures: self.allow_gate_failures,
            strict: self.strict,
            correlation_id: self.correlation_id,
            release_candidate_id: self.release_candidate_id,
            audit: AuditSettings {
                log_path: self.audit_log,
                state_path: self.audit_state_file,
                skip: self.skip_audit_log,
                strict: self.audit_strict,
            },
            out: self.out,
        }
    }
}

pub fn run(args: RolloutArgs) -> anyhow::Result<u8> {
    let report = shipline_rollout::execute(&args.into_request())?;
    print_json(&report)?;
    Ok(u8::try_from(report.exit_code()).unwrap_or(super::EXIT_FAILED))
}

/// A finite, non-negative number of seconds.
fn parse_timeout(raw: &str) -> Result<f64, String> {
    let secs: f64 = raw.trim().parse().map_err(|e| format!("{e}"))?;
    if !secs.is_finite() || secs < 0.0 {
        return Err(format!("expected a finite, non-negative number of seconds, got {raw}"));
    }
    Ok(secs)
}
