use std::path::{Path, PathBuf};

use anyhow::{Context, bail};
use clap::Args;
use serde::Serialize;
use serde_json::{Map, Value, json};
use tracing::info;

use shipline_audit::{
    AuditChain, AuditEvent, VerifyOptions, build_state_snapshot, load_state, verify_chain,
    write_state,
};
use shipline_core::files::{posix, write_json_atomic};
use shipline_core::{Check, enforced_ok, now_ts, round3};
use shipline_rollout::executor::DEFAULT_OUT_DIR;

use super::{exit_code, print_json};

#[derive(Args)]
pub struct VerifyArgs {
    /// Ledger file.
    #[arg(long, env = "SHIPLINE_AUDIT_LOG")]
    log: Option<PathBuf>,
    /// Continuity snapshot file.
    #[arg(long, env = "SHIPLINE_AUDIT_STATE_FILE")]
    state_file: Option<PathBuf>,
    /// Enforce attribution checks and a writable snapshot.
    #[arg(long)]
    strict: bool,
    #[arg(long)]
    require_log: bool,
    #[arg(long)]
    require_state: bool,
    /// Maximum age of the newest entry in seconds; 0 disables the check.
    #[arg(long, default_value_t = 0.0)]
    max_age_s: f64,
    /// Do not refresh the snapshot after a successful verification.
    #[arg(long)]
    no_write_state: bool,
    /// Report path; defaults to `.data/out/audit_chain_verify_<epoch>.json`.
    #[arg(long)]
    out: Option<PathBuf>,
}

#[derive(Args)]
pub struct RecordArgs {
    #[arg(long)]
    action: String,
    #[arg(long, default_value = "system")]
    actor: String,
    #[arg(long, default_value = "unknown")]
    source: String,
    #[arg(long, default_value = "ok")]
    status: String,
    /// JSON object stored as the entry's context.
    #[arg(long, default_value = "{}")]
    context: String,
    #[arg(long, env = "SHIPLINE_AUDIT_LOG")]
    log: Option<PathBuf>,
    #[arg(long, env = "SHIPLINE_AUDIT_STATE_FILE")]
    state_file: Option<PathBuf>,
}

#[derive(Serialize)]
struct VerifyReport {
    ok: bool,
    started_at: f64,
    ended_at: f64,
    duration_s: f64,
    log_path: String,
    state_file: String,
    state_loaded: bool,
    state_written: bool,
    strict: bool,
    require_log: bool,
    require_state: bool,
    max_age_s: f64,
    entry_count: usize,
    last_hash: String,
    last_ts: f64,
    checks: Vec<Check>,
}

pub fn verify(args: VerifyArgs) -> anyhow::Result<u8> {
    let started = now_ts();
    let chain = AuditChain::resolve(args.log.as_deref(), args.state_file.as_deref());
    let state = load_state(&chain.state_path);
    let max_age_s = args.max_age_s.max(0.0);

    let verification = verify_chain(
        &chain.log_path,
        state.as_ref(),
        &VerifyOptions {
            require_log: args.require_log,
            require_state: args.require_state,
            strict: args.strict,
            max_age_s,
            now_ts: None,
        },
    );

    let mut state_written = false;
    let mut write_error = String::new();
    if verification.ok && !args.no_write_state {
        let snapshot = build_state_snapshot(&chain.log_path, &verification);
        match write_state(&chain.state_path, &snapshot) {
            Ok(()) => state_written = true,
            Err(err) => write_error = err.to_string(),
        }
    }

    let mut checks = verification.checks.clone();
    checks.push(Check::enforce(
        "audit_state_write_ok",
        write_error.is_empty() || !args.strict,
        json!({
            "attempted": !args.no_write_state,
            "written": state_written,
            "error": write_error,
        }),
        "state snapshot should be writable in strict mode",
    ));

    let ok = verification.ok && enforced_ok(&checks);
    let ended = now_ts();
    let report = VerifyReport {
        ok,
        started_at: round3(started),
        ended_at: round3(ended),
        duration_s: round3(ended - started),
        log_path: posix(&chain.log_path),
        state_file: posix(&chain.state_path),
        state_loaded: state.is_some(),
        state_written,
        strict: args.strict,
        require_log: args.require_log,
        require_state: args.require_state,
        max_age_s,
        entry_count: verification.entry_count,
        last_hash: verification.last_hash.clone(),
        last_ts: verification.last_ts,
        checks,
    };

    let out = args
        .out
        .unwrap_or_else(|| default_out(&format!("audit_chain_verify_{}.json", ended as i64)));
    write_json_atomic(&out, &report)?;
    info!(ok, entries = report.entry_count, out = %out.display(), "audit chain verified");
    print_json(&report)?;
    Ok(exit_code(ok))
}

pub fn record(args: RecordArgs) -> anyhow::Result<u8> {
    let context = parse_context(&args.context)?;
    let chain = AuditChain::resolve(args.log.as_deref(), args.state_file.as_deref());
    let event = AuditEvent::new(args.action)
        .actor(args.actor)
        .source(args.source)
        .status(args.status)
        .context(context);
    let record = chain.record_operation(&event, false)?;
    print_json(&record)?;
    Ok(exit_code(record.ok))
}

fn parse_context(text: &str) -> anyhow::Result<Map<String, Value>> {
    let value: Value = serde_json::from_str(text).context("--context is not valid JSON")?;
    match value {
        Value::Object(map) => Ok(map),
        other => bail!("--context must be a JSON object, got {other}"),
    }
}

/// `.data/out/<name>`
pub fn default_out(name: &str) -> PathBuf {
    Path::new(DEFAULT_OUT_DIR).join(name)
}
