use std::fs;
use std::path::{Path, PathBuf};

use clap::{Args, Subcommand};
use serde::Serialize;
use serde_json::{Map, Value, json};

use shipline_audit::{AuditChain, AuditEvent, AuditRecord};
use shipline_channels::{ChannelChange, ChannelName, ChannelStore, Provenance};
use shipline_core::files::{posix, write_json_atomic};
use shipline_core::{Check, enforced_ok, now_ts, round3};
use shipline_rollout::executor::extract_version;

use super::audit::default_out;
use super::{exit_code, print_json};

/// Audit source of every manual channel operation.
const AUDIT_SOURCE: &str = "shipline_channels";

const DEFAULT_CHANNELS_FILE: &str = "security/release_channels.json";

/// Ledger settings shared by all channel operations.
#[derive(Args)]
pub struct AuditFlags {
    #[arg(long, global = true, env = "SHIPLINE_AUDIT_LOG")]
    audit_log: Option<PathBuf>,
    #[arg(long, global = true, env = "SHIPLINE_AUDIT_STATE_FILE")]
    audit_state_file: Option<PathBuf>,
    /// Actor recorded in the ledger; defaults to the operation's actor.
    #[arg(long, global = true, default_value = "")]
    audit_actor: String,
    #[arg(long, global = true)]
    skip_audit_log: bool,
    /// Fail the operation when the ledger entry cannot be recorded.
    #[arg(long, global = true)]
    audit_strict: bool,
}

#[derive(Subcommand)]
pub enum ChannelAction {
    /// Print the channel store.
    Status {
        #[arg(long, default_value = DEFAULT_CHANNELS_FILE)]
        file: PathBuf,
    },
    /// Check channel versions and rollout percentages.
    Validate {
        #[arg(long, default_value = DEFAULT_CHANNELS_FILE)]
        file: PathBuf,
        /// Read for the expected version when none is given.
        #[arg(long, default_value = "Cargo.toml")]
        version_file: PathBuf,
        #[arg(long, default_value = "")]
        expected_version: String,
        #[arg(long)]
        strict: bool,
        #[arg(long)]
        out: Option<PathBuf>,
    },
    /// Point a channel at a version.
    #[command(disable_version_flag = true)]
    Set {
        #[arg(long, default_value = DEFAULT_CHANNELS_FILE)]
        file: PathBuf,
        #[arg(long)]
        channel: ChannelName,
        #[arg(long)]
        version: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "system")]
        actor: String,
    },
    /// Copy a version from one channel to the other.
    #[command(disable_version_flag = true)]
    Promote {
        #[arg(long, default_value = DEFAULT_CHANNELS_FILE)]
        file: PathBuf,
        #[arg(long, default_value = "canary")]
        source: ChannelName,
        #[arg(long, default_value = "stable")]
        target: ChannelName,
        /// Defaults to the source channel's version.
        #[arg(long)]
        version: Option<String>,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "system")]
        actor: String,
    },
    /// Point a channel back at an earlier version.
    Rollback {
        #[arg(long, default_value = DEFAULT_CHANNELS_FILE)]
        file: PathBuf,
        #[arg(long, default_value = "stable")]
        channel: ChannelName,
        #[arg(long)]
        to_version: String,
        #[arg(long, default_value = "")]
        reason: String,
        #[arg(long, default_value = "system")]
        actor: String,
    },
}

#[derive(Serialize)]
struct ChangeReport {
    ok: bool,
    #[serde(flatten)]
    change: ChannelChange,
    file: String,
    audit: AuditRecord,
}

#[derive(Serialize)]
struct ValidateReport {
    ok: bool,
    ts: f64,
    file: String,
    expected_version: String,
    store: ChannelStore,
    checks: Vec<Check>,
    audit: AuditRecord,
}

pub fn run(flags: &AuditFlags, action: ChannelAction) -> anyhow::Result<u8> {
    match action {
        ChannelAction::Status { file } => {
            print_json(&ChannelStore::load(&file)?)?;
            Ok(0)
        }
        ChannelAction::Validate {
            file,
            version_file,
            expected_version,
            strict,
            out,
        } => validate(flags, &file, &version_file, &expected_version, strict, out),
        ChannelAction::Set {
            file,
            channel,
            version,
            reason,
            actor,
        } => change(flags, &file, &actor, |store, who, now| {
            store.set_channel(channel, &version, &who.with_reason(&reason), now)
        }),
        ChannelAction::Promote {
            file,
            source,
            target,
            version,
            reason,
            actor,
        } => change(flags, &file, &actor, |store, who, now| {
            store.promote(source, target, version.as_deref(), &who.with_reason(&reason), now)
        }),
        ChannelAction::Rollback {
            file,
            channel,
            to_version,
            reason,
            actor,
        } => change(flags, &file, &actor, |store, who, now| {
            store.rollback(channel, &to_version, &who.with_reason(&reason), now)
        }),
    }
}

/// Load, mutate, save, and record one manual operation.
fn change<F>(flags: &AuditFlags, file: &Path, actor: &str, op: F) -> anyhow::Result<u8>
where
    F: FnOnce(&mut ChannelStore, Operator<'_>, f64) -> shipline_channels::ChannelResult<ChannelChange>,
{
    let mut store = ChannelStore::load(file)?;
    let change = op(&mut store, Operator(actor), round3(now_ts()))?;
    store.save(file)?;

    let file = posix(file);
    let mut context = match serde_json::to_value(&change)? {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    context.insert("ok".into(), Value::Bool(true));
    context.insert("file".into(), Value::String(file.clone()));

    let action = format!("release_channel_{}", change.action.as_str());
    let audit = record(flags, &action, actor, "release-bot", "ok", context)?;
    let ok = audit.ok || !flags.audit_strict;
    let report = ChangeReport {
        ok,
        change,
        file,
        audit,
    };
    print_json(&report)?;
    Ok(exit_code(ok))
}

fn validate(
    flags: &AuditFlags,
    file: &Path,
    version_file: &Path,
    expected_version: &str,
    strict: bool,
    out: Option<PathBuf>,
) -> anyhow::Result<u8> {
    let store = ChannelStore::load(file)?;
    let expected = match expected_version.trim() {
        "" => fs::read_to_string(version_file)
            .ok()
            .and_then(|text| extract_version(&text))
            .unwrap_or_default(),
        given => given.to_string(),
    };
    let checks = store.validate(Some(expected.as_str()), strict);
    let checks_ok = enforced_ok(&checks);
    let file = posix(file);

    let context = json!({
        "file": file,
        "expected_version": expected,
        "strict": strict,
        "check_count": checks.len(),
    });
    let status = if checks_ok { "ok" } else { "failed" };
    let audit = record(
        flags,
        "release_channel_validate",
        "",
        "release-auditor",
        status,
        context.as_object().cloned().unwrap_or_default(),
    )?;

    let ts = round3(now_ts());
    let report = ValidateReport {
        ok: checks_ok && (audit.ok || !flags.audit_strict),
        ts,
        file,
        expected_version: expected,
        store,
        checks,
        audit,
    };
    let out = out.unwrap_or_else(|| {
        default_out(&format!("release_channels_validate_{}.json", ts as i64))
    });
    write_json_atomic(&out, &report)?;
    print_json(&report)?;
    Ok(exit_code(report.ok))
}

/// The person or bot running a manual operation.
struct Operator<'a>(&'a str);

impl Operator<'_> {
    fn with_reason(&self, reason: &str) -> Provenance {
        Provenance::new(reason, self.0)
    }
}

/// Record a manual operation unless the ledger is skipped. The ledger
/// actor is `--audit-actor`, else `actor`, else `fallback`.
fn record(
    flags: &AuditFlags,
    action: &str,
    actor: &str,
    fallback: &str,
    status: &str,
    context: Map<String, Value>,
) -> anyhow::Result<AuditRecord> {
    if flags.skip_audit_log {
        return Ok(AuditRecord::skipped());
    }
    let actor = [flags.audit_actor.as_str(), actor, fallback]
        .into_iter()
        .map(str::trim)
        .find(|a| !a.is_empty())
        .unwrap_or("system");
    let chain = AuditChain::resolve(flags.audit_log.as_deref(), flags.audit_state_file.as_deref());
    let event = AuditEvent::new(action)
        .actor(actor)
        .source(AUDIT_SOURCE)
        .status(status)
        .context(context);
    Ok(chain.record_operation(&event, false)?)
}
