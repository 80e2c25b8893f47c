//! End-to-end rollout runs against scratch directories.

use std::fs;
use std::path::Path;

use shipline_audit::{AuditChain, VerifyOptions};
use shipline_channels::{ChannelStore, HistoryAction, Provenance};
use shipline_core::failing_ids;
use shipline_rollout::*;

fn request(dir: &Path) -> RolloutRequest {
    RolloutRequest {
        channels_file: dir.join("release/channels.json"),
        policy_file: dir.join("release/policy.json"),
        version_file: None,
        target_version: Some("1.0.0".into()),
        actor: "release-bot".into(),
        reason: String::new(),
        apply: false,
        dry_run: false,
        traffic: TrafficSpec {
            command: String::new(),
            timeout_s: 10.0,
            required: false,
        },
        allow_gate_failures: false,
        strict: true,
        correlation_id: "corr-42".into(),
        release_candidate_id: String::new(),
        audit: AuditSettings {
            log_path: Some(dir.join("audit/log.ndjson")),
            state_path: Some(dir.join("audit/state.json")),
            skip: false,
            strict: true,
        },
        out: Some(dir.join("out/report.json")),
    }
}

fn check<'a>(report: &'a RolloutReport, id: &str) -> &'a shipline_core::Check {
    report
        .checks
        .iter()
        .find(|c| c.id == id)
        .unwrap_or_else(|| panic!("missing check {id}"))
}

#[test]
fn empty_store_starts_canary() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;

    let report = execute(&req).unwrap();
    assert!(report.ok, "{:?}", failing_ids(&report.checks));
    assert_eq!(report.exit_code(), 0);
    assert_eq!(report.plan.action, PlanAction::SetCanary);
    assert_eq!(report.plan.rollout_percent, Some(5));
    assert!(report.apply_result.applied);
    assert_eq!(report.correlation.release_candidate_id, "corr-42");

    let store = ChannelStore::load(&req.channels_file).unwrap();
    assert_eq!(store.channels.canary.version, "1.0.0");
    assert_eq!(store.channels.canary.rollout_percent, 5);
    let row = store.entries().next().unwrap();
    assert_eq!(row.reason, "start_canary_stage");
    assert_eq!(row.correlation_id, "corr-42");

    assert!(report.audit.ok);
    let chain = AuditChain::new(
        dir.path().join("audit/log.ndjson"),
        dir.path().join("audit/state.json"),
    );
    let verification = chain.verify(&VerifyOptions {
        require_log: true,
        require_state: true,
        strict: true,
        ..Default::default()
    });
    assert!(verification.ok);
    assert_eq!(verification.entry_count, 1);

    let written: serde_json::Value =
        serde_json::from_str(&fs::read_to_string(dir.path().join("out/report.json")).unwrap())
            .unwrap();
    assert_eq!(written["plan"]["action"], "set_canary");
    assert_eq!(written["audit"]["entry"]["source"], "shipline_rollout");
    assert_eq!(written["checks"].as_array().unwrap().last().unwrap()["id"], "audit_chain_recorded");
}

#[test]
fn completed_canary_promotes_after_observation() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;

    let mut store = ChannelStore::default();
    store.channels.canary.version = "1.0.0".into();
    store.channels.canary.rollout_percent = 50;
    store.channels.stable.version = "0.9.0".into();
    let who = Provenance::new("seed", "tests");
    store.record_history(1000.0, HistoryAction::Set, "canary", "", "1.0.0", &who);
    store.save(&req.channels_file).unwrap();

    let report = execute(&req).unwrap();
    assert!(report.ok, "{:?}", failing_ids(&report.checks));
    assert_eq!(report.plan.action, PlanAction::PromoteStable);
    assert!(check(&report, "canary_observation_window_met").ok);

    let store = ChannelStore::load(&req.channels_file).unwrap();
    assert_eq!(store.channels.stable.version, "1.0.0");
    assert_eq!(store.channels.stable.rollout_percent, 100);
    assert_eq!(store.entries().last().unwrap().channel, "canary->stable");
}

#[test]
fn fresh_canary_blocks_promotion() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;

    let mut store = ChannelStore::default();
    store.channels.canary.version = "1.0.0".into();
    store.channels.canary.rollout_percent = 5;
    let who = Provenance::new("seed", "tests");
    store.record_history(1_000_000.0, HistoryAction::Set, "canary", "", "1.0.0", &who);
    store.save(&req.channels_file).unwrap();
    let before = fs::read(&req.channels_file).unwrap();

    let report = execute_at(&req, 1_000_010.0).unwrap();
    assert!(!report.ok);
    assert_eq!(report.exit_code(), 2);
    assert_eq!(report.plan.action, PlanAction::RolloutCanary);
    assert!(!check(&report, "canary_observation_window_met").ok);
    assert!(!check(&report, "rollout_apply_not_blocked").ok);
    assert!(report.apply_result.blocked);
    assert_eq!(fs::read(&req.channels_file).unwrap(), before);
}

#[cfg(unix)]
#[test]
fn failing_traffic_command_reverts_store_exactly() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;
    req.traffic = TrafficSpec {
        command: "sh -c 'exit 7' shift {target_version} {to_rollout_percent}".into(),
        timeout_s: 10.0,
        required: true,
    };

    let mut store = ChannelStore::default();
    store.channels.stable.version = "0.9.0".into();
    store.save(&req.channels_file).unwrap();
    let before = fs::read(&req.channels_file).unwrap();

    let report = execute(&req).unwrap();
    assert!(!report.ok);
    assert!(report.apply_result.reverted);
    assert!(!report.apply_result.applied);
    let traffic = report.apply_result.traffic_apply.as_ref().unwrap();
    assert_eq!(traffic.reason, "non_zero_exit:7");
    assert_eq!(
        traffic.command_argv,
        vec!["sh", "-c", "exit 7", "shift", "1.0.0", "5"]
    );
    assert!(!check(&report, "traffic_apply_command_ok").ok);
    assert_eq!(fs::read(&req.channels_file).unwrap(), before);
}

#[cfg(unix)]
#[test]
fn succeeding_traffic_command_persists() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;
    req.traffic = TrafficSpec {
        command: "true {action} {before_canary_version}".into(),
        timeout_s: 10.0,
        required: true,
    };

    let report = execute(&req).unwrap();
    assert!(report.ok, "{:?}", failing_ids(&report.checks));
    let traffic = report.apply_result.traffic_apply.as_ref().unwrap();
    assert!(traffic.executed && traffic.ok);
    assert_eq!(traffic.command_argv, vec!["true", "set_canary", ""]);
    assert_eq!(
        ChannelStore::load(&req.channels_file).unwrap().channels.canary.version,
        "1.0.0"
    );
}

#[test]
fn unknown_placeholder_blocks_apply() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;
    req.traffic.command = "deployctl {target_version} {region}".into();

    let report = execute(&req).unwrap();
    assert!(!report.ok);
    let row = check(&report, "traffic_apply_template_valid");
    assert!(!row.ok);
    assert_eq!(row.value["unknown_placeholders"][0], "region");
    assert!(!req.channels_file.exists());
}

#[test]
fn missing_required_gate_blocks_unless_allowed() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.apply = true;
    req.policy_file = dir.path().join("release/policy.toml");
    fs::create_dir_all(dir.path().join("release")).unwrap();
    fs::write(
        &req.policy_file,
        format!(
            "[[gates.required_reports]]\nid = \"preflight\"\npattern = \"{}/reports/*.json\"\n",
            dir.path().display()
        ),
    )
    .unwrap();

    let report = execute(&req).unwrap();
    assert!(!report.ok);
    assert!(!check(&report, "gate::preflight").ok);
    assert_eq!(report.gate_evidence[0].age_s, "inf");
    assert!(report.next_actions[0].starts_with("Required rollout gates failed"));
    assert!(!req.channels_file.exists());

    req.allow_gate_failures = true;
    req.strict = false;
    req.audit.strict = false;
    let report = execute(&req).unwrap();
    assert!(report.ok);
    assert!(report.apply_result.applied);
}

#[test]
fn planning_run_leaves_store_alone() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.audit.skip = true;

    let report = execute(&req).unwrap();
    assert!(report.ok);
    assert!(report.dry_run && !report.run_apply);
    assert_eq!(report.apply_result.reason.as_deref(), Some("planning_only_run"));
    assert!(report.audit.skipped);
    assert!(!req.channels_file.exists());
    assert!(!dir.path().join("audit/log.ndjson").exists());
}

#[test]
fn target_version_from_version_file() {
    let dir = tempfile::tempdir().unwrap();
    let mut req = request(dir.path());
    req.target_version = None;
    req.correlation_id = String::new();
    req.audit.skip = true;
    let version_file = dir.path().join("Cargo.toml");
    fs::write(&version_file, "[package]\nname = \"app\"\nversion = \"2.1.0\"\n").unwrap();
    req.version_file = Some(version_file);

    let report = execute_at(&req, 1_700_000_000.0).unwrap();
    assert_eq!(report.target_version, "2.1.0");
    assert_eq!(report.correlation.correlation_id, "rollout-1700000000");
    assert_eq!(report.correlation.release_candidate_id, "rc-2-1-0-1700000000");
}

#[test]
fn malformed_policy_fails_the_run() {
    let dir = tempfile::tempdir().unwrap();
    let req = request(dir.path());
    fs::create_dir_all(dir.path().join("release")).unwrap();
    fs::write(&req.policy_file, "{not json").unwrap();

    let report = execute(&req).unwrap();
    assert!(!report.ok);
    assert!(!check(&report, "rollout_policy_loaded").ok);
    assert_eq!(report.stages.canary, vec![5, 20, 50]);
}
