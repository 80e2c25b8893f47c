use std::fs;
use std::path::Path;
use std::process::{Command, Output};

use serde_json::Value;

fn shipline(dir: &Path, args: &[&str]) -> Output {
    Command::new(env!("CARGO_BIN_EXE_shipline"))
        .current_dir(dir)
        .args(args)
        .env_remove("SHIPLINE_AUDIT_LOG")
        .env_remove("SHIPLINE_AUDIT_STATE_FILE")
        .env_remove("SHIPLINE_CORRELATION_ID")
        .env_remove("SHIPLINE_RELEASE_CANDIDATE_ID")
        .output()
        .expect("should execute shipline")
}

fn stdout_json(output: &Output) -> Value {
    serde_json::from_slice(&output.stdout).unwrap_or_else(|err| {
        panic!(
            "stdout is not json ({err}); stderr: {}",
            String::from_utf8_lossy(&output.stderr)
        )
    })
}

#[test]
fn rollout_apply_writes_store_report_and_ledger() {
    let dir = tempfile::tempdir().unwrap();
    let output = shipline(
        dir.path(),
        &[
            "rollout",
            "--target-version",
            "1.0.0",
            "--apply",
            "--strict",
            "--correlation-id",
            "corr-7",
            "--out",
            "out/rollout.json",
        ],
    );
    assert!(
        output.status.success(),
        "stderr: {}",
        String::from_utf8_lossy(&output.stderr)
    );

    let report = stdout_json(&output);
    assert_eq!(report["ok"], true);
    assert_eq!(report["plan"]["action"], "set_canary");
    assert_eq!(report["correlation"]["release_candidate_id"], "corr-7");
    assert!(dir.path().join("out/rollout.json").is_file());
    assert!(dir.path().join("security/release_channels.json").is_file());

    let verify = shipline(
        dir.path(),
        &["audit", "verify", "--require-log", "--strict", "--out", "out/verify.json"],
    );
    assert!(verify.status.success());
    let verified = stdout_json(&verify);
    assert_eq!(verified["entry_count"], 1);
    assert_eq!(verified["state_written"], true);
    assert_eq!(verified["checks"].as_array().unwrap().last().unwrap()["id"], "audit_state_write_ok");
}

#[test]
fn tampered_ledger_fails_verify_with_exit_2() {
    let dir = tempfile::tempdir().unwrap();
    for action in ["deploy", "scale"] {
        let out = shipline(
            dir.path(),
            &["audit", "record", "--action", action, "--actor", "ops", "--context", r#"{"n": 1}"#],
        );
        assert!(out.status.success());
        assert_eq!(stdout_json(&out)["entry"]["action"], action);
    }

    let log = dir.path().join(".data/audit/operations_audit_chain.ndjson");
    let text = fs::read_to_string(&log).unwrap();
    fs::write(&log, text.replacen("\"deploy\"", "\"delete\"", 1)).unwrap();

    let verify = shipline(dir.path(), &["audit", "verify", "--out", "verify.json"]);
    assert_eq!(verify.status.code(), Some(2));
    let report = stdout_json(&verify);
    assert_eq!(report["ok"], false);
    assert_eq!(report["state_written"], false);
    let failing: Vec<&str> = report["checks"]
        .as_array()
        .unwrap()
        .iter()
        .filter(|c| c["ok"] == false)
        .map(|c| c["id"].as_str().unwrap())
        .collect();
    assert_eq!(failing, vec!["entry_1_hash_match"]);
}

#[test]
fn record_rejects_non_object_context() {
    let dir = tempfile::tempdir().unwrap();
    let out = shipline(dir.path(), &["audit", "record", "--action", "x", "--context", "[1]"]);
    assert!(!out.status.success());
    assert!(String::from_utf8_lossy(&out.stderr).contains("JSON object"));
}

#[test]
fn manual_channel_operations_are_recorded() {
    let dir = tempfile::tempdir().unwrap();
    let store = "channels.json";

    let set = shipline(
        dir.path(),
        &["channels", "set", "--file", store, "--channel", "canary", "--version", "2.0.0"],
    );
    assert!(set.status.success());
    assert_eq!(stdout_json(&set)["to_version"], "2.0.0");

    let promote = shipline(dir.path(), &["channels", "promote", "--file", store, "--actor", "alice"]);
    assert!(promote.status.success());
    let promoted = stdout_json(&promote);
    assert_eq!(promoted["channel"], "canary->stable");
    assert_eq!(promoted["audit"]["entry"]["action"], "release_channel_promote");
    assert_eq!(promoted["audit"]["entry"]["actor"], "alice");

    let rollback = shipline(
        dir.path(),
        &["channels", "rollback", "--file", store, "--to-version", "1.9.0", "--skip-audit-log"],
    );
    assert!(rollback.status.success());
    assert_eq!(stdout_json(&rollback)["audit"]["skipped"], true);

    let status = stdout_json(&shipline(dir.path(), &["channels", "status", "--file", store]));
    assert_eq!(status["channels"]["stable"]["version"], "1.9.0");
    assert_eq!(status["channels"]["stable"]["rollout_percent"], 100);
    assert_eq!(status["history"].as_array().unwrap().len(), 3);

    let validate = shipline(
        dir.path(),
        &[
            "channels",
            "validate",
            "--file",
            store,
            "--expected-version",
            "2.0.0",
            "--strict",
            "--out",
            "validate.json",
        ],
    );
    assert!(validate.status.success());
    assert_eq!(stdout_json(&validate)["audit"]["entry"]["actor"], "release-auditor");
}

#[test]
fn invalid_version_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let out = shipline(
        dir.path(),
        &["channels", "set", "--channel", "stable", "--version", "latest", "--skip-audit-log"],
    );
    assert!(!out.status.success());
    assert!(!dir.path().join("security/release_channels.json").exists());
}

#[test]
fn gates_latest_reports_newest_match() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir_all(dir.path().join("reports")).unwrap();
    fs::write(
        dir.path().join("reports/preflight.json"),
        r#"{"ok": true, "ended_at": 1700000000.5}"#,
    )
    .unwrap();

    let out = shipline(dir.path(), &["gates", "latest", "--pattern", "reports/*.json"]);
    assert!(out.status.success());
    let found = stdout_json(&out);
    assert_eq!(found["report_path"], "reports/preflight.json");
    assert_eq!(found["report_ts"], 1700000000.5);
    assert_eq!(found["report"]["ok"], true);

    let none = shipline(dir.path(), &["gates", "latest", "--pattern", "missing/*.json"]);
    assert_eq!(none.status.code(), Some(2));
    assert_eq!(stdout_json(&none)["found"], false);
}

#[test]
fn infinite_traffic_timeout_is_rejected() {
    let dir = tempfile::tempdir().unwrap();
    let out = shipline(
        dir.path(),
        &["rollout", "--target-version", "1.0.0", "--traffic-apply-timeout-s", "inf"],
    );
    assert_eq!(out.status.code(), Some(2));
    assert!(String::from_utf8_lossy(&out.stderr).contains("--traffic-apply-timeout-s"));
}
