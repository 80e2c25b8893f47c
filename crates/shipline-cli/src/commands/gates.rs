use serde_json::{Value, json};

use shipline_core::files::posix;
use shipline_rollout::gates::report_timestamp;
use shipline_rollout::{latest_report, load_report};

use super::{exit_code, print_json};

/// Print the newest report matching `pattern`. Exits 2 when none matches.
pub fn latest(pattern: &str) -> anyhow::Result<u8> {
    let found = latest_report(pattern);
    let report = found.as_deref().and_then(load_report);
    let out = json!({
        "pattern": pattern,
        "found": found.is_some(),
        "report_path": found.as_deref().map(posix).unwrap_or_default(),
        "report_ts": report.as_ref().map(report_timestamp).unwrap_or(0.0),
        "report": report.map(Value::Object).unwrap_or(Value::Null),
    });
    print_json(&out)?;
    Ok(exit_code(found.is_some()))
}
