//! Rollout policy — stage ladders and the gate reports that guard them.
//!
//! Policies are hand-edited, so every field is read leniently and then
//! normalized. A policy file may be JSON, or TOML when its extension is
//! `.toml`.

use std::fs;
use std::io::ErrorKind;
use std::path::Path;

use serde::Serialize;
use serde_json::{Map, Value};
use tracing::{debug, warn};

use shipline_core::lenient;

/// Canary ladder used when the policy names none.
pub const DEFAULT_CANARY_STAGES: [i64; 3] = [5, 20, 50];
/// Stable ladder used when the policy names none or one not ending in 100.
pub const DEFAULT_STABLE_STAGES: [i64; 1] = [100];
/// Minimum dwell time on a canary stage, in seconds.
pub const DEFAULT_MIN_STAGE_OBSERVE_S: f64 = 1800.0;
/// Maximum age of a gate report, in seconds.
pub const DEFAULT_GATE_MAX_AGE_S: f64 = 7.0 * 24.0 * 3600.0;

/// Stage ladders.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct StagePolicy {
    /// Ascending, distinct percentages in 0..=100.
    pub canary: Vec<i64>,
    /// Ascending, ends in 100.
    pub stable: Vec<i64>,
    pub min_stage_observe_s: f64,
}

impl Default for StagePolicy {
    fn default() -> Self {
        Self {
            canary: DEFAULT_CANARY_STAGES.to_vec(),
            stable: DEFAULT_STABLE_STAGES.to_vec(),
            min_stage_observe_s: DEFAULT_MIN_STAGE_OBSERVE_S,
        }
    }
}

/// One required gate report.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct GatePolicy {
    pub id: String,
    /// Glob matched against report files; the newest match is used.
    pub pattern: String,
    pub max_age_s: f64,
    /// A failing required gate blocks apply.
    pub required: bool,
    /// The report's own `ok` field must be truthy.
    pub require_ok: bool,
}

/// Normalized rollout policy.
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct RolloutPolicy {
    pub stages: StagePolicy,
    pub gates: Vec<GatePolicy>,
}

/// How the policy document was obtained.
#[derive(Debug, Clone, PartialEq)]
pub enum PolicySource {
    /// No file; defaults apply.
    Missing,
    /// Parsed from the file.
    Loaded,
    /// Present but unusable; defaults apply.
    Malformed(String),
}

impl PolicySource {
    /// False only for a present-but-unusable file.
    pub fn is_usable(&self) -> bool {
        !matches!(self, PolicySource::Malformed(_))
    }
}

impl RolloutPolicy {
    /// Load and normalize the policy at `path`. Never fails: problems are
    /// reported through the returned [`PolicySource`].
    pub fn load(path: &Path) -> (Self, PolicySource) {
        let text = match fs::read_to_string(path) {
            Ok(text) => text,
            Err(e) if e.kind() == ErrorKind::NotFound => {
                debug!(path = %path.display(), "rollout policy absent, using defaults");
                return (Self::default(), PolicySource::Missing);
            }
            Err(e) => return malformed(path, e.to_string()),
        };
        let is_toml = path
            .extension()
            .is_some_and(|ext| ext.eq_ignore_ascii_case("toml"));
        let parsed: Result<Value, String> = if is_toml {
            toml::from_str(&text).map_err(|e| e.to_string())
        } else {
            serde_json::from_str(&text).map_err(|e| e.to_string())
        };
        match parsed {
            Ok(Value::Object(obj)) => (Self::from_object(&obj), PolicySource::Loaded),
            Ok(_) => malformed(path, "policy root is not an object".into()),
            Err(err) => malformed(path, err),
        }
    }

    /// Normalize a policy document.
    pub fn from_object(obj: &Map<String, Value>) -> Self {
        let empty = Map::new();
        let stages = obj.get("stages").and_then(Value::as_object).unwrap_or(&empty);
        let mut stable = normalize_stages(stages.get("stable"), &DEFAULT_STABLE_STAGES);
        if stable.last() != Some(&100) {
            stable = DEFAULT_STABLE_STAGES.to_vec();
        }
        let stages = StagePolicy {
            canary: normalize_stages(stages.get("canary"), &DEFAULT_CANARY_STAGES),
            stable,
            min_stage_observe_s: lenient::float(stages.get("min_stage_observe_s"))
                .unwrap_or(DEFAULT_MIN_STAGE_OBSERVE_S)
                .max(0.0),
        };

        let gates = obj
            .get("gates")
            .and_then(Value::as_object)
            .and_then(|g| g.get("required_reports"))
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(Value::as_object).map(gate_from).collect())
            .unwrap_or_default();

        Self { stages, gates }
    }
}

fn malformed(path: &Path, err: String) -> (RolloutPolicy, PolicySource) {
    warn!(path = %path.display(), %err, "rollout policy unusable, using defaults");
    (RolloutPolicy::default(), PolicySource::Malformed(err))
}

fn gate_from(row: &Map<String, Value>) -> GatePolicy {
    let id = match row.get("id") {
        Some(Value::String(s)) if !s.is_empty() => s.clone(),
        Some(Value::Number(n)) => n.to_string(),
        _ => "gate".to_string(),
    };
    GatePolicy {
        id,
        pattern: row
            .get("pattern")
            .and_then(Value::as_str)
            .unwrap_or_default()
            .trim()
            .to_string(),
        max_age_s: lenient::float(row.get("max_age_s"))
            .unwrap_or(DEFAULT_GATE_MAX_AGE_S)
            .max(1.0),
        required: lenient::flag(row.get("required"), true),
        require_ok: lenient::flag(row.get("require_ok"), true),
    }
}

/// Parse, drop negatives, clamp to 0..=100, dedupe and sort. An empty
/// result falls back to `fallback`.
fn normalize_stages(raw: Option<&Value>, fallback: &[i64]) -> Vec<i64> {
    let mut out: Vec<i64> = raw
        .and_then(Value::as_array)
        .map(|items| {
            items
                .iter()
                .filter_map(|item| lenient::int(Some(item)))
                .filter(|v| *v >= 0)
                .map(|v| v.min(100))
                .collect()
        })
        .unwrap_or_default();
    if out.is_empty() {
        out = fallback.to_vec();
    }
    out.sort_unstable();
    out.dedup();
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn policy(value: Value) -> RolloutPolicy {
        RolloutPolicy::from_object(value.as_object().unwrap())
    }

    #[test]
    fn empty_document_uses_defaults() {
        let p = policy(json!({}));
        assert_eq!(p.stages.canary, vec![5, 20, 50]);
        assert_eq!(p.stages.stable, vec![100]);
        assert_eq!(p.stages.min_stage_observe_s, 1800.0);
        assert!(p.gates.is_empty());
    }

    #[test]
    fn stages_are_normalized() {
        let p = policy(json!({
            "stages": {
                "canary": [50, "10", -3, 250, 10, "x"],
                "stable": [50],
                "min_stage_observe_s": -5,
            }
        }));
        assert_eq!(p.stages.canary, vec![10, 50, 100]);
        assert_eq!(p.stages.stable, vec![100]);
        assert_eq!(p.stages.min_stage_observe_s, 0.0);
    }

    #[test]
    fn gate_defaults_and_flags() {
        let p = policy(json!({
            "gates": {"required_reports": [
                {"pattern": " .data/out/preflight_*.json "},
                {"id": "load", "pattern": "x", "max_age_s": 0, "required": "no", "require_ok": "YES"},
                "not-an-object",
            ]}
        }));
        assert_eq!(p.gates.len(), 2);
        assert_eq!(p.gates[0].id, "gate");
        assert_eq!(p.gates[0].pattern, ".data/out/preflight_*.json");
        assert_eq!(p.gates[0].max_age_s, DEFAULT_GATE_MAX_AGE_S);
        assert!(p.gates[0].required && p.gates[0].require_ok);
        assert_eq!(p.gates[1].max_age_s, 1.0);
        assert!(!p.gates[1].required);
        assert!(p.gates[1].require_ok);
    }

    #[test]
    fn loads_toml_by_extension() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("policy.toml");
        fs::write(
            &path,
            r#"
[stages]
canary = [10, 30]
min_stage_observe_s = 60

[[gates.required_reports]]
id = "preflight"
pattern = "reports/*.json"
"#,
        )
        .unwrap();
        let (p, source) = RolloutPolicy::load(&path);
        assert_eq!(source, PolicySource::Loaded);
        assert_eq!(p.stages.canary, vec![10, 30]);
        assert_eq!(p.stages.min_stage_observe_s, 60.0);
        assert_eq!(p.gates[0].id, "preflight");
    }

    #[test]
    fn missing_and_malformed_files() {
        let dir = tempfile::tempdir().unwrap();
        let (p, source) = RolloutPolicy::load(&dir.path().join("absent.json"));
        assert_eq!(source, PolicySource::Missing);
        assert!(source.is_usable());
        assert_eq!(p, RolloutPolicy::default());

        let bad = dir.path().join("bad.json");
        fs::write(&bad, "[1, 2]").unwrap();
        let (_, source) = RolloutPolicy::load(&bad);
        assert!(!source.is_usable());
    }
}
