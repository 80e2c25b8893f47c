//! ChannelStore — JSON-file persistence for release channels.
//!
//! The store is loaded leniently: a missing file, malformed JSON, or a
//! field of the wrong type falls back to the defaults instead of failing,
//! so a damaged document never blocks a rollback. Saving always rewrites
//! the whole document atomically.

use std::path::Path;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use tracing::{debug, info, warn};

use shipline_core::files::{JsonLoad, load_json, write_json_atomic};
use shipline_core::{Check, Severity, is_semver, lenient};

use crate::error::{ChannelError, ChannelResult};
use crate::types::*;

/// Schema version written into new documents.
const STORE_SCHEMA_VERSION: u64 = 1;

/// The full channel document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ChannelStore {
    /// Document schema version.
    pub version: u64,
    /// Epoch seconds of the last history append.
    pub updated_at: f64,
    pub channels: Channels,
    /// Most recent last, capped at [`MAX_HISTORY`].
    pub history: Vec<HistoryRow>,
}

impl Default for ChannelStore {
    fn default() -> Self {
        Self {
            version: STORE_SCHEMA_VERSION,
            updated_at: 0.0,
            channels: Channels::default(),
            history: Vec::new(),
        }
    }
}

/// Summary of a manual channel operation.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChannelChange {
    pub action: HistoryAction,
    pub channel: String,
    pub from_version: String,
    pub to_version: String,
}

impl ChannelStore {
    /// Load the store at `path`. Only I/O failures are errors.
    pub fn load(path: &Path) -> ChannelResult<Self> {
        match load_json(path)? {
            JsonLoad::Missing => {
                debug!(path = %path.display(), "channel store absent, using defaults");
                Ok(Self::default())
            }
            JsonLoad::Malformed(err) => {
                warn!(path = %path.display(), %err, "channel store malformed, using defaults");
                Ok(Self::default())
            }
            JsonLoad::Loaded(value) => Ok(Self::from_value(&value)),
        }
    }

    /// Build a store from an arbitrary JSON value, defaulting anything
    /// missing or malformed.
    pub fn from_value(value: &Value) -> Self {
        let Some(obj) = value.as_object() else {
            warn!("channel store root is not an object, using defaults");
            return Self::default();
        };
        let channels = obj.get("channels").and_then(Value::as_object);
        let history: Vec<HistoryRow> = obj
            .get("history")
            .and_then(Value::as_array)
            .map(|rows| rows.iter().filter_map(history_row).collect())
            .unwrap_or_default();

        let version = lenient::int(obj.get("version"))
            .filter(|v| *v > 0)
            .map(|v| v as u64)
            .unwrap_or(STORE_SCHEMA_VERSION);

        Self {
            version,
            updated_at: lenient::float(obj.get("updated_at")).unwrap_or(0.0),
            channels: Channels {
                canary: channel_from(channels, "canary", DEFAULT_CANARY_ROLLOUT),
                stable: channel_from(channels, "stable", FULL_ROLLOUT),
            },
            history,
        }
    }

    /// Atomically persist the store to `path`.
    pub fn save(&self, path: &Path) -> ChannelResult<()> {
        write_json_atomic(path, self)?;
        debug!(
            path = %path.display(),
            history = self.history.len(),
            "channel store saved"
        );
        Ok(())
    }

    /// History rows this crate can read, oldest first.
    pub fn entries(&self) -> impl DoubleEndedIterator<Item = &HistoryEntry> {
        self.history.iter().filter_map(HistoryRow::entry)
    }

    /// Append a history row, trimming to [`MAX_HISTORY`], and stamp the
    /// document with the row's timestamp.
    pub fn record_history(
        &mut self,
        ts: f64,
        action: HistoryAction,
        channel: &str,
        from_version: &str,
        to_version: &str,
        provenance: &Provenance,
    ) {
        self.history.push(HistoryRow::Entry(HistoryEntry {
            ts,
            action,
            channel: channel.to_string(),
            from_version: from_version.to_string(),
            to_version: to_version.to_string(),
            reason: provenance.reason.clone(),
            actor: provenance.actor.clone(),
            correlation_id: provenance.correlation_id.clone(),
            release_candidate_id: provenance.release_candidate_id.clone(),
            extra: Map::new(),
        }));
        if self.history.len() > MAX_HISTORY {
            let excess = self.history.len() - MAX_HISTORY;
            self.history.drain(..excess);
        }
        self.updated_at = ts;
    }

    // ── Manual operations ──────────────────────────────────────────

    /// Point `channel` at `version`. Stable is always forced to full
    /// rollout; a canary keeps its current percentage.
    pub fn set_channel(
        &mut self,
        channel: ChannelName,
        version: &str,
        provenance: &Provenance,
        now: f64,
    ) -> ChannelResult<ChannelChange> {
        let version = require_semver(version)?;
        let from_version = self.write_channel(channel, &version, now);
        self.record_history(
            now,
            HistoryAction::Set,
            channel.as_str(),
            &from_version,
            &version,
            provenance,
        );
        info!(%channel, from = %from_version, to = %version, "channel set");
        Ok(ChannelChange {
            action: HistoryAction::Set,
            channel: channel.to_string(),
            from_version,
            to_version: version,
        })
    }

    /// Copy a version from `source` to `target`. The version defaults to
    /// the one `source` currently serves.
    pub fn promote(
        &mut self,
        source: ChannelName,
        target: ChannelName,
        version: Option<&str>,
        provenance: &Provenance,
        now: f64,
    ) -> ChannelResult<ChannelChange> {
        if source == target {
            return Err(ChannelError::SameChannel(source.to_string()));
        }
        let version = version
            .map(str::trim)
            .filter(|v| !v.is_empty())
            .unwrap_or(self.channels.get(source).version.as_str())
            .to_string();
        let version = require_semver(&version)?;
        let from_version = self.write_channel(target, &version, now);
        let label = format!("{source}->{target}");
        self.record_history(
            now,
            HistoryAction::Promote,
            &label,
            &from_version,
            &version,
            provenance,
        );
        info!(%source, %target, from = %from_version, to = %version, "channel promoted");
        Ok(ChannelChange {
            action: HistoryAction::Promote,
            channel: label,
            from_version,
            to_version: version,
        })
    }

    /// Point `channel` back at `to_version`.
    pub fn rollback(
        &mut self,
        channel: ChannelName,
        to_version: &str,
        provenance: &Provenance,
        now: f64,
    ) -> ChannelResult<ChannelChange> {
        let version = require_semver(to_version)?;
        let from_version = self.write_channel(channel, &version, now);
        self.record_history(
            now,
            HistoryAction::Rollback,
            channel.as_str(),
            &from_version,
            &version,
            provenance,
        );
        warn!(%channel, from = %from_version, to = %version, "channel rolled back");
        Ok(ChannelChange {
            action: HistoryAction::Rollback,
            channel: channel.to_string(),
            from_version,
            to_version: version,
        })
    }

    /// Set the version of `name`, returning the previous one.
    fn write_channel(&mut self, name: ChannelName, version: &str, now: f64) -> String {
        let row = self.channels.get_mut(name);
        let previous = std::mem::replace(&mut row.version, version.to_string());
        if name == ChannelName::Stable {
            row.rollout_percent = FULL_ROLLOUT;
        }
        row.updated_at = now;
        previous
    }

    // ── Validation ─────────────────────────────────────────────────

    /// Validate channel contents. `strict` upgrades the stable-rollout and
    /// expected-version checks from warn to enforce.
    pub fn validate(&self, expected_version: Option<&str>, strict: bool) -> Vec<Check> {
        let canary = &self.channels.canary;
        let stable = &self.channels.stable;
        let mut checks = vec![
            Check::enforce(
                "canary_version_semver",
                canary.version.is_empty() || is_semver(&canary.version),
                canary.version.as_str(),
                "semantic version x.y.z when set",
            ),
            Check::enforce(
                "stable_version_semver",
                stable.version.is_empty() || is_semver(&stable.version),
                stable.version.as_str(),
                "semantic version x.y.z when set",
            ),
            Check::enforce(
                "canary_rollout_range",
                (0..=100).contains(&canary.rollout_percent),
                canary.rollout_percent,
                "0..100",
            ),
            Check::enforce(
                "stable_rollout_range",
                (0..=100).contains(&stable.rollout_percent),
                stable.rollout_percent,
                "0..100",
            ),
            Check::new(
                "stable_rollout_100",
                stable.rollout_percent == FULL_ROLLOUT,
                stable.rollout_percent,
                "stable rollout is 100%",
                Severity::enforce_if(strict),
            ),
        ];

        if let Some(expected) = expected_version.map(str::trim).filter(|v| !v.is_empty()) {
            checks.push(Check::new(
                "expected_version_present_in_channels",
                expected == canary.version || expected == stable.version,
                json!({
                    "expected": expected,
                    "canary": canary.version,
                    "stable": stable.version,
                }),
                "expected version exists in canary or stable",
                Severity::enforce_if(strict),
            ));
        }
        checks
    }
}

fn require_semver(version: &str) -> ChannelResult<String> {
    let version = version.trim();
    if !is_semver(version) {
        return Err(ChannelError::InvalidVersion(version.to_string()));
    }
    Ok(version.to_string())
}

/// Objects only; anything else in the history array is dropped.
fn history_row(row: &Value) -> Option<HistoryRow> {
    let obj = row.as_object()?;
    Some(match serde_json::from_value::<HistoryEntry>(row.clone()) {
        Ok(entry) => HistoryRow::Entry(entry),
        Err(err) => {
            debug!(%err, "history row kept verbatim");
            HistoryRow::Raw(obj.clone())
        }
    })
}

fn channel_from(channels: Option<&Map<String, Value>>, name: &str, default_rollout: i64) -> Channel {
    let Some(row) = channels.and_then(|c| c.get(name)).and_then(Value::as_object) else {
        return Channel::empty(default_rollout);
    };
    Channel {
        version: row
            .get("version")
            .and_then(Value::as_str)
            .map(str::trim)
            .unwrap_or_default()
            .to_string(),
        rollout_percent: lenient::int(row.get("rollout_percent")).unwrap_or(default_rollout),
        updated_at: lenient::float(row.get("updated_at")).unwrap_or(0.0),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::fs;

    fn prov() -> Provenance {
        Provenance::new("test", "tester")
    }

    #[test]
    fn missing_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let store = ChannelStore::load(&dir.path().join("channels.json")).unwrap();
        assert_eq!(store, ChannelStore::default());
    }

    #[test]
    fn malformed_file_loads_defaults() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        fs::write(&path, "[1, 2").unwrap();
        assert_eq!(ChannelStore::load(&path).unwrap(), ChannelStore::default());

        fs::write(&path, "[1, 2]").unwrap();
        assert_eq!(ChannelStore::load(&path).unwrap(), ChannelStore::default());
    }

    #[test]
    fn partial_document_fills_defaults() {
        let value = json!({
            "channels": {
                "canary": {"version": "1.2.0", "rollout_percent": "20"},
                "stable": "garbage"
            },
            "history": [
                {"ts": 5.0, "action": "set", "channel": "canary", "to_version": "1.2.0"},
                "not a row",
                {"ts": 6.0, "action": "explode", "channel": "canary"}
            ]
        });
        let store = ChannelStore::from_value(&value);
        assert_eq!(store.channels.canary.version, "1.2.0");
        assert_eq!(store.channels.canary.rollout_percent, 20);
        assert_eq!(store.channels.stable, Channel::empty(100));
        assert_eq!(store.history.len(), 1);
        assert_eq!(store.version, 1);
    }

    #[test]
    fn missing_rollout_defaults_per_channel() {
        let value = json!({"channels": {"canary": {"version": "1.0.0"}, "stable": {}}});
        let store = ChannelStore::from_value(&value);
        assert_eq!(store.channels.canary.rollout_percent, 5);
        assert_eq!(store.channels.stable.rollout_percent, 100);
    }

    #[test]
    fn save_then_load_is_stable() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("state/channels.json");
        let mut store = ChannelStore::default();
        store
            .set_channel(ChannelName::Canary, "1.0.0", &prov(), 1700000000.123)
            .unwrap();
        store.save(&path).unwrap();
        let first = fs::read(&path).unwrap();

        let loaded = ChannelStore::load(&path).unwrap();
        assert_eq!(loaded, store);
        loaded.save(&path).unwrap();
        assert_eq!(fs::read(&path).unwrap(), first);
    }

    #[test]
    fn foreign_history_rows_survive_save() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("channels.json");
        fs::write(
            &path,
            r#"{"version": 1, "channels": {}, "history": [
                {"ts": 1.0, "action": "set", "channel": "canary", "to_version": "1.0.0", "ticket": "OPS-3"},
                {"ts": 2.0, "action": "manual_fix", "channel": "stable", "note": "hotpatch"},
                {"ts": "3", "action": "set", "channel": "canary"},
                "not a row"
            ]}"#,
        )
        .unwrap();

        let mut store = ChannelStore::load(&path).unwrap();
        assert_eq!(store.history.len(), 3);
        assert_eq!(store.entries().count(), 1);
        store
            .set_channel(ChannelName::Canary, "1.1.0", &prov(), 4.0)
            .unwrap();
        store.save(&path).unwrap();

        let saved: Value = serde_json::from_str(&fs::read_to_string(&path).unwrap()).unwrap();
        let rows = saved["history"].as_array().unwrap();
        assert_eq!(rows.len(), 4);
        assert_eq!(rows[0]["ticket"], "OPS-3");
        assert_eq!(rows[1]["action"], "manual_fix");
        assert_eq!(rows[1]["note"], "hotpatch");
        assert_eq!(rows[2]["ts"], "3");
        assert_eq!(rows[3]["to_version"], "1.1.0");
        assert_eq!(ChannelStore::load(&path).unwrap(), store);
    }

    #[test]
    fn history_is_capped() {
        let mut store = ChannelStore::default();
        for i in 0..(MAX_HISTORY + 25) {
            store.record_history(
                i as f64,
                HistoryAction::Rollout,
                "canary",
                "1.0.0",
                "1.0.0",
                &prov(),
            );
        }
        assert_eq!(store.history.len(), MAX_HISTORY);
        assert_eq!(store.entries().next().unwrap().ts, 25.0);
        assert_eq!(store.updated_at, (MAX_HISTORY + 24) as f64);
    }

    #[test]
    fn set_stable_forces_full_rollout() {
        let mut store = ChannelStore::default();
        store.channels.stable.rollout_percent = 40;
        let change = store
            .set_channel(ChannelName::Stable, "2.0.0", &prov(), 10.0)
            .unwrap();
        assert_eq!(change.from_version, "");
        assert_eq!(store.channels.stable.rollout_percent, 100);
        assert_eq!(store.entries().last().unwrap().action, HistoryAction::Set);
    }

    #[test]
    fn set_canary_keeps_rollout() {
        let mut store = ChannelStore::default();
        store.channels.canary.rollout_percent = 20;
        store
            .set_channel(ChannelName::Canary, "2.0.0", &prov(), 10.0)
            .unwrap();
        assert_eq!(store.channels.canary.rollout_percent, 20);
    }

    #[test]
    fn set_rejects_bad_version() {
        let mut store = ChannelStore::default();
        let err = store
            .set_channel(ChannelName::Canary, "latest", &prov(), 1.0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::InvalidVersion(_)));
        assert!(store.history.is_empty());
    }

    #[test]
    fn promote_copies_source_version() {
        let mut store = ChannelStore::default();
        store.channels.canary.version = "3.1.0".into();
        store.channels.stable.version = "3.0.0".into();
        let change = store
            .promote(ChannelName::Canary, ChannelName::Stable, None, &prov(), 50.0)
            .unwrap();
        assert_eq!(change.channel, "canary->stable");
        assert_eq!(change.from_version, "3.0.0");
        assert_eq!(store.channels.stable.version, "3.1.0");
        assert_eq!(store.channels.stable.updated_at, 50.0);
    }

    #[test]
    fn promote_rejects_same_channel() {
        let mut store = ChannelStore::default();
        let err = store
            .promote(ChannelName::Stable, ChannelName::Stable, Some("1.0.0"), &prov(), 1.0)
            .unwrap_err();
        assert!(matches!(err, ChannelError::SameChannel(_)));
    }

    #[test]
    fn rollback_records_history() {
        let mut store = ChannelStore::default();
        store.channels.stable.version = "2.0.0".into();
        store
            .rollback(ChannelName::Stable, "1.9.0", &prov(), 99.0)
            .unwrap();
        let last = store.entries().last().unwrap();
        assert_eq!(last.action, HistoryAction::Rollback);
        assert_eq!(last.from_version, "2.0.0");
        assert_eq!(last.to_version, "1.9.0");
    }

    #[test]
    fn validate_flags_bad_state() {
        let mut store = ChannelStore::default();
        store.channels.canary.version = "banana".into();
        store.channels.canary.rollout_percent = 140;
        store.channels.stable.rollout_percent = 50;

        let lenient = store.validate(None, false);
        let failing: Vec<_> = lenient.iter().filter(|c| !c.ok).map(|c| c.id.as_str()).collect();
        assert_eq!(
            failing,
            vec!["canary_version_semver", "canary_rollout_range", "stable_rollout_100"]
        );
        let stable_row = lenient.iter().find(|c| c.id == "stable_rollout_100").unwrap();
        assert_eq!(stable_row.severity, Severity::Warn);

        let strict = store.validate(Some("9.9.9"), true);
        let expected = strict
            .iter()
            .find(|c| c.id == "expected_version_present_in_channels")
            .unwrap();
        assert!(!expected.ok);
        assert_eq!(expected.severity, Severity::Enforce);
    }

    #[test]
    fn validate_accepts_empty_versions() {
        let checks = ChannelStore::default().validate(None, true);
        assert!(shipline_core::enforced_ok(&checks));
    }
}
