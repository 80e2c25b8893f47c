//! Domain types for the channel store.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::ChannelError;

/// Number of history rows kept; older rows are dropped first.
pub const MAX_HISTORY: usize = 300;

/// Default rollout percentage of a freshly created canary channel.
pub const DEFAULT_CANARY_ROLLOUT: i64 = 5;

/// Rollout percentage of the stable channel.
pub const FULL_ROLLOUT: i64 = 100;

// ── Channels ───────────────────────────────────────────────────────

/// Name of a release channel.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChannelName {
    Canary,
    Stable,
}

impl ChannelName {
    pub fn as_str(&self) -> &'static str {
        match self {
            ChannelName::Canary => "canary",
            ChannelName::Stable => "stable",
        }
    }
}

impl fmt::Display for ChannelName {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ChannelName {
    type Err = ChannelError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "canary" => Ok(ChannelName::Canary),
            "stable" => Ok(ChannelName::Stable),
            other => Err(ChannelError::UnknownChannel(other.to_string())),
        }
    }
}

/// State of one release channel.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channel {
    /// Semantic version served by the channel, empty when unset.
    pub version: String,
    /// Share of traffic served, 0-100. Out-of-range values are kept as
    /// loaded so validation can report them.
    pub rollout_percent: i64,
    /// Epoch seconds of the last change.
    pub updated_at: f64,
}

impl Channel {
    pub fn empty(rollout_percent: i64) -> Self {
        Self {
            version: String::new(),
            rollout_percent,
            updated_at: 0.0,
        }
    }
}

/// The canary/stable pair.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Channels {
    pub canary: Channel,
    pub stable: Channel,
}

impl Default for Channels {
    fn default() -> Self {
        Self {
            canary: Channel::empty(DEFAULT_CANARY_ROLLOUT),
            stable: Channel::empty(FULL_ROLLOUT),
        }
    }
}

impl Channels {
    pub fn get(&self, name: ChannelName) -> &Channel {
        match name {
            ChannelName::Canary => &self.canary,
            ChannelName::Stable => &self.stable,
        }
    }

    pub fn get_mut(&mut self, name: ChannelName) -> &mut Channel {
        match name {
            ChannelName::Canary => &mut self.canary,
            ChannelName::Stable => &mut self.stable,
        }
    }
}

// ── History ────────────────────────────────────────────────────────

/// Kind of change recorded in the history.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HistoryAction {
    /// A channel was pointed at a new version.
    Set,
    /// A channel's rollout percentage changed.
    Rollout,
    /// A version moved from one channel to another.
    Promote,
    /// A channel was pointed back at an earlier version.
    Rollback,
}

impl HistoryAction {
    pub fn as_str(&self) -> &'static str {
        match self {
            HistoryAction::Set => "set",
            HistoryAction::Rollout => "rollout",
            HistoryAction::Promote => "promote",
            HistoryAction::Rollback => "rollback",
        }
    }
}

/// One row of the channel history.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    pub ts: f64,
    pub action: HistoryAction,
    /// `canary`, `stable`, or `source->target` for promotions.
    pub channel: String,
    #[serde(default)]
    pub from_version: String,
    #[serde(default)]
    pub to_version: String,
    #[serde(default)]
    pub reason: String,
    #[serde(default)]
    pub actor: String,
    #[serde(default)]
    pub correlation_id: String,
    #[serde(default)]
    pub release_candidate_id: String,
    /// Fields written by other tools, kept as found.
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

/// A stored history row. Rows that do not read as a [`HistoryEntry`]
/// (an unknown action, a mistyped timestamp) are carried through verbatim.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum HistoryRow {
    Entry(HistoryEntry),
    Raw(Map<String, Value>),
}

impl HistoryRow {
    pub fn entry(&self) -> Option<&HistoryEntry> {
        match self {
            HistoryRow::Entry(entry) => Some(entry),
            HistoryRow::Raw(_) => None,
        }
    }
}

impl From<HistoryEntry> for HistoryRow {
    fn from(entry: HistoryEntry) -> Self {
        HistoryRow::Entry(entry)
    }
}

/// Who made a change, why, and which rollout attempt it belongs to.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct Provenance {
    pub reason: String,
    pub actor: String,
    pub correlation_id: String,
    pub release_candidate_id: String,
}

impl Provenance {
    pub fn new(reason: impl Into<String>, actor: impl Into<String>) -> Self {
        Self {
            reason: reason.into(),
            actor: actor.into(),
            ..Default::default()
        }
    }

    /// Attach rollout identifiers. A missing identifier is derived from the
    /// other one so that history rows always carry both or neither.
    pub fn with_ids(mut self, correlation_id: &str, release_candidate_id: &str) -> Self {
        let correlation_id = correlation_id.trim();
        let release_candidate_id = release_candidate_id.trim();
        self.correlation_id = if correlation_id.is_empty() {
            release_candidate_id.to_string()
        } else {
            correlation_id.to_string()
        };
        self.release_candidate_id = if release_candidate_id.is_empty() {
            correlation_id.to_string()
        } else {
            release_candidate_id.to_string()
        };
        self
    }
}
