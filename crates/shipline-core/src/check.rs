//! Check rows — the single reporting currency of the control plane.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Whether a failing check fails the run or is only reported.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// A failure makes the overall result not ok.
    Enforce,
    /// A failure is reported but does not affect the overall result.
    Warn,
}

impl Severity {
    /// `Enforce` when `cond` holds, otherwise `Warn`.
    pub fn enforce_if(cond: bool) -> Self {
        if cond { Severity::Enforce } else { Severity::Warn }
    }

    pub fn label(&self) -> &'static str {
        match self {
            Severity::Enforce => "enforce",
            Severity::Warn => "warn",
        }
    }
}

/// One evaluated condition: `{id, ok, value, expect, mode}` on the wire.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Check {
    pub id: String,
    pub ok: bool,
    /// Observed value backing the verdict.
    pub value: Value,
    /// Human-readable statement of what was expected.
    pub expect: String,
    #[serde(rename = "mode")]
    pub severity: Severity,
}

impl Check {
    pub fn new(
        id: impl Into<String>,
        ok: bool,
        value: impl Into<Value>,
        expect: impl Into<String>,
        severity: Severity,
    ) -> Self {
        Self {
            id: id.into(),
            ok,
            value: value.into(),
            expect: expect.into(),
            severity,
        }
    }

    pub fn enforce(
        id: impl Into<String>,
        ok: bool,
        value: impl Into<Value>,
        expect: impl Into<String>,
    ) -> Self {
        Self::new(id, ok, value, expect, Severity::Enforce)
    }

    pub fn warn(
        id: impl Into<String>,
        ok: bool,
        value: impl Into<Value>,
        expect: impl Into<String>,
    ) -> Self {
        Self::new(id, ok, value, expect, Severity::Warn)
    }

    /// True when this row fails and is enforced.
    pub fn is_blocking(&self) -> bool {
        !self.ok && self.severity == Severity::Enforce
    }
}

/// AND of every enforced row. Warn rows never affect the result.
pub fn enforced_ok(checks: &[Check]) -> bool {
    !checks.iter().any(Check::is_blocking)
}

/// Ids of all failing rows, regardless of severity.
pub fn failing_ids(checks: &[Check]) -> Vec<String> {
    checks
        .iter()
        .filter(|c| !c.ok)
        .map(|c| c.id.clone())
        .collect()
}
