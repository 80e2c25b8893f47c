//! Forgiving readers for loosely-typed JSON documents.
//!
//! Channel stores, policies and gate reports are produced by other tools
//! and edited by hand. These helpers accept the obvious spellings of a
//! value and return `None` for anything else so callers can default.

use serde_json::Value;

const TRUTHY: [&str; 4] = ["1", "true", "yes", "on"];

/// Integers, floats (truncated), and integer strings. A string holding a
/// fraction such as `"7.5"` is rejected.
pub fn int(value: Option<&Value>) -> Option<i64> {
    match value? {
        Value::Number(n) => n.as_i64().or_else(|| n.as_f64().map(|f| f as i64)),
        Value::String(s) => s.trim().parse().ok(),
        _ => None,
    }
}

/// Numbers and numeric strings.
pub fn float(value: Option<&Value>) -> Option<f64> {
    match value? {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse().ok().filter(|f: &f64| f.is_finite()),
        _ => None,
    }
}

/// Booleans or one of `1|true|yes|on` (case-insensitive). Absent or blank
/// values yield `default`.
pub fn flag(value: Option<&Value>, default: bool) -> bool {
    match value {
        None | Some(Value::Null) => default,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => {
            let s = s.trim().to_ascii_lowercase();
            if s.is_empty() {
                default
            } else {
                TRUTHY.contains(&s.as_str())
            }
        }
        Some(_) => default,
    }
}

/// Truthiness in the dynamic-language sense: `false`, `null`, zero, and
/// empty strings/arrays/objects are false; everything else is true.
pub fn truthy(value: Option<&Value>) -> bool {
    match value {
        None | Some(Value::Null) => false,
        Some(Value::Bool(b)) => *b,
        Some(Value::Number(n)) => n.as_f64().is_some_and(|f| f != 0.0),
        Some(Value::String(s)) => !s.is_empty(),
        Some(Value::Array(a)) => !a.is_empty(),
        Some(Value::Object(o)) => !o.is_empty(),
    }
}
