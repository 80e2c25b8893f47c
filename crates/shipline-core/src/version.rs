//! Version string validation.

use std::sync::LazyLock;

use regex::Regex;

static SEMVER_RE: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"^\d+\.\d+\.\d+(?:[-+][0-9A-Za-z.-]+)?$").expect("valid semver pattern")
});

/// `x.y.z` with an optional `-pre` or `+build` suffix. Surrounding
/// whitespace is ignored.
pub fn is_semver(text: &str) -> bool {
    SEMVER_RE.is_match(text.trim())
}
