//! Wall-clock helpers. Timestamps are epoch seconds as `f64`.

use std::time::{SystemTime, UNIX_EPOCH};

/// Current epoch time in seconds.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// Round to millisecond precision, the resolution every persisted timestamp uses.
pub fn round3(value: f64) -> f64 {
    (value * 1000.0).round() / 1000.0
}
