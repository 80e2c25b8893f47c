pub mod audit;
pub mod channels;
pub mod gates;
pub mod rollout;

use serde::Serialize;

/// Exit code of a failed run.
pub const EXIT_FAILED: u8 = 2;

/// Print `value` to stdout as pretty JSON.
pub fn print_json<T: Serialize>(value: &T) -> anyhow::Result<()> {
    println!("{}", serde_json::to_string_pretty(value)?);
    Ok(())
}

pub fn exit_code(ok: bool) -> u8 {
    if ok { 0 } else { EXIT_FAILED }
}
