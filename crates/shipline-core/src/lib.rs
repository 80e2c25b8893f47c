//! shipline-core — shared building blocks for the release control plane.
//!
//! Every shipline crate reports its findings as [`Check`] rows, hashes
//! ledger entries through [`canonical_json`], and persists state through
//! the atomic helpers in [`files`].

pub mod canonical;
pub mod check;
pub mod clock;
pub mod error;
pub mod files;
pub mod lenient;
pub mod version;

pub use canonical::canonical_json;
pub use check::{Check, Severity, enforced_ok, failing_ids};
pub use clock::{now_ts, round3};
pub use error::{CoreError, CoreResult};
pub use files::{JsonLoad, load_json, write_json_atomic};
pub use version::is_semver;
