//! shipline-channels — persisted release channel state.
//!
//! Holds the `canary` and `stable` channels of one product together with a
//! ring-buffered history of every change, in a single JSON document:
//!
//! ```text
//! {version, updated_at, channels: {canary: {...}, stable: {...}}, history: [...]}
//! ```
//!
//! Loading is lenient (missing or damaged fields fall back to defaults) and
//! saving is atomic (temp file + rename). There is no locking: concurrent
//! writers must be serialized by the caller.

pub mod error;
pub mod store;
pub mod types;

pub use error::{ChannelError, ChannelResult};
pub use store::{ChannelChange, ChannelStore};
pub use types::*;
