//! Error types for the channel store.

use shipline_core::CoreError;
use thiserror::Error;

/// Result type alias for channel store operations.
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Error)]
pub enum ChannelError {
    #[error(transparent)]
    Storage(#[from] CoreError),

    #[error("invalid version {0:?}, expected semantic version x.y.z")]
    InvalidVersion(String),

    #[error("unknown channel {0:?}, expected canary or stable")]
    UnknownChannel(String),

    #[error("source and target channel must differ (both {0})")]
    SameChannel(String),
}
