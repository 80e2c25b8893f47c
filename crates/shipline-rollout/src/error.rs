//! Error types for rollout execution.

use shipline_audit::AuditError;
use shipline_channels::ChannelError;
use shipline_core::CoreError;
use thiserror::Error;

/// Result type alias for rollout operations.
pub type RolloutResult<T> = Result<T, RolloutError>;

/// Failures that abort a rollout run. Everything else is reported as a
/// check row in the run's report.
#[derive(Debug, Error)]
pub enum RolloutError {
    #[error("channel store: {0}")]
    Channels(#[from] ChannelError),

    #[error("audit chain: {0}")]
    Audit(#[from] AuditError),

    #[error(transparent)]
    Storage(#[from] CoreError),
}
