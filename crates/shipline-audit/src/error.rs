//! Error types for the audit chain.

use std::path::PathBuf;

use shipline_core::CoreError;
use thiserror::Error;

/// Result type alias for audit chain operations.
pub type AuditResult<T> = Result<T, AuditError>;

#[derive(Debug, Error)]
pub enum AuditError {
    /// The existing chain failed verification; nothing was written.
    #[error("audit_chain_invalid:{}", failing.join(","))]
    ChainInvalid { failing: Vec<String> },

    /// The chain failed verification right after an append.
    #[error("audit_chain_post_write_invalid:{}", failing.join(","))]
    PostWriteInvalid { failing: Vec<String> },

    #[error("I/O error on {path}: {source}")]
    Io {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Storage(#[from] CoreError),
}
