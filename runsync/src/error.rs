//! Error taxonomy for the sync engine.
//!
//! [`StoreError`] classifies failures reported by a [`RemoteStore`](crate::io::store::RemoteStore);
//! [`SyncError`] is what engine components surface to the coordinator.

use std::io;

use thiserror::Error;

/// Failure reported by the remote store.
#[derive(Debug, Clone, Error, PartialEq, Eq)]
pub enum StoreError {
    /// Network trouble, timeouts, server errors. Safe to retry.
    #[error("transient store failure: {0}")]
    Transient(String),
    /// The store refused the request; retrying will not help.
    #[error("store rejected request ({status}): {message}")]
    Rejected { status: u16, message: String },
    /// The request collides with existing remote state (e.g. a run name already taken).
    #[error("store conflict: {0}")]
    Conflict(String),
}

impl StoreError {
    /// Status codes the remote treats as final: bad request, forbidden, not found, conflict.
    pub const NON_RETRYABLE_STATUS: [u16; 4] = [400, 403, 404, 409];

    pub fn is_retryable(&self) -> bool {
        match self {
            StoreError::Transient(_) => true,
            StoreError::Rejected { status, .. } => !Self::NON_RETRYABLE_STATUS.contains(status),
            StoreError::Conflict(_) => false,
        }
    }
}

/// Error surfaced by engine components.
#[derive(Debug, Error)]
pub enum SyncError {
    /// Initialization could not complete; the run must not start.
    #[error("launch failed: {0}")]
    Launch(String),
    #[error("cannot start run {run_id}: {reason}")]
    ResumeConflict { run_id: String, reason: String },
    /// A remote operation kept failing after its retry budget was spent.
    #[error("{context}: {source}")]
    Transient {
        context: String,
        #[source]
        source: StoreError,
    },
    #[error("failed to verify {name}: local digest {local}, remote {remote}")]
    VerificationMismatch {
        name: String,
        local: String,
        remote: String,
    },
    #[error("wire protocol violation: {0}")]
    Protocol(String),
    #[error("{context}: {source}")]
    Io {
        context: String,
        #[source]
        source: io::Error,
    },
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl SyncError {
    pub fn io(context: impl Into<String>, source: io::Error) -> Self {
        SyncError::Io {
            context: context.into(),
            source,
        }
    }

    pub fn store(context: impl Into<String>, source: StoreError) -> Self {
        SyncError::Transient {
            context: context.into(),
            source,
        }
    }

    /// Fatal errors abort the run before the user process starts.
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            SyncError::Launch(_) | SyncError::ResumeConflict { .. }
        )
    }
}
