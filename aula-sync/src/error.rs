//! Error types for the sync engine

use std::sync::Arc;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum SyncError {
    /// The server understood the request and refused it (validation,
    /// permission, business rule). Retrying the same input would fail
    /// identically, so these are never queued for retry.
    #[error("Rejected by server: {0}")]
    Rejected(String),

    /// Transport-level failure: timeout, connection refused, server down.
    /// The action stays queued and the sync pass is retried later.
    #[error("Server unreachable: {0}")]
    Unreachable(String),

    /// Local and authoritative histories no longer match for a tracked
    /// session and could not be reconciled without renumbering.
    #[error("Histories diverged: {0}")]
    Diverged(String),

    /// The scope is blocked (e.g. the activity is being played right now).
    #[error("Sync blocked for scope {0}")]
    Blocked(String),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Serialization error: {0}")]
    Serialization(String),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Invalid operation: {0}")]
    InvalidOperation(String),

    #[error("Internal error: {0}")]
    Internal(String),

    /// Result of an in-flight pass shared with a second concurrent caller.
    #[error("{0}")]
    Shared(Arc<SyncError>),
}

impl From<serde_json::Error> for SyncError {
    fn from(err: serde_json::Error) -> Self {
        SyncError::Serialization(err.to_string())
    }
}

impl SyncError {
    /// True for transport failures, seeing through [`SyncError::Shared`].
    pub fn is_unreachable(&self) -> bool {
        match self {
            SyncError::Unreachable(_) => true,
            SyncError::Shared(inner) => inner.is_unreachable(),
            _ => false,
        }
    }

    /// True for server-side refusals, seeing through [`SyncError::Shared`].
    pub fn is_rejected(&self) -> bool {
        match self {
            SyncError::Rejected(_) => true,
            SyncError::Shared(inner) => inner.is_rejected(),
            _ => false,
        }
    }
}

pub type SyncResult<T> = Result<T, SyncError>;
