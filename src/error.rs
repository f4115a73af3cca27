//! This module defines the error type and Result alias.

use thiserror::Error;

/// Every fallible operation in this crate returns one of these variants.
///
/// Construction-time and request-time failures map directly onto the HTTP
/// status codes the control API returns (see `http.rs`); internal-only
/// variants never reach a caller across that boundary.
#[derive(Debug, Error)]
pub enum SchedulerError {
    /// Malformed task or trigger configuration, rejected at construction time.
    #[error("validation error: {0}")]
    Validation(String),

    /// Referenced task or job does not exist.
    #[error("not found: {0}")]
    NotFound(String),

    /// Conflicting state transition (start-on-running, stop-on-idle).
    #[error("conflict: {0}")]
    Conflict(String),

    /// A trigger will never fire again; the caller should drop it from the
    /// live set but must not delete it from the Store.
    #[error("trigger exhausted")]
    TriggerExhausted,

    /// The underlying store or a collaborator failed unexpectedly.
    #[error("internal error: {0}")]
    Internal(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Sqlite(#[from] rusqlite::Error),

    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),

    #[error(transparent)]
    Timestamp(#[from] jiff::Error),
}

pub type Result<T> = std::result::Result<T, SchedulerError>;

impl SchedulerError {
    pub fn validation(msg: impl Into<String>) -> Self {
        Self::Validation(msg.into())
    }

    pub fn not_found(msg: impl Into<String>) -> Self {
        Self::NotFound(msg.into())
    }

    pub fn conflict(msg: impl Into<String>) -> Self {
        Self::Conflict(msg.into())
    }

    pub fn internal(msg: impl Into<String>) -> Self {
        Self::Internal(msg.into())
    }
}
