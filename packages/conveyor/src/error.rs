//! Structured error types for the engine's public API.
//!
//! `EngineError` covers the submission and operator paths, where failures
//! surface synchronously to the caller. Handler failures never appear here:
//! they are contained by the executor and recorded as job outcomes. Inside
//! handlers, `anyhow` is the transport; it does not cross the public API.

use thiserror::Error;
use uuid::Uuid;

use crate::job::JobStatus;

pub type Result<T> = std::result::Result<T, EngineError>;

#[derive(Debug, Error)]
pub enum EngineError {
    /// Malformed submission. Never reaches either queue tier.
    #[error("validation failed: {0}")]
    Validation(String),

    /// Unknown job id on fetch/cancel/retry.
    #[error("job {0} not found")]
    NotFound(Uuid),

    /// Operation not permitted in the job's current status, e.g. cancelling
    /// a running job or retrying a succeeded one.
    #[error("cannot {op} job {id} in status {status}")]
    StateConflict {
        id: Uuid,
        status: JobStatus,
        op: &'static str,
    },

    /// Durable store unavailable or query failure. Workers back off and
    /// retry; submitters see the error synchronously.
    #[error("durable store error: {0}")]
    Store(#[from] sqlx::Error),

    /// Migration failure at startup.
    #[error("migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    /// Fast queue unavailable. Contained on the worker path (the coordinator
    /// falls through to a durable scan) and logged at warn.
    #[error("fast queue error: {0}")]
    FastQueue(String),
}

impl EngineError {
    /// Transient errors are retried with backoff by the worker loop;
    /// everything else is a caller mistake surfaced as-is.
    pub fn is_transient(&self) -> bool {
        matches!(self, EngineError::Store(_) | EngineError::FastQueue(_))
    }
}

impl From<redis::RedisError> for EngineError {
    fn from(err: redis::RedisError) -> Self {
        EngineError::FastQueue(err.to_string())
    }
}
