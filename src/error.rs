use thiserror::Error;

use crate::key::ValidationIssue;

/// Unified result type for the idempotency layer.
pub type Result<T> = std::result::Result<T, IdempotencyError>;

/// Errors emitted by the idempotency layer itself.
///
/// Errors raised by a wrapped operation never pass through this type; they
/// are returned to the caller unchanged by the executor.
#[derive(Debug, Error)]
pub enum IdempotencyError {
    /// The backing store could not be reached or rejected a query.
    #[error("{backend} store failed: {reason}")]
    Storage {
        backend: &'static str,
        reason: String,
    },

    /// A cached response could not be encoded or decoded.
    #[error("cached response serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    /// A client-supplied idempotency key was rejected.
    #[error("invalid idempotency key: {0}")]
    InvalidKey(ValidationIssue),

    /// Configuration could not be loaded or failed validation.
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Catch-all for lower-level errors.
    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl IdempotencyError {
    pub(crate) fn storage(backend: &'static str, reason: impl ToString) -> Self {
        Self::Storage {
            backend,
            reason: reason.to_string(),
        }
    }

    /// Returns true for infrastructure failures of the backing store.
    pub fn is_storage(&self) -> bool {
        matches!(self, Self::Storage { .. })
    }
}

impl From<rusqlite::Error> for IdempotencyError {
    fn from(err: rusqlite::Error) -> Self {
        Self::storage("sqlite", err)
    }
}

impl From<ValidationIssue> for IdempotencyError {
    fn from(issue: ValidationIssue) -> Self {
        Self::InvalidKey(issue)
    }
}
