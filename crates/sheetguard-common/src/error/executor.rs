//! Errors reported by the action executor.

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Error returned by an action executor call.
///
/// The first three variants are transient: the document store is expected to
/// recover and the call may be retried. Everything else is surfaced to the
/// caller immediately.
#[derive(Debug, Clone, PartialEq, Eq, Error, Serialize, Deserialize)]
pub enum ExecutorError {
    /// The document store throttled the call.
    #[error("rate limited: {0}")]
    RateLimited(String),

    /// The document store is temporarily unavailable.
    #[error("service unavailable: {0}")]
    Unavailable(String),

    /// The call did not finish before its deadline.
    #[error("deadline exceeded: {0}")]
    DeadlineExceeded(String),

    /// The document does not exist.
    #[error("document '{0}' not found")]
    DocumentNotFound(String),

    /// The snapshot handle does not exist.
    #[error("snapshot handle '{0}' not found")]
    HandleNotFound(String),

    /// The caller lacks permission.
    #[error("permission denied: {0}")]
    PermissionDenied(String),

    /// The request was rejected by the document store.
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// The executor does not implement the action.
    #[error("unsupported action '{0}'")]
    UnsupportedAction(String),

    /// Any other failure.
    #[error("executor failure: {0}")]
    Failed(String),
}

impl ExecutorError {
    /// Returns true if the error is transient and the call may be retried.
    #[must_use]
    pub const fn is_transient(&self) -> bool {
        matches!(
            self,
            Self::RateLimited(_) | Self::Unavailable(_) | Self::DeadlineExceeded(_)
        )
    }
}

/// Result type for executor calls.
pub type ExecResult<T> = Result<T, ExecutorError>;
