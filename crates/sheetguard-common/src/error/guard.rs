//! Safety-layer error types.
//!
//! Every error the core surfaces to callers is a [`GuardError`]. Each variant
//! carries enough structured detail (mismatched fields, estimated vs. limit
//! counts, conflicting values) for automatic or user-driven resolution.

use std::fmt;
use thiserror::Error;

use super::executor::ExecutorError;
use crate::types::{ConflictId, DocumentId, FieldMismatch, OpId, SnapshotId, TxnId};

/// Error codes for categorizing errors.
///
/// These codes are stable and are what callers match on when they only
/// need the kind of failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u16)]
pub enum ErrorCode {
    // Fence and guard (0x01xx)
    /// The live document does not match the caller's expected state.
    PreconditionFailed = 0x0100,
    /// The estimated effect exceeds a limit.
    EffectScopeExceeded = 0x0101,
    /// The target must be an explicit range.
    ExplicitRangeRequired = 0x0102,
    /// A sheet name matched more than one sheet.
    AmbiguousRange = 0x0103,

    // Snapshots (0x02xx)
    /// Snapshot creation failed.
    SnapshotCreationFailed = 0x0200,
    /// Snapshot restore failed or was refused.
    SnapshotRestoreFailed = 0x0201,
    /// Unknown snapshot.
    SnapshotNotFound = 0x0202,

    // Transactions (0x03xx)
    /// Another transaction is active on the document.
    TransactionConflict = 0x0300,
    /// The transaction expired.
    TransactionExpired = 0x0301,
    /// Unknown transaction.
    TransactionNotFound = 0x0302,
    /// The transaction is not in a state that allows the operation.
    InvalidTransactionState = 0x0303,

    // History and replay (0x04xx)
    /// Replaying an inverse or a rollback failed.
    ReplayFailed = 0x0400,
    /// Nothing left to undo.
    NothingToUndo = 0x0401,
    /// Nothing left to redo.
    NothingToRedo = 0x0402,
    /// Unknown operation id.
    OperationNotFound = 0x0403,

    // Conflicts (0x05xx)
    /// Unknown conflict.
    ConflictNotFound = 0x0500,
    /// The strategy needs a caller-supplied merged value.
    MergeValueRequired = 0x0501,

    // General (0x00xx)
    /// The executor failed.
    ExecutorFailed = 0x0001,
    /// The operation was cancelled.
    Cancelled = 0x0002,
    /// The request is malformed.
    InvalidRequest = 0x0003,
    /// Persisting or loading core state failed.
    StorageFailed = 0x0004,
    /// The configuration is invalid.
    InvalidConfig = 0x0005,
}

impl ErrorCode {
    /// Returns the numeric code.
    #[inline]
    #[must_use]
    pub const fn as_u16(self) -> u16 {
        self as u16
    }

    /// Returns the wire name of the code.
    #[must_use]
    pub const fn as_str(&self) -> &'static str {
        match self {
            Self::PreconditionFailed => "PRECONDITION_FAILED",
            Self::EffectScopeExceeded => "EFFECT_SCOPE_EXCEEDED",
            Self::ExplicitRangeRequired => "EXPLICIT_RANGE_REQUIRED",
            Self::AmbiguousRange => "AMBIGUOUS_RANGE",
            Self::SnapshotCreationFailed => "SNAPSHOT_CREATION_FAILED",
            Self::SnapshotRestoreFailed => "SNAPSHOT_RESTORE_FAILED",
            Self::SnapshotNotFound => "SNAPSHOT_NOT_FOUND",
            Self::TransactionConflict => "TRANSACTION_CONFLICT",
            Self::TransactionExpired => "TRANSACTION_EXPIRED",
            Self::TransactionNotFound => "TRANSACTION_NOT_FOUND",
            Self::InvalidTransactionState => "INVALID_TRANSACTION_STATE",
            Self::ReplayFailed => "REPLAY_FAILED",
            Self::NothingToUndo => "NOTHING_TO_UNDO",
            Self::NothingToRedo => "NOTHING_TO_REDO",
            Self::OperationNotFound => "OPERATION_NOT_FOUND",
            Self::ConflictNotFound => "CONFLICT_NOT_FOUND",
            Self::MergeValueRequired => "MERGE_VALUE_REQUIRED",
            Self::ExecutorFailed => "EXECUTOR_FAILED",
            Self::Cancelled => "CANCELLED",
            Self::InvalidRequest => "INVALID_REQUEST",
            Self::StorageFailed => "STORAGE_FAILED",
            Self::InvalidConfig => "INVALID_CONFIG",
        }
    }

    /// Returns the error category name.
    #[must_use]
    pub const fn category(&self) -> &'static str {
        match (*self as u16) >> 8 {
            0x00 => "General",
            0x01 => "Guard",
            0x02 => "Snapshot",
            0x03 => "Transaction",
            0x04 => "History",
            0x05 => "Conflict",
            _ => "Unknown",
        }
    }
}

impl fmt::Display for ErrorCode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Which effect-scope limit was exceeded.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ScopeDimension {
    /// `max_cells_affected`.
    Cells,
    /// `max_rows_affected`.
    Rows,
    /// `max_columns_affected`.
    Columns,
}

impl fmt::Display for ScopeDimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ScopeDimension::Cells => write!(f, "cells"),
            ScopeDimension::Rows => write!(f, "rows"),
            ScopeDimension::Columns => write!(f, "columns"),
        }
    }
}

fn join_mismatches(mismatched: &[FieldMismatch]) -> String {
    mismatched
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

/// The main error type for the safety layer.
///
/// # Example
///
/// ```rust
/// use sheetguard_common::error::{ErrorCode, GuardError};
/// use sheetguard_common::types::TxnId;
///
/// let err = GuardError::TransactionExpired { txn_id: TxnId::new(3) };
/// assert_eq!(err.code(), ErrorCode::TransactionExpired);
/// assert_eq!(err.code().as_str(), "TRANSACTION_EXPIRED");
/// ```
#[derive(Debug, Clone, Error)]
pub enum GuardError {
    // ==========================================================================
    // Fence and Guard Errors
    // ==========================================================================
    /// The live document no longer matches the caller's expectation.
    #[error("precondition failed on document {document}: {}", join_mismatches(.mismatched))]
    PreconditionFailed {
        /// The fenced document.
        document: DocumentId,
        /// Every populated field that did not match.
        mismatched: Vec<FieldMismatch>,
    },

    /// The estimated effect exceeds a configured or caller-supplied limit.
    #[error("effect scope exceeded: {estimated} {dimension} affected, limit is {limit}")]
    EffectScopeExceeded {
        /// Which limit.
        dimension: ScopeDimension,
        /// Estimated count.
        estimated: u64,
        /// The limit.
        limit: u64,
    },

    /// The request targets an entire sheet while an explicit range is required.
    #[error("explicit range required: {reason}")]
    ExplicitRangeRequired {
        /// Why the target was not explicit.
        reason: String,
    },

    /// A sheet name resolved to more than one sheet.
    #[error("ambiguous range: sheet '{name}' matches {}", .candidates.join(", "))]
    AmbiguousRange {
        /// The supplied name.
        name: String,
        /// Every sheet it matched.
        candidates: Vec<String>,
    },

    // ==========================================================================
    // Snapshot Errors
    // ==========================================================================
    /// Snapshot creation failed.
    #[error("snapshot creation failed for document {document}: {reason}")]
    SnapshotCreationFailed {
        /// The document.
        document: DocumentId,
        /// Reason for failure.
        reason: String,
    },

    /// Snapshot restore failed or was refused by its fence.
    #[error("snapshot {snapshot_id} restore failed: {reason}")]
    SnapshotRestoreFailed {
        /// The snapshot.
        snapshot_id: SnapshotId,
        /// Reason for failure.
        reason: String,
        /// Fence mismatches, when the restore was refused as stale.
        mismatched: Vec<FieldMismatch>,
    },

    /// Unknown snapshot.
    #[error("snapshot {0} not found")]
    SnapshotNotFound(SnapshotId),

    // ==========================================================================
    // Transaction Errors
    // ==========================================================================
    /// Another transaction is active on the document.
    #[error("document {document} already has active transaction {active}")]
    TransactionConflict {
        /// The document.
        document: DocumentId,
        /// The transaction holding the document.
        active: TxnId,
    },

    /// The transaction idled past its TTL.
    #[error("transaction {txn_id} expired")]
    TransactionExpired {
        /// The expired transaction.
        txn_id: TxnId,
    },

    /// Unknown transaction.
    #[error("transaction {0} not found")]
    TransactionNotFound(TxnId),

    /// The transaction is not in a state that allows the operation.
    #[error("transaction {txn_id} is {current}, expected {expected}")]
    InvalidTransactionState {
        /// The transaction.
        txn_id: TxnId,
        /// Its current state.
        current: String,
        /// The state(s) the operation needs.
        expected: &'static str,
    },

    /// Rolling back a failed commit also failed; the transaction is left failed.
    #[error("rollback of transaction {txn_id} failed after '{cause}': {reason}")]
    RollbackFailed {
        /// The transaction.
        txn_id: TxnId,
        /// Why the commit failed.
        cause: String,
        /// Why the rollback failed.
        reason: String,
    },

    // ==========================================================================
    // History Errors
    // ==========================================================================
    /// Applying an inverse or replaying an operation failed.
    #[error("replay of {op_id} failed: {reason}")]
    ReplayFailed {
        /// The operation being replayed.
        op_id: OpId,
        /// Reason for failure.
        reason: String,
    },

    /// No applied entry left to undo.
    #[error("nothing to undo on document {0}")]
    NothingToUndo(DocumentId),

    /// No undone entry left to redo.
    #[error("nothing to redo on document {0}")]
    NothingToRedo(DocumentId),

    /// Unknown operation.
    #[error("operation {0} not found in history")]
    OperationNotFound(OpId),

    // ==========================================================================
    // Conflict Errors
    // ==========================================================================
    /// Unknown or already resolved conflict.
    #[error("conflict {0} not found")]
    ConflictNotFound(ConflictId),

    /// The strategy needs a caller-supplied merged value.
    #[error("conflict {conflict_id} needs a merged value: {reason}")]
    MergeValueRequired {
        /// The conflict.
        conflict_id: ConflictId,
        /// Why no value could be derived.
        reason: String,
    },

    // ==========================================================================
    // General Errors
    // ==========================================================================
    /// The executor failed (after retries, for transient errors).
    #[error("executor error: {source}")]
    Executor {
        /// The underlying executor error.
        #[from]
        source: ExecutorError,
    },

    /// The operation was cancelled.
    #[error("operation was cancelled")]
    Cancelled,

    /// The request is malformed.
    #[error("invalid request: {message}")]
    InvalidRequest {
        /// Error message.
        message: String,
    },

    /// Persisting or loading core state failed.
    #[error("storage error: {message}")]
    Storage {
        /// Error message.
        message: String,
    },

    /// The configuration is invalid.
    #[error("invalid configuration: {message}")]
    InvalidConfig {
        /// Error message.
        message: String,
    },
}

impl GuardError {
    /// Returns the error code for this error.
    #[must_use]
    pub const fn code(&self) -> ErrorCode {
        match self {
            Self::PreconditionFailed { .. } => ErrorCode::PreconditionFailed,
            Self::EffectScopeExceeded { .. } => ErrorCode::EffectScopeExceeded,
            Self::ExplicitRangeRequired { .. } => ErrorCode::ExplicitRangeRequired,
            Self::AmbiguousRange { .. } => ErrorCode::AmbiguousRange,
            Self::SnapshotCreationFailed { .. } => ErrorCode::SnapshotCreationFailed,
            Self::SnapshotRestoreFailed { .. } => ErrorCode::SnapshotRestoreFailed,
            Self::SnapshotNotFound(_) => ErrorCode::SnapshotNotFound,
            Self::TransactionConflict { .. } => ErrorCode::TransactionConflict,
            Self::TransactionExpired { .. } => ErrorCode::TransactionExpired,
            Self::TransactionNotFound(_) => ErrorCode::TransactionNotFound,
            Self::InvalidTransactionState { .. } => ErrorCode::InvalidTransactionState,
            Self::RollbackFailed { .. } | Self::ReplayFailed { .. } => ErrorCode::ReplayFailed,
            Self::NothingToUndo(_) => ErrorCode::NothingToUndo,
            Self::NothingToRedo(_) => ErrorCode::NothingToRedo,
            Self::OperationNotFound(_) => ErrorCode::OperationNotFound,
            Self::ConflictNotFound(_) => ErrorCode::ConflictNotFound,
            Self::MergeValueRequired { .. } => ErrorCode::MergeValueRequired,
            Self::Executor { .. } => ErrorCode::ExecutorFailed,
            Self::Cancelled => ErrorCode::Cancelled,
            Self::InvalidRequest { .. } => ErrorCode::InvalidRequest,
            Self::Storage { .. } => ErrorCode::StorageFailed,
            Self::InvalidConfig { .. } => ErrorCode::InvalidConfig,
        }
    }

    /// Returns true if the error is a transient executor failure.
    #[must_use]
    pub const fn is_retryable(&self) -> bool {
        match self {
            Self::Executor { source } => source.is_transient(),
            _ => false,
        }
    }

    /// Returns true if the error reports a concurrent modification.
    #[must_use]
    pub const fn is_conflict(&self) -> bool {
        matches!(
            self,
            Self::PreconditionFailed { .. } | Self::TransactionConflict { .. }
        )
    }

    /// Returns the mismatched fields of a fence failure.
    #[must_use]
    pub fn mismatched_fields(&self) -> &[FieldMismatch] {
        match self {
            Self::PreconditionFailed { mismatched, .. }
            | Self::SnapshotRestoreFailed { mismatched, .. } => mismatched,
            _ => &[],
        }
    }

    /// Creates an invalid request error.
    #[must_use]
    pub fn invalid_request(message: impl Into<String>) -> Self {
        Self::InvalidRequest {
            message: message.into(),
        }
    }

    /// Creates a storage error.
    #[must_use]
    pub fn storage(message: impl Into<String>) -> Self {
        Self::Storage {
            message: message.into(),
        }
    }
}
