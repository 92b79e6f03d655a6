//! The action executor boundary.
//!
//! The safety layer never talks to the document store directly. Every read,
//! write, copy and restore goes through an [`ActionExecutor`], which is the
//! single seam a production deployment implements against the real store
//! and tests implement with [`MemoryExecutor`](crate::MemoryExecutor).
//!
//! ```text
//! ┌──────────────┐   fingerprint / read    ┌────────────────┐
//! │  SheetGuard  │ ──────────────────────▶ │ ActionExecutor │ ──▶ document store
//! │  safety core │ ◀────────────────────── │                │
//! └──────────────┘  ExecutorResult + inv.  └────────────────┘
//! ```

use std::future::Future;
use std::pin::Pin;

use sheetguard_common::error::ExecResult;
use sheetguard_common::types::{A1Range, CellGrid, DocumentFingerprint, DocumentId};

use crate::descriptor::{ExecutorResult, IdempotencyKey, InverseOp, OpDescriptor, SnapshotHandle};

/// Boxed future returned by executor calls.
pub type ExecFuture<'a, T> = Pin<Box<dyn Future<Output = ExecResult<T>> + Send + 'a>>;

/// Trait for executing actions against a remote document.
///
/// Implementations must be safe to share across tasks; the core calls them
/// concurrently for different documents.
pub trait ActionExecutor: Send + Sync {
    /// Fetches the document's fingerprint.
    ///
    /// The checksum covers `range` when given, otherwise the whole first
    /// sheet, and the returned fingerprint echoes `range` in
    /// `checksum_range`.
    fn fetch_fingerprint<'a>(
        &'a self,
        document: &'a DocumentId,
        range: Option<&'a A1Range>,
    ) -> ExecFuture<'a, DocumentFingerprint>;

    /// Reads the cells of a range.
    fn read_range<'a>(
        &'a self,
        document: &'a DocumentId,
        range: &'a A1Range,
    ) -> ExecFuture<'a, CellGrid>;

    /// Applies a mutation, recording it under `key`.
    fn apply_mutation<'a>(
        &'a self,
        document: &'a DocumentId,
        op: &'a OpDescriptor,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult>;

    /// Writes literal cells at the grid's origin, recording the write under
    /// `key`.
    fn write_cells<'a>(
        &'a self,
        document: &'a DocumentId,
        cells: &'a CellGrid,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult>;

    /// Applies an inverse previously returned by this executor, recording
    /// it under `key`.
    fn apply_inverse<'a>(
        &'a self,
        document: &'a DocumentId,
        inverse: &'a InverseOp,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult>;

    /// Returns the recorded result if a call with `key` already landed.
    ///
    /// Covers [`apply_mutation`](Self::apply_mutation),
    /// [`write_cells`](Self::write_cells) and
    /// [`apply_inverse`](Self::apply_inverse).
    fn find_applied<'a>(
        &'a self,
        document: &'a DocumentId,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, Option<ExecutorResult>>;

    /// Copies the document.
    fn create_snapshot<'a>(&'a self, document: &'a DocumentId) -> ExecFuture<'a, SnapshotHandle>;

    /// Replaces the document's content with a copy.
    fn restore_snapshot<'a>(
        &'a self,
        document: &'a DocumentId,
        handle: &'a SnapshotHandle,
    ) -> ExecFuture<'a, DocumentFingerprint>;

    /// Discards a copy.
    fn delete_snapshot<'a>(&'a self, handle: &'a SnapshotHandle) -> ExecFuture<'a, ()>;

    /// Returns true if every write advances the document version.
    fn monotonic_versions(&self) -> bool {
        true
    }
}
