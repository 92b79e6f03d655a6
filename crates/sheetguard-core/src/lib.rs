//! # sheetguard-core
//!
//! Safety and consistency layer for remote spreadsheet documents.
//!
//! The document store behind an [`ActionExecutor`](sheetguard_executor::ActionExecutor)
//! offers no transactions, no locks and only a coarse version number. This
//! crate adds them from the outside:
//!
//! - **Version Fence**: Optimistic preconditions on the live document.
//! - **Effect Scope Guard**: Blast-radius limits evaluated before any call.
//! - **Snapshots**: Whole-document copies for rollback.
//! - **Diff Engine**: Full, sampled or metadata-only change reports.
//! - **Conflicts**: Detection of concurrent writes and their resolution.
//! - **Transactions**: All-or-nothing batches, one per document.
//! - **History**: Per-document undo, redo and revert.
//!
//! # Architecture
//!
//! ```text
//! ┌────────────────────────────────────────────────────────────────┐
//! │                          SheetGuard                            │
//! │        ┌──────────────────────┴─────────────────────┐          │
//! │        ▼                                            ▼          │
//! │ ┌──────────────────────┐          ┌──────────────────────────┐ │
//! │ │ TransactionCoordinator│─commit─▶│     MutationPipeline      │ │
//! │ └──────────────────────┘          │ fence → scope → snapshot  │ │
//! │            │ rollback             │ → execute → diff → history│ │
//! │            ▼                      │ → ledger                  │ │
//! │ ┌──────────────────────┐          └─────────────┬────────────┘ │
//! │ │   SnapshotManager    │◀───────────────────────┤              │
//! │ └──────────────────────┘                        ▼              │
//! │ ┌──────────────────────┐          ┌──────────────────────────┐ │
//! │ │   ConflictManager    │─reads───▶│       WriteLedger         │ │
//! │ └──────────────────────┘          └──────────────────────────┘ │
//! │                 all state persisted through dyn StateStore     │
//! └────────────────────────────────────────────────────────────────┘
//!                               │
//!                               ▼
//!                      dyn ActionExecutor
//! ```
//!
//! # Example Usage
//!
//! ```rust
//! use sheetguard_common::config::GuardConfig;
//! use sheetguard_common::types::DocumentId;
//! use sheetguard_core::{MutationRequest, SheetGuard};
//! use sheetguard_executor::{actions, MemoryExecutor};
//! use tokio_util::sync::CancellationToken;
//!
//! # tokio::runtime::Builder::new_current_thread().enable_all().build().unwrap().block_on(async {
//! let exec = MemoryExecutor::shared();
//! exec.add_document(&DocumentId::new("S1"), &[("Sheet1", 100, 26)]);
//! let guard = SheetGuard::builder()
//!     .executor(exec)
//!     .config(GuardConfig::for_testing())
//!     .build()
//!     .unwrap();
//!
//! let request = MutationRequest::new(
//!     "S1",
//!     actions::write_range("Sheet1!A1".parse().unwrap(), vec![vec![42.into()]]),
//! );
//! let outcome = guard.guarded_mutate(request, &CancellationToken::new()).await.unwrap();
//! assert!(outcome.applied().is_some());
//! # });
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod conflict;
pub mod diff;
pub mod fence;
pub mod guard;
pub mod history;
pub mod pipeline;
pub mod request;
pub mod scope;
pub mod snapshot;
pub mod store;
pub mod txn;

pub use conflict::{Conflict, ConflictQuery, ConflictType, Resolution, ResolutionStrategy, Severity, Since};
pub use diff::{DiffTier, TierKind};
pub use guard::{SheetGuard, SheetGuardBuilder};
pub use history::{EntryStatus, HistoryEntry, ReplayOptions, RevertPlan, RevertReport};
pub use request::{
    DryRunReport, EffectLimits, MutationOptions, MutationOutcome, MutationRequest,
    MutationResponse, MutationSummary, SheetShape,
};
pub use snapshot::{RestoreOptions, Snapshot};
pub use store::{FileStore, MemoryStore, RecordKind, StateStore};
pub use txn::{CommitReport, RollbackPath, TxnOptions, TxnReport, TxnState, TxnStatus};
