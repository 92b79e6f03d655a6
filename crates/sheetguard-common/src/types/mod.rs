//! Core types for SheetGuard.
//!
//! This module contains identifiers, A1 ranges, cell contents, timestamps and document
//! fingerprints shared by every component.

mod cell;
mod fingerprint;
mod ids;
mod range;
mod timestamps;

pub use cell::{Cell, CellGrid, CellValue};
pub use fingerprint::{DocumentFingerprint, ExpectedState, FieldMismatch};
pub use ids::{ConflictId, DocumentId, DocumentVersion, OpId, SessionId, SnapshotId, TxnId};
pub use range::{column_name, A1Range, CellRef, Extent, GridRect, RangeParseError};
pub use timestamps::Timestamp;
