//! # sheetguard-common
//!
//! Common types, errors, and configuration for SheetGuard.
//!
//! This crate provides the foundational types shared by the executor
//! boundary and the safety core. It includes:
//!
//! - **Types**: Identifiers (`TxnId`, `OpId`, `SnapshotId`), A1 ranges, cells,
//!   timestamps and document fingerprints
//! - **Errors**: `GuardError` with stable `ErrorCode`s, and `ExecutorError`
//! - **Config**: `GuardConfig` and its per-component sections
//! - **Clock**: Injectable time sources
//! - **Constants**: Default limits and thresholds
//!
//! ## Example
//!
//! ```rust
//! use sheetguard_common::types::{A1Range, DocumentVersion, ExpectedState};
//! use sheetguard_common::error::GuardResult;
//!
//! fn example() -> GuardResult<()> {
//!     let range: A1Range = "Sheet1!A1:B2".parse()
//!         .map_err(|e: sheetguard_common::types::RangeParseError| {
//!             sheetguard_common::GuardError::invalid_request(e.to_string())
//!         })?;
//!     let expected = ExpectedState::version(DocumentVersion::new(1));
//!     assert!(range.is_explicit());
//!     assert!(!expected.is_empty());
//!     Ok(())
//! }
//! # example().unwrap();
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]
#![allow(clippy::module_name_repetitions)]

pub mod clock;
pub mod config;
pub mod constants;
pub mod error;
pub mod types;

// Re-export commonly used items at the crate root
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use config::GuardConfig;
pub use error::{ErrorCode, ExecResult, ExecutorError, GuardError, GuardResult};
pub use types::{
    A1Range, DocumentFingerprint, DocumentId, DocumentVersion, ExpectedState, OpId, SessionId,
    SnapshotId, Timestamp, TxnId,
};
