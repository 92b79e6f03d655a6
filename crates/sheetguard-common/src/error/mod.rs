//! Error handling for SheetGuard.
//!
//! [`GuardError`] is the error every safety-layer operation returns;
//! [`ExecutorError`] is what an action executor reports back.

mod executor;
mod guard;

pub use executor::{ExecResult, ExecutorError};
pub use guard::{ErrorCode, GuardError, ScopeDimension};

/// Result type alias for safety-layer operations.
pub type GuardResult<T> = std::result::Result<T, GuardError>;
