//! # sheetguard-executor
//!
//! The boundary between the SheetGuard safety core and a remote document
//! store.
//!
//! ## Architecture
//!
//! ```text
//! ┌─────────────────────────────────────────────────────────────┐
//! │                    sheetguard-core                          │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 │ RetryPolicy::run            │ OpDescriptor
//!                 ▼                             ▼
//! ┌─────────────────────────────────────────────────────────────┐
//! │                 dyn ActionExecutor                          │
//! │   fingerprint · read · mutate · inverse · snapshot          │
//! └───────────────┬─────────────────────────────┬───────────────┘
//!                 ▼                             ▼
//!        production executor             MemoryExecutor
//! ```
//!
//! ## Key Components
//!
//! - [`ActionExecutor`]: Object-safe trait with boxed futures
//! - [`OpDescriptor`] / [`EffectShape`]: What a mutation does and where
//! - [`RetryPolicy`]: Exponential backoff with cancellation
//! - [`MemoryExecutor`]: In-memory workbooks with fault injection for tests

#![warn(missing_docs)]
#![warn(clippy::all)]

pub mod actions;
mod descriptor;
mod executor;
mod memory;
mod retry;

pub use descriptor::{
    Dimension, EffectShape, ExecutorResult, IdempotencyKey, InverseOp, OpDescriptor,
    SnapshotHandle,
};
pub use executor::{ActionExecutor, ExecFuture};
pub use memory::{ExecCall, MemoryExecutor};
pub use retry::{RetryPolicy, RetryPredicate};
