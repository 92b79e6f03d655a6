//! Configuration for SheetGuard.
//!
//! This module provides the configuration structures for every safety-layer
//! component.

mod guard;

pub use guard::{
    ConflictConfig, DiffConfig, FenceConfig, GuardConfig, GuardConfigBuilder, HistoryConfig,
    RetryConfig, ScopeConfig, SnapshotConfig, TransactionConfig,
};
