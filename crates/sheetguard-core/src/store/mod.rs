//! Persistence of safety-layer state.
//!
//! Transactions, history logs, the snapshot index, open conflicts and the
//! write ledger survive restarts through a [`StateStore`]. Records are plain
//! JSON values grouped by [`RecordKind`]; each component owns the shape of
//! its own records.
//!
//! # Architecture
//!
//! ```text
//! ┌──────────────┐ ┌────────────┐ ┌──────────────┐ ┌───────────┐
//! │ Coordinator  │ │ HistoryLog │ │ SnapshotMgr  │ │ Conflicts │
//! └──────┬───────┘ └─────┬──────┘ └──────┬───────┘ └─────┬─────┘
//!        └───────────────┴───────┬───────┴───────────────┘
//!                                ▼
//!                      ┌───────────────────┐
//!                      │  dyn StateStore   │
//!                      └─────────┬─────────┘
//!                     ┌──────────┴──────────┐
//!                     ▼                     ▼
//!               MemoryStore       FileStore (<data_dir>/<kind>/*.json)
//! ```

mod file;
mod memory;

pub use file::FileStore;
pub use memory::MemoryStore;

use std::fmt;

use serde::de::DeserializeOwned;
use serde::Serialize;
use thiserror::Error;

use sheetguard_common::error::GuardError;

/// Errors that can occur in store operations.
#[derive(Debug, Error)]
pub enum StoreError {
    /// IO error.
    #[error("io error: {0}")]
    Io(#[from] std::io::Error),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// A record failed its integrity check.
    #[error("record corrupted: {0}")]
    Corrupted(String),
}

impl From<serde_json::Error> for StoreError {
    fn from(e: serde_json::Error) -> Self {
        StoreError::Serialization(e.to_string())
    }
}

impl From<StoreError> for GuardError {
    fn from(e: StoreError) -> Self {
        GuardError::storage(e.to_string())
    }
}

/// Result type for store operations.
pub type StoreResult<T> = Result<T, StoreError>;

/// The kinds of record the safety layer persists.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum RecordKind {
    /// One record per transaction.
    Transaction,
    /// One record per document: its history log.
    History,
    /// One record per snapshot.
    Snapshot,
    /// One record per open conflict.
    Conflict,
    /// One record per document: its write ledger.
    Ledger,
}

impl RecordKind {
    /// All kinds.
    pub const ALL: [RecordKind; 5] = [
        RecordKind::Transaction,
        RecordKind::History,
        RecordKind::Snapshot,
        RecordKind::Conflict,
        RecordKind::Ledger,
    ];

    /// Directory name used for the kind.
    #[must_use]
    pub const fn dir_name(self) -> &'static str {
        match self {
            RecordKind::Transaction => "transactions",
            RecordKind::History => "history",
            RecordKind::Snapshot => "snapshots",
            RecordKind::Conflict => "conflicts",
            RecordKind::Ledger => "ledger",
        }
    }
}

impl fmt::Display for RecordKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.dir_name())
    }
}

/// Durable key-value storage for safety-layer records.
pub trait StateStore: Send + Sync + fmt::Debug {
    /// Inserts or replaces a record.
    fn put(&self, kind: RecordKind, key: &str, value: &serde_json::Value) -> StoreResult<()>;

    /// Removes a record; removing a missing record is not an error.
    fn delete(&self, kind: RecordKind, key: &str) -> StoreResult<()>;

    /// Loads every record of a kind, in key order.
    fn load_all(&self, kind: RecordKind) -> StoreResult<Vec<(String, serde_json::Value)>>;
}

/// Serializes and stores a typed record.
pub fn put_record<T: Serialize>(
    store: &dyn StateStore,
    kind: RecordKind,
    key: &str,
    record: &T,
) -> StoreResult<()> {
    let value = serde_json::to_value(record)?;
    store.put(kind, key, &value)
}

/// Loads and deserializes every record of a kind.
pub fn load_records<T: DeserializeOwned>(
    store: &dyn StateStore,
    kind: RecordKind,
) -> StoreResult<Vec<T>> {
    store
        .load_all(kind)?
        .into_iter()
        .map(|(key, value)| {
            serde_json::from_value(value)
                .map_err(|e| StoreError::Corrupted(format!("{kind}/{key}: {e}")))
        })
        .collect()
}
