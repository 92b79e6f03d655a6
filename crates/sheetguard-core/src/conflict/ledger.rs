//! Per-document log of writes that went through the core.
//!
//! The detector reads it to tell the caller's own writes apart from other
//! sessions' and to learn the checksum a range had right after the last
//! write. Each document keeps at most `capacity` writes, oldest dropped
//! first.

use std::collections::{HashMap, VecDeque};
use std::sync::Arc;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};

use sheetguard_common::error::GuardResult;
use sheetguard_common::types::{
    A1Range, CellGrid, DocumentId, DocumentVersion, OpId, SessionId, Timestamp, TxnId,
};

use crate::store::{load_records, put_record, RecordKind, StateStore};

/// A point in a document's past.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", content = "value", rename_all = "snake_case")]
pub enum Since {
    /// After this version.
    Version(DocumentVersion),
    /// After this instant.
    Timestamp(Timestamp),
}

/// One write recorded by the core.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LedgerWrite {
    /// Operation that wrote.
    pub op_id: OpId,
    /// Writing session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    /// Written range, sheet-qualified.
    pub range: A1Range,
    /// Rows of the sheet at write time.
    pub sheet_rows: u32,
    /// Columns of the sheet at write time.
    pub sheet_cols: u32,
    /// Version before the write.
    pub version_before: DocumentVersion,
    /// Version after the write.
    pub version_after: DocumentVersion,
    /// Cells before the write, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells_before: Option<CellGrid>,
    /// Cells after the write, when captured.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub cells_after: Option<CellGrid>,
    /// Checksum of `range` right after the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub range_checksum_after: Option<u32>,
    /// The executor touched fewer cells than the payload held.
    #[serde(default)]
    pub partial: bool,
    /// When the write landed.
    pub at: Timestamp,
    /// Transaction the write belonged to.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn: Option<TxnId>,
}

impl LedgerWrite {
    /// Returns true if the write happened after `since`.
    #[must_use]
    pub fn is_after(&self, since: &Since) -> bool {
        match since {
            Since::Version(v) => self.version_after > *v,
            Since::Timestamp(t) => self.at > *t,
        }
    }

    /// Returns true if the write may share a cell with `range`.
    #[must_use]
    pub fn overlaps(&self, range: &A1Range) -> bool {
        self.range.overlaps(range, self.sheet_rows, self.sheet_cols)
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct LedgerRecord {
    document_id: DocumentId,
    writes: Vec<LedgerWrite>,
}

/// Bounded per-document write ledger.
#[derive(Debug)]
pub struct WriteLedger {
    capacity: usize,
    store: Arc<dyn StateStore>,
    writes: RwLock<HashMap<DocumentId, VecDeque<LedgerWrite>>>,
}

impl WriteLedger {
    /// Opens the ledger, loading persisted writes.
    pub fn open(store: Arc<dyn StateStore>, capacity: usize) -> GuardResult<Self> {
        let records: Vec<LedgerRecord> = load_records(store.as_ref(), RecordKind::Ledger)?;
        let writes = records
            .into_iter()
            .map(|r| (r.document_id, r.writes.into_iter().collect()))
            .collect();
        Ok(Self {
            capacity: capacity.max(1),
            store,
            writes: RwLock::new(writes),
        })
    }

    /// Appends a write.
    pub fn record(&self, document: &DocumentId, write: LedgerWrite) -> GuardResult<()> {
        let snapshot = {
            let mut all = self.writes.write();
            let log = all.entry(document.clone()).or_default();
            log.push_back(write);
            while log.len() > self.capacity {
                log.pop_front();
            }
            log.iter().cloned().collect::<Vec<_>>()
        };
        self.persist(document, snapshot)
    }

    /// Every recorded write for a document, oldest first.
    #[must_use]
    pub fn writes(&self, document: &DocumentId) -> Vec<LedgerWrite> {
        self.writes
            .read()
            .get(document)
            .map(|log| log.iter().cloned().collect())
            .unwrap_or_default()
    }

    /// Writes after `since` that overlap `range`, oldest first.
    #[must_use]
    pub fn overlapping_since(
        &self,
        document: &DocumentId,
        range: &A1Range,
        since: &Since,
    ) -> Vec<LedgerWrite> {
        self.writes
            .read()
            .get(document)
            .map(|log| {
                log.iter()
                    .filter(|w| w.is_after(since) && w.overlaps(range))
                    .cloned()
                    .collect()
            })
            .unwrap_or_default()
    }

    /// The newest write that covered exactly `range`.
    #[must_use]
    pub fn last_exact(&self, document: &DocumentId, range: &A1Range) -> Option<LedgerWrite> {
        self.writes.read().get(document).and_then(|log| {
            log.iter()
                .rev()
                .find(|w| w.range.same_sheet(range) && w.range.extent == range.extent)
                .cloned()
        })
    }

    /// Drops a document's writes.
    pub fn clear(&self, document: &DocumentId) -> GuardResult<()> {
        self.writes.write().remove(document);
        self.store.delete(RecordKind::Ledger, document.as_str())?;
        Ok(())
    }

    fn persist(&self, document: &DocumentId, writes: Vec<LedgerWrite>) -> GuardResult<()> {
        let record = LedgerRecord {
            document_id: document.clone(),
            writes,
        };
        put_record(
            self.store.as_ref(),
            RecordKind::Ledger,
            document.as_str(),
            &record,
        )?;
        Ok(())
    }
}
