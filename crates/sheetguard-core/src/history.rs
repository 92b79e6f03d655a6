//! Per-document history and undo log.
//!
//! Every mutation the pipeline applies is appended with the opaque inverse
//! the executor returned. Entries are never deleted by undo or redo; they
//! only move between states:
//!
//! ```text
//!   append ──▶ Applied ──undo──▶ Undone ──redo──▶ Applied
//!                                  │
//!                    append after undo, or rollback
//!                                  ▼
//!                             Superseded
//! ```
//!
//! Non-superseded entries always form an applied prefix followed by an
//! undone tail, so a document's position in its history is the length of
//! the applied prefix.

use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, Weak};

use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{debug, info};

use sheetguard_common::config::HistoryConfig;
use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{
    DocumentFingerprint, DocumentId, DocumentVersion, ExpectedState, OpId, SessionId, SnapshotId,
    Timestamp, TxnId,
};
use sheetguard_executor::{
    ActionExecutor, ExecutorResult, IdempotencyKey, InverseOp, OpDescriptor, RetryPolicy,
};

use crate::fence::VersionFence;
use crate::pipeline::{apply_idempotent, apply_inverse_idempotent};
use crate::snapshot::{RestoreOptions, SnapshotManager};
use crate::store::{load_records, put_record, RecordKind, StateStore, StoreResult};
use crate::txn::{HolderLink, TxnHolder};

/// Where an entry stands.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Its effect is in the document.
    Applied,
    /// Its inverse was applied.
    Undone,
    /// Discarded by a later append or a rollback.
    Superseded,
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            EntryStatus::Applied => write!(f, "applied"),
            EntryStatus::Undone => write!(f, "undone"),
            EntryStatus::Superseded => write!(f, "superseded"),
        }
    }
}

/// One applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct HistoryEntry {
    /// Operation id.
    pub op_id: OpId,
    /// Document.
    pub document_id: DocumentId,
    /// When it was applied.
    pub timestamp: Timestamp,
    /// What was applied.
    pub operation: OpDescriptor,
    /// Executor instruction that undoes it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<InverseOp>,
    /// Version before the write.
    pub version_before: DocumentVersion,
    /// Fingerprint after the write.
    pub result_fingerprint: DocumentFingerprint,
    /// Snapshot taken right before the write.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub snapshot_before: Option<SnapshotId>,
    /// Status.
    pub status: EntryStatus,
    /// Writing session.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    /// Owning transaction.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub txn: Option<TxnId>,
    /// How many times the entry was redone.
    #[serde(default)]
    pub generation: u32,
}

impl HistoryEntry {
    /// Returns true if an inverse was captured.
    #[must_use]
    pub fn is_reversible(&self) -> bool {
        self.inverse.is_some()
    }
}

/// How `revert_to` got there.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "plan", rename_all = "snake_case")]
pub enum RevertPlan {
    /// Already at the target.
    Noop,
    /// Inverses or redos only.
    Replay,
    /// Restored a snapshot, then replayed.
    Snapshot {
        /// The restored snapshot.
        snapshot_id: SnapshotId,
    },
}

/// Result of a revert.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RevertReport {
    /// Operation the document now ends at.
    pub target: OpId,
    /// Plan chosen.
    pub plan: RevertPlan,
    /// Entries undone, in order.
    pub undone: Vec<OpId>,
    /// Entries redone, in order.
    pub redone: Vec<OpId>,
    /// Document version afterwards.
    pub version: DocumentVersion,
}

/// How undo, redo and revert are fenced.
///
/// By default the live document must still be at the latest version the
/// core observed, so an edit made outside the guard is never silently
/// overwritten.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReplayOptions {
    /// Fence on this state instead of the document's head version.
    pub expected: Option<ExpectedState>,
    /// Skip the fence entirely.
    pub force: bool,
}

impl ReplayOptions {
    /// Replays without a fence.
    #[must_use]
    pub fn forced() -> Self {
        Self {
            expected: None,
            force: true,
        }
    }

    /// Fences on an explicit expectation.
    #[must_use]
    pub fn expecting(expected: ExpectedState) -> Self {
        Self {
            expected: Some(expected),
            force: false,
        }
    }
}

#[derive(Debug, Serialize, Deserialize)]
struct HistoryRecord {
    document_id: DocumentId,
    entries: Vec<HistoryEntry>,
}

/// Cheapest way to reach a history position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
struct Plan {
    /// Position the replay starts from.
    start: usize,
    /// Snapshot to restore first.
    snapshot: Option<SnapshotId>,
    /// Executor calls needed.
    cost: usize,
}

/// The history log.
pub struct HistoryLog {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    fence: Arc<VersionFence>,
    snapshots: Arc<SnapshotManager>,
    store: Arc<dyn StateStore>,
    max_entries: usize,
    entries: RwLock<HashMap<DocumentId, Vec<HistoryEntry>>>,
    turns: DashMap<DocumentId, Arc<tokio::sync::Mutex<()>>>,
    txns: HolderLink,
}

impl HistoryLog {
    /// Opens the log, loading persisted entries.
    pub fn open(
        executor: Arc<dyn ActionExecutor>,
        retry: RetryPolicy,
        fence: Arc<VersionFence>,
        snapshots: Arc<SnapshotManager>,
        store: Arc<dyn StateStore>,
        config: &HistoryConfig,
    ) -> GuardResult<Self> {
        let records: Vec<HistoryRecord> = load_records(store.as_ref(), RecordKind::History)?;
        let entries = records
            .into_iter()
            .map(|r| (r.document_id, r.entries))
            .collect();
        Ok(Self {
            executor,
            retry,
            fence,
            snapshots,
            store,
            max_entries: config.max_entries_per_document.max(1),
            entries: RwLock::new(entries),
            turns: DashMap::new(),
            txns: HolderLink::default(),
        })
    }

    /// Links the log to the transaction coordinator. Undo, redo and revert
    /// are refused while a transaction holds the document.
    pub fn link_transactions(&self, holder: Weak<dyn TxnHolder>) {
        self.txns.set(holder);
    }

    /// Appends an entry, superseding any undone tail.
    pub fn append(&self, entry: HistoryEntry) -> GuardResult<()> {
        let document = entry.document_id.clone();
        let log = {
            let mut all = self.entries.write();
            let log = all.entry(document.clone()).or_default();
            for e in log.iter_mut().filter(|e| e.status == EntryStatus::Undone) {
                e.status = EntryStatus::Superseded;
            }
            log.push(entry);
            if log.len() > self.max_entries {
                let excess = log.len() - self.max_entries;
                log.drain(..excess);
            }
            log.clone()
        };
        self.persist(&document, log)
    }

    /// Every entry for a document, oldest first.
    #[must_use]
    pub fn list(&self, document: &DocumentId) -> Vec<HistoryEntry> {
        self.entries
            .read()
            .get(document)
            .cloned()
            .unwrap_or_default()
    }

    /// Looks up one entry.
    #[must_use]
    pub fn get(&self, document: &DocumentId, op_id: OpId) -> Option<HistoryEntry> {
        self.entries
            .read()
            .get(document)
            .and_then(|log| log.iter().find(|e| e.op_id == op_id).cloned())
    }

    /// Highest operation id in any document's history.
    #[must_use]
    pub fn max_op_id(&self) -> Option<OpId> {
        self.entries
            .read()
            .values()
            .flat_map(|log| log.iter().map(|e| e.op_id))
            .max()
    }

    /// Marks entries superseded without touching the document.
    pub fn supersede(&self, document: &DocumentId, ops: &[OpId]) -> GuardResult<()> {
        self.set_status(document, ops, EntryStatus::Superseded)
    }

    /// Discards a document's history without touching the document.
    pub fn clear(&self, document: &DocumentId) -> GuardResult<()> {
        self.entries.write().remove(document);
        self.store.delete(RecordKind::History, document.as_str())?;
        info!(%document, "history cleared");
        Ok(())
    }

    /// Applies the inverse of the last applied entry.
    pub async fn undo(
        &self,
        document: &DocumentId,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<HistoryEntry> {
        self.txns.check(document, None)?;
        let _turn = self.turn(document).await;
        let live = self.live(document);
        let entry = live
            .iter()
            .rev()
            .find(|e| e.status == EntryStatus::Applied)
            .cloned()
            .ok_or_else(|| GuardError::NothingToUndo(document.clone()))?;
        self.fence_head(document, Self::position_version(&live), &options, cancel)
            .await?;
        self.undo_entry(&entry, cancel).await?;
        self.get(document, entry.op_id)
            .ok_or(GuardError::OperationNotFound(entry.op_id))
    }

    /// Re-applies the most recently undone entry.
    pub async fn redo(
        &self,
        document: &DocumentId,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<HistoryEntry> {
        self.txns.check(document, None)?;
        let _turn = self.turn(document).await;
        let live = self.live(document);
        let entry = live
            .iter()
            .find(|e| e.status == EntryStatus::Undone)
            .cloned()
            .ok_or_else(|| GuardError::NothingToRedo(document.clone()))?;
        self.fence_head(document, Self::position_version(&live), &options, cancel)
            .await?;
        self.redo_entry(&entry, cancel).await?;
        self.get(document, entry.op_id)
            .ok_or(GuardError::OperationNotFound(entry.op_id))
    }

    /// Moves the document to the state right after `target` was applied.
    ///
    /// Chooses the plan with the fewest executor calls among replaying
    /// inverses or redos from the current position and restoring any
    /// still indexed snapshot, then replaying from there.
    pub async fn revert_to(
        &self,
        document: &DocumentId,
        target: OpId,
        options: ReplayOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<RevertReport> {
        self.txns.check(document, None)?;
        let _turn = self.turn(document).await;
        let live = self.live(document);
        let index = live
            .iter()
            .position(|e| e.op_id == target)
            .ok_or(GuardError::OperationNotFound(target))?;
        let goal = index + 1;
        let current = live
            .iter()
            .take_while(|e| e.status == EntryStatus::Applied)
            .count();

        let mut report = RevertReport {
            target,
            plan: RevertPlan::Noop,
            undone: Vec::new(),
            redone: Vec::new(),
            version: self.fence.head(document).unwrap_or_default(),
        };
        if goal == current {
            return Ok(report);
        }

        let plan = self.plan(&live, current, goal).ok_or_else(|| GuardError::ReplayFailed {
            op_id: target,
            reason: "no inverse or snapshot path reaches the operation".into(),
        })?;
        debug!(%document, %target, ?plan, "revert plan chosen");
        self.fence_head(document, Self::position_version(&live), &options, cancel)
            .await?;

        let mut at = plan.start;
        if let Some(snapshot_id) = plan.snapshot {
            let fingerprint = self
                .snapshots
                .restore(snapshot_id, RestoreOptions::forced(), cancel)
                .await?;
            report.version = fingerprint.version;
            report.plan = RevertPlan::Snapshot { snapshot_id };
            let (before, after) = live.split_at(plan.start);
            self.mark_restored(document, &ids(before))?;
            self.set_status(document, &ids(after), EntryStatus::Undone)?;
        } else {
            report.plan = RevertPlan::Replay;
        }

        while at > goal {
            at -= 1;
            report.version = self.undo_entry(&live[at], cancel).await?.fingerprint.version;
            report.undone.push(live[at].op_id);
        }
        while at < goal {
            report.version = self.redo_entry(&live[at], cancel).await?.fingerprint.version;
            report.redone.push(live[at].op_id);
            at += 1;
        }

        info!(%document, %target, plan = ?report.plan, version = %report.version, "reverted");
        Ok(report)
    }

    /// Fails with `PRECONDITION_FAILED` unless the live document is where
    /// the core last left it. Without a recorded head the version after the
    /// newest applied entry stands in; with neither nothing is checked.
    async fn fence_head(
        &self,
        document: &DocumentId,
        fallback: Option<DocumentVersion>,
        options: &ReplayOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<()> {
        if options.force {
            return Ok(());
        }
        let expected = match (&options.expected, self.fence.head(document).or(fallback)) {
            (Some(expected), _) => expected.clone(),
            (None, Some(head)) => ExpectedState::version(head),
            (None, None) => return Ok(()),
        };
        self.fence.check(document, &expected, cancel).await?;
        Ok(())
    }

    /// Version after the newest applied entry.
    fn position_version(live: &[HistoryEntry]) -> Option<DocumentVersion> {
        live.iter()
            .rev()
            .find(|e| e.status == EntryStatus::Applied)
            .map(|e| e.result_fingerprint.version)
    }

    fn plan(&self, live: &[HistoryEntry], current: usize, goal: usize) -> Option<Plan> {
        let reachable = |from: usize| from <= goal || live[goal..from].iter().all(HistoryEntry::is_reversible);

        let mut best = reachable(current).then_some(Plan {
            start: current,
            snapshot: None,
            cost: current.abs_diff(goal),
        });
        for (k, entry) in live.iter().enumerate() {
            let Some(id) = entry.snapshot_before else {
                continue;
            };
            if self.snapshots.get(id).is_none() || !reachable(k) {
                continue;
            }
            let cost = 1 + k.abs_diff(goal);
            if best.map_or(true, |b| cost < b.cost) {
                best = Some(Plan {
                    start: k,
                    snapshot: Some(id),
                    cost,
                });
            }
        }
        best
    }

    async fn undo_entry(
        &self,
        entry: &HistoryEntry,
        cancel: &CancellationToken,
    ) -> GuardResult<ExecutorResult> {
        let document = &entry.document_id;
        let inverse = entry.inverse.as_ref().ok_or_else(|| GuardError::ReplayFailed {
            op_id: entry.op_id,
            reason: "operation captured no inverse".into(),
        })?;
        let key = IdempotencyKey::for_inverse(document, entry.op_id, entry.generation, inverse);
        let result = apply_inverse_idempotent(&self.executor, &self.retry, document, inverse, key, cancel)
            .await
            .map_err(|err| replay_failed(entry.op_id, err))?;
        self.fence.record_head(document, result.fingerprint.version);
        self.set_status(document, &[entry.op_id], EntryStatus::Undone)?;
        info!(op = %entry.op_id, %document, version = %result.fingerprint.version, "undone");
        Ok(result)
    }

    async fn redo_entry(
        &self,
        entry: &HistoryEntry,
        cancel: &CancellationToken,
    ) -> GuardResult<ExecutorResult> {
        let document = &entry.document_id;
        let generation = entry.generation + 1;
        let key = IdempotencyKey::for_generation(document, entry.op_id, generation, &entry.operation);
        let result = apply_idempotent(
            &self.executor,
            &self.retry,
            document,
            &entry.operation,
            key,
            cancel,
        )
        .await
        .map_err(|err| replay_failed(entry.op_id, err))?;
        self.fence.record_head(document, result.fingerprint.version);

        let log = {
            let mut all = self.entries.write();
            let log = all.entry(document.clone()).or_default();
            if let Some(e) = log.iter_mut().find(|e| e.op_id == entry.op_id) {
                e.status = EntryStatus::Applied;
                e.inverse = result.inverse.clone();
                e.result_fingerprint = result.fingerprint.clone();
                e.generation = generation;
            }
            log.clone()
        };
        self.persist(document, log)?;
        info!(op = %entry.op_id, %document, version = %result.fingerprint.version, "redone");
        Ok(result)
    }

    /// Non-superseded entries, oldest first.
    fn live(&self, document: &DocumentId) -> Vec<HistoryEntry> {
        self.list(document)
            .into_iter()
            .filter(|e| e.status != EntryStatus::Superseded)
            .collect()
    }

    fn set_status(&self, document: &DocumentId, ops: &[OpId], status: EntryStatus) -> GuardResult<()> {
        if ops.is_empty() {
            return Ok(());
        }
        let log = {
            let mut all = self.entries.write();
            let Some(log) = all.get_mut(document) else {
                return Ok(());
            };
            for e in log.iter_mut().filter(|e| ops.contains(&e.op_id)) {
                e.status = status;
            }
            log.clone()
        };
        self.persist(document, log)
    }

    /// Marks entries applied by a snapshot restore. Entries that were
    /// undone start a new generation so their next undo gets a fresh key.
    fn mark_restored(&self, document: &DocumentId, ops: &[OpId]) -> GuardResult<()> {
        let log = {
            let mut all = self.entries.write();
            let Some(log) = all.get_mut(document) else {
                return Ok(());
            };
            for e in log.iter_mut().filter(|e| ops.contains(&e.op_id)) {
                if e.status != EntryStatus::Applied {
                    e.status = EntryStatus::Applied;
                    e.generation += 1;
                }
            }
            log.clone()
        };
        self.persist(document, log)
    }

    async fn turn(&self, document: &DocumentId) -> tokio::sync::OwnedMutexGuard<()> {
        let lock = self.turns.entry(document.clone()).or_default().clone();
        lock.lock_owned().await
    }

    fn persist(&self, document: &DocumentId, entries: Vec<HistoryEntry>) -> GuardResult<()> {
        let record = HistoryRecord {
            document_id: document.clone(),
            entries,
        };
        put_record(self.store.as_ref(), RecordKind::History, document.as_str(), &record)?;
        Ok(())
    }
}

/// Reads a document's persisted history straight from a store.
pub fn load_history(store: &dyn StateStore, document: &DocumentId) -> StoreResult<Vec<HistoryEntry>> {
    let records: Vec<HistoryRecord> = load_records(store, RecordKind::History)?;
    Ok(records
        .into_iter()
        .find(|r| r.document_id == *document)
        .map(|r| r.entries)
        .unwrap_or_default())
}

fn ids(entries: &[HistoryEntry]) -> Vec<OpId> {
    entries.iter().map(|e| e.op_id).collect()
}

fn replay_failed(op_id: OpId, err: GuardError) -> GuardError {
    match err {
        GuardError::Cancelled => GuardError::Cancelled,
        other => GuardError::ReplayFailed {
            op_id,
            reason: other.to_string(),
        },
    }
}

impl fmt::Debug for HistoryLog {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HistoryLog")
            .field("documents", &self.entries.read().len())
            .field("max_entries", &self.max_entries)
            .finish()
    }
}
