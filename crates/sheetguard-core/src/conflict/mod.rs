//! Conflict detection and resolution.
//!
//! The detector compares what the caller last knew about a range with the
//! live document and with the [write ledger](WriteLedger) of writes that
//! went through the core:
//!
//! ```text
//!   nothing changed since `since`                      ──▶ no conflict
//!   caller wrote, and someone else wrote or the live
//!   range diverged from the caller's write             ──▶ concurrent_write
//!   checksum moved without the version, or partial write ──▶ data_race
//!   version moved with no overlapping write            ──▶ version_mismatch
//! ```
//!
//! Severity and the suggested strategy come from a [`ConflictPolicy`].
//! Every resolution writes through the executor, so the version advances.

mod ledger;
mod policy;

pub use ledger::{LedgerWrite, Since, WriteLedger};
pub use policy::{
    three_way_merge, ConflictPolicy, ConflictType, ConflictValues, DefaultConflictPolicy,
    MergeError, ResolutionStrategy, Severity,
};

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sheetguard_common::clock::SharedClock;
use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{
    A1Range, CellGrid, ConflictId, DocumentId, DocumentVersion, ExpectedState, OpId, SessionId,
    Timestamp, TxnId,
};
use sheetguard_executor::{ActionExecutor, IdempotencyKey, RetryPolicy};

use crate::fence::VersionFence;
use crate::pipeline::write_cells_idempotent;
use crate::store::{load_records, put_record, RecordKind, StateStore};
use crate::txn::{HolderLink, TxnHolder};

/// What the caller wants checked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ConflictQuery {
    /// Document.
    pub document_id: DocumentId,
    /// Range the caller cares about.
    pub range: A1Range,
    /// Point the caller's view dates from.
    pub since: Since,
    /// The caller's session.
    pub session: Option<SessionId>,
    /// Checksum of `range` the caller last saw.
    pub last_known_checksum: Option<u32>,
    /// Transaction the check belongs to.
    pub transaction: Option<TxnId>,
}

impl ConflictQuery {
    /// Creates a query.
    pub fn new(document_id: impl Into<DocumentId>, range: A1Range, since: Since) -> Self {
        Self {
            document_id: document_id.into(),
            range,
            since,
            session: None,
            last_known_checksum: None,
            transaction: None,
        }
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Sets the last known checksum.
    #[must_use]
    pub fn with_checksum(mut self, checksum: u32) -> Self {
        self.last_known_checksum = Some(checksum);
        self
    }

    /// Attributes detected conflicts to a transaction.
    #[must_use]
    pub fn in_transaction(mut self, txn: TxnId) -> Self {
        self.transaction = Some(txn);
        self
    }
}

/// Conflict lifecycle.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictStatus {
    /// Awaiting resolution.
    Open,
    /// Settled.
    Resolved,
}

/// A detected conflict.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Conflict {
    /// Conflict id.
    pub id: ConflictId,
    /// Document.
    pub document_id: DocumentId,
    /// Sheet-qualified range.
    pub range: A1Range,
    /// Version of the caller's view.
    pub local_version: DocumentVersion,
    /// Live version at detection.
    pub remote_version: DocumentVersion,
    /// Live range checksum at detection.
    pub remote_checksum: u32,
    /// What the caller wrote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub local_value: Option<CellGrid>,
    /// What the range holds now.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub remote_value: Option<CellGrid>,
    /// What the range held before the caller wrote.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_value: Option<CellGrid>,
    /// Classification.
    pub conflict_type: ConflictType,
    /// Severity.
    pub severity: Severity,
    /// Detection time.
    pub detected_at: Timestamp,
    /// What the policy suggests.
    pub suggested_strategy: ResolutionStrategy,
    /// Transaction that detected it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transaction: Option<TxnId>,
    /// Session that detected it.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    /// Status.
    pub status: ConflictStatus,
}

/// The outcome of a resolution.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Resolution {
    /// The resolved conflict.
    pub conflict_id: ConflictId,
    /// Strategy applied.
    pub strategy: ResolutionStrategy,
    /// Cells written.
    pub final_value: CellGrid,
    /// Document version after the write.
    pub version: DocumentVersion,
}

/// Detects and resolves conflicts.
pub struct ConflictManager {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    fence: Arc<VersionFence>,
    ledger: Arc<WriteLedger>,
    policy: Arc<dyn ConflictPolicy>,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    value_cell_limit: u64,
    conflicts: RwLock<BTreeMap<ConflictId, Conflict>>,
    next_id: AtomicU64,
    txns: HolderLink,
}

/// Qualifies a sheet-less range with the default sheet's title.
pub(crate) fn qualify(range: &A1Range, default_sheet: &str) -> A1Range {
    match range.sheet {
        Some(_) => range.clone(),
        None => range.with_sheet(default_sheet),
    }
}

impl ConflictManager {
    /// Opens the manager, loading persisted open conflicts.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        executor: Arc<dyn ActionExecutor>,
        retry: RetryPolicy,
        fence: Arc<VersionFence>,
        ledger: Arc<WriteLedger>,
        policy: Arc<dyn ConflictPolicy>,
        clock: SharedClock,
        store: Arc<dyn StateStore>,
        value_cell_limit: u64,
    ) -> GuardResult<Self> {
        let loaded: Vec<Conflict> = load_records(store.as_ref(), RecordKind::Conflict)?;
        let next = loaded
            .iter()
            .map(|c| c.id.as_u64())
            .max()
            .map_or(ConflictId::FIRST.as_u64(), |max| max + 1);
        Ok(Self {
            executor,
            retry,
            fence,
            ledger,
            policy,
            clock,
            store,
            value_cell_limit,
            conflicts: RwLock::new(loaded.into_iter().map(|c| (c.id, c)).collect()),
            next_id: AtomicU64::new(next),
            txns: HolderLink::default(),
        })
    }

    /// Links the manager to the transaction coordinator. Resolutions are
    /// refused while a transaction holds the document.
    pub fn link_transactions(&self, holder: Weak<dyn TxnHolder>) {
        self.txns.set(holder);
    }

    /// The write ledger.
    #[must_use]
    pub fn ledger(&self) -> &Arc<WriteLedger> {
        &self.ledger
    }

    /// Checks a range for conflicts.
    pub async fn detect(
        &self,
        query: &ConflictQuery,
        cancel: &CancellationToken,
    ) -> GuardResult<Vec<Conflict>> {
        let doc = &query.document_id;
        let live = self.fence.current(doc, Some(&query.range), cancel).await?;
        let range = qualify(&query.range, &live.sheet_title);
        let monotonic = self.executor.monotonic_versions();

        let writes = self.ledger.overlapping_since(doc, &range, &query.since);
        let (local, remote): (Vec<&LedgerWrite>, Vec<&LedgerWrite>) = writes
            .iter()
            .partition(|w| query.session.is_some() && w.session == query.session);

        let history = self.ledger.writes(doc);
        let since_version = match query.since {
            Since::Version(v) => Some(v),
            Since::Timestamp(t) => history
                .iter()
                .rev()
                .find(|w| w.at <= t)
                .map(|w| w.version_after),
        };
        // Newest version explained by the caller's view or a known write.
        let known_version = history
            .iter()
            .filter(|w| w.is_after(&query.since))
            .map(|w| w.version_after)
            .chain(since_version)
            .max();
        let unexplained =
            monotonic && known_version.map_or(!writes.is_empty(), |v| live.version > v);

        let (baseline_checksum, baseline_version) = match query.last_known_checksum {
            Some(checksum) => (Some(checksum), since_version),
            None => match self.ledger.last_exact(doc, &range) {
                Some(w) => (w.range_checksum_after, Some(w.version_after)),
                None => (None, None),
            },
        };
        let checksum_changed = baseline_checksum.map(|c| c != live.checksum);
        let diverged = checksum_changed.unwrap_or(unexplained);
        let partial = writes.iter().any(|w| w.partial);
        let silent_change = monotonic
            && checksum_changed == Some(true)
            && baseline_version == Some(live.version);

        let kind = if !local.is_empty() && (!remote.is_empty() || diverged) {
            ConflictType::ConcurrentWrite
        } else if partial || silent_change {
            ConflictType::DataRace
        } else if !remote.is_empty() || diverged || unexplained {
            ConflictType::VersionMismatch
        } else {
            return Ok(Vec::new());
        };

        let remote_value = if range.rect(live.row_count, live.column_count).cell_count()
            <= self.value_cell_limit
        {
            let exec = &self.executor;
            let read = &range;
            Some(
                self.retry
                    .run("read_range", cancel, |_| exec.read_range(doc, read))
                    .await?,
            )
        } else {
            None
        };
        let base_value = local.first().and_then(|w| w.cells_before.clone());
        let local_value = local.last().and_then(|w| w.cells_after.clone());
        let local_version = local
            .last()
            .map(|w| w.version_after)
            .or(since_version)
            .unwrap_or(live.version);

        let (severity, suggested_strategy) = self.policy.assess(
            kind,
            ConflictValues {
                base: base_value.as_ref(),
                local: local_value.as_ref(),
                remote: remote_value.as_ref(),
            },
        );

        let conflict = Conflict {
            id: ConflictId::new(self.next_id.fetch_add(1, Ordering::SeqCst)),
            document_id: doc.clone(),
            range,
            local_version,
            remote_version: live.version,
            remote_checksum: live.checksum,
            local_value,
            remote_value,
            base_value,
            conflict_type: kind,
            severity,
            detected_at: self.clock.now(),
            suggested_strategy,
            transaction: query.transaction,
            session: query.session.clone(),
            status: ConflictStatus::Open,
        };

        // A fresh detection supersedes an open conflict on the same range.
        let superseded: Vec<ConflictId> = self
            .conflicts
            .read()
            .values()
            .filter(|c| {
                c.document_id == conflict.document_id
                    && c.session == conflict.session
                    && c.range.same_sheet(&conflict.range)
                    && c.range.extent == conflict.range.extent
            })
            .map(|c| c.id)
            .collect();
        for id in superseded {
            self.remove(id)?;
        }

        put_record(
            self.store.as_ref(),
            RecordKind::Conflict,
            &conflict.id.as_u64().to_string(),
            &conflict,
        )?;
        self.conflicts.write().insert(conflict.id, conflict.clone());

        warn!(
            id = %conflict.id,
            document = %doc,
            range = %conflict.range,
            kind = %kind,
            ?severity,
            "conflict detected"
        );
        Ok(vec![conflict])
    }

    /// Settles a conflict by writing the chosen value.
    pub async fn resolve(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        merged_value: Option<Vec<Vec<serde_json::Value>>>,
        cancel: &CancellationToken,
    ) -> GuardResult<Resolution> {
        let conflict = self.get(id).ok_or(GuardError::ConflictNotFound(id))?;
        let doc = &conflict.document_id;
        self.txns.check(doc, None)?;

        let mut expected = ExpectedState::default()
            .with_checksum(conflict.remote_checksum, Some(conflict.range.clone()));
        if self.executor.monotonic_versions() {
            expected.version = Some(conflict.remote_version);
        }
        let before = self.fence.check(doc, &expected, cancel).await?;

        let supplied = merged_value.map(|rows| {
            CellGrid::from_json_rows(
                conflict.range.sheet.clone(),
                conflict.range.origin(),
                &rows,
            )
        });
        let needs = |reason: &str| GuardError::MergeValueRequired {
            conflict_id: id,
            reason: reason.to_string(),
        };
        let value = match strategy {
            ResolutionStrategy::KeepLocal => conflict
                .local_value
                .clone()
                .ok_or_else(|| needs("no local value was captured"))?,
            ResolutionStrategy::KeepRemote => conflict
                .remote_value
                .clone()
                .ok_or_else(|| needs("no remote value was captured"))?,
            ResolutionStrategy::Merge => match supplied {
                Some(grid) => grid,
                None => three_way_merge(ConflictValues {
                    base: conflict.base_value.as_ref(),
                    local: conflict.local_value.as_ref(),
                    remote: conflict.remote_value.as_ref(),
                })
                .map_err(|err| match err {
                    MergeError::MissingValues => needs("base, local or remote value missing"),
                    MergeError::Clashes(cells) => needs(&format!(
                        "{} cell(s) changed on both sides",
                        cells.len()
                    )),
                })?,
            },
            ResolutionStrategy::Manual => {
                supplied.ok_or_else(|| needs("manual resolution needs a value"))?
            }
        };

        let key = IdempotencyKey::for_cells(doc, id.as_u64(), &value);
        let result =
            write_cells_idempotent(&self.executor, &self.retry, doc, &value, key, cancel).await?;
        let version = result.fingerprint.version;
        self.fence.record_head(doc, version);

        let written = match value.sheet {
            Some(_) => value.range(),
            None => value.range().with_sheet(before.sheet_title.clone()),
        };
        // The resolution has landed; a failed ledger entry only costs
        // later detections their merge base.
        let recorded = match self.fence.current(doc, Some(&written), cancel).await {
            Ok(after) => self.ledger.record(
                doc,
                LedgerWrite {
                    op_id: OpId::INVALID,
                    session: conflict.session.clone(),
                    range: written,
                    sheet_rows: after.row_count,
                    sheet_cols: after.column_count,
                    version_before: before.version,
                    version_after: version,
                    cells_before: conflict.remote_value.clone(),
                    cells_after: Some(value.clone()),
                    range_checksum_after: Some(after.checksum),
                    partial: false,
                    at: self.clock.now(),
                    txn: conflict.transaction,
                },
            ),
            Err(err) => Err(err),
        };
        if let Err(err) = recorded {
            warn!(%id, document = %doc, error = %err, "resolution not recorded in the write ledger");
        }

        self.remove(id)?;
        info!(%id, document = %doc, %strategy, %version, "conflict resolved");

        Ok(Resolution {
            conflict_id: id,
            strategy,
            final_value: value,
            version,
        })
    }

    /// Returns an open conflict.
    #[must_use]
    pub fn get(&self, id: ConflictId) -> Option<Conflict> {
        self.conflicts.read().get(&id).cloned()
    }

    /// Open conflicts on a document, oldest first.
    #[must_use]
    pub fn list(&self, document: &DocumentId) -> Vec<Conflict> {
        self.conflicts
            .read()
            .values()
            .filter(|c| c.document_id == *document)
            .cloned()
            .collect()
    }

    /// Drops the open conflicts a transaction detected.
    pub fn drop_for_transaction(&self, txn: TxnId) -> GuardResult<usize> {
        let ids: Vec<ConflictId> = self
            .conflicts
            .read()
            .values()
            .filter(|c| c.transaction == Some(txn))
            .map(|c| c.id)
            .collect();
        for id in &ids {
            self.remove(*id)?;
        }
        Ok(ids.len())
    }

    fn remove(&self, id: ConflictId) -> GuardResult<()> {
        self.store
            .delete(RecordKind::Conflict, &id.as_u64().to_string())?;
        self.conflicts.write().remove(&id);
        Ok(())
    }
}

impl std::fmt::Debug for ConflictManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("ConflictManager")
            .field("open", &self.conflicts.read().len())
            .field("value_cell_limit", &self.value_cell_limit)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetguard_common::clock::ManualClock;
    use sheetguard_common::ErrorCode;
    use sheetguard_executor::MemoryExecutor;

    use crate::store::MemoryStore;

    struct Fixture {
        exec: Arc<MemoryExecutor>,
        manager: ConflictManager,
        doc: DocumentId,
    }

    fn fixture() -> Fixture {
        let exec = MemoryExecutor::shared();
        let doc = DocumentId::new("S1");
        exec.add_document(&doc, &[("Sheet1", 10, 5)]);
        let store: Arc<dyn StateStore> = Arc::new(MemoryStore::new());
        let fence = Arc::new(VersionFence::new(exec.clone(), RetryPolicy::no_retry()));
        let ledger = Arc::new(WriteLedger::open(store.clone(), 16).unwrap());
        let manager = ConflictManager::open(
            exec.clone(),
            RetryPolicy::no_retry(),
            fence,
            ledger,
            Arc::new(DefaultConflictPolicy),
            ManualClock::shared(1_000),
            store,
            1_000,
        )
        .unwrap();
        Fixture { exec, manager, doc }
    }

    fn range(s: &str) -> A1Range {
        s.parse().unwrap()
    }

    fn grid(origin: &str, values: &[Vec<serde_json::Value>]) -> CellGrid {
        CellGrid::from_json_rows(Some("Sheet1".into()), range(origin).origin(), values)
    }

    /// Records a write by `session` that moved the document one version.
    fn record_local(f: &Fixture, session: &str, at: &str, before: &[Vec<serde_json::Value>], after: &[Vec<serde_json::Value>]) {
        let target = range(at);
        let version_before = f.exec.version(&f.doc).unwrap();
        let version_after = f.exec.external_write(&f.doc, &target, after).unwrap();
        let after_grid = grid(at, after);
        f.manager
            .ledger()
            .record(
                &f.doc,
                LedgerWrite {
                    op_id: OpId::new(1),
                    session: Some(SessionId::new(session)),
                    range: after_grid.range(),
                    sheet_rows: 10,
                    sheet_cols: 5,
                    version_before,
                    version_after,
                    cells_before: Some(grid(at, before)),
                    range_checksum_after: Some(after_grid.checksum()),
                    cells_after: Some(after_grid),
                    partial: false,
                    at: Timestamp::from_millis(1_000),
                    txn: None,
                },
            )
            .unwrap();
    }

    #[tokio::test]
    async fn test_no_conflict_when_unchanged() {
        let f = fixture();
        let query = ConflictQuery::new("S1", range("Sheet1!A1:B2"), Since::Version(DocumentVersion::new(1)));
        let found = f.manager.detect(&query, &CancellationToken::new()).await.unwrap();
        assert!(found.is_empty());
    }

    #[tokio::test]
    async fn test_external_write_is_version_mismatch() {
        let f = fixture();
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!("x")]])
            .unwrap();
        let query = ConflictQuery::new("S1", range("A1:B2"), Since::Version(DocumentVersion::new(1)));
        let found = f.manager.detect(&query, &CancellationToken::new()).await.unwrap();
        assert_eq!(found.len(), 1);
        let conflict = &found[0];
        assert_eq!(conflict.conflict_type, ConflictType::VersionMismatch);
        assert_eq!(conflict.suggested_strategy, ResolutionStrategy::KeepRemote);
        assert_eq!(conflict.range.to_string(), "Sheet1!A1:B2");
        assert_eq!(conflict.remote_version, DocumentVersion::new(2));
        assert_eq!(f.manager.list(&f.doc).len(), 1);
    }

    #[tokio::test]
    async fn test_concurrent_write_and_keep_remote() {
        let f = fixture();
        record_local(&f, "alice", "Sheet1!A1", &[vec![json!(null)]], &[vec![json!(1)]]);
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!(2)]])
            .unwrap();

        let query = ConflictQuery::new("S1", range("Sheet1!A1"), Since::Version(DocumentVersion::new(1)))
            .with_session("alice");
        let cancel = CancellationToken::new();
        let found = f.manager.detect(&query, &cancel).await.unwrap();
        assert_eq!(found.len(), 1);
        assert_eq!(found[0].conflict_type, ConflictType::ConcurrentWrite);
        assert_eq!(found[0].suggested_strategy, ResolutionStrategy::Manual);

        let version = f.exec.version(&f.doc).unwrap();
        let resolution = f
            .manager
            .resolve(found[0].id, ResolutionStrategy::KeepRemote, None, &cancel)
            .await
            .unwrap();
        assert!(resolution.version > version);
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "2");
        assert!(f.manager.list(&f.doc).is_empty());
    }

    #[tokio::test]
    async fn test_silent_change_is_data_race() {
        let f = fixture();
        record_local(&f, "alice", "Sheet1!B2", &[vec![json!(null)]], &[vec![json!("a")]]);
        f.exec
            .external_write_silent(&f.doc, &range("Sheet1!B2"), &[vec![json!("b")]])
            .unwrap();
        let query = ConflictQuery::new("S1", range("Sheet1!B2"), Since::Version(DocumentVersion::new(2)));
        let found = f.manager.detect(&query, &CancellationToken::new()).await.unwrap();
        assert_eq!(found[0].conflict_type, ConflictType::DataRace);
        assert_eq!(found[0].severity, Severity::Critical);
    }

    #[tokio::test]
    async fn test_merge_needs_values() {
        let f = fixture();
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!(1)]])
            .unwrap();
        let query = ConflictQuery::new("S1", range("Sheet1!A1"), Since::Version(DocumentVersion::new(1)));
        let cancel = CancellationToken::new();
        let id = f.manager.detect(&query, &cancel).await.unwrap()[0].id;
        let err = f
            .manager
            .resolve(id, ResolutionStrategy::Merge, None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::MergeValueRequired);

        f.manager
            .resolve(id, ResolutionStrategy::Manual, Some(vec![vec![json!(9)]]), &cancel)
            .await
            .unwrap();
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "9");
    }

    #[tokio::test]
    async fn test_resolve_refuses_stale_conflict() {
        let f = fixture();
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!(1)]])
            .unwrap();
        let query = ConflictQuery::new("S1", range("Sheet1!A1"), Since::Version(DocumentVersion::new(1)));
        let cancel = CancellationToken::new();
        let id = f.manager.detect(&query, &cancel).await.unwrap()[0].id;
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!(2)]])
            .unwrap();
        let err = f
            .manager
            .resolve(id, ResolutionStrategy::KeepRemote, None, &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
    }

    #[tokio::test]
    async fn test_drop_for_transaction() {
        let f = fixture();
        f.exec
            .external_write(&f.doc, &range("Sheet1!A1"), &[vec![json!(1)]])
            .unwrap();
        let query = ConflictQuery::new("S1", range("Sheet1!A1"), Since::Version(DocumentVersion::new(1)))
            .in_transaction(TxnId::new(4));
        f.manager.detect(&query, &CancellationToken::new()).await.unwrap();
        assert_eq!(f.manager.drop_for_transaction(TxnId::new(4)).unwrap(), 1);
        assert!(f.manager.list(&f.doc).is_empty());
    }
}
