//! Multi-step transaction coordinator.
//!
//! A transaction queues mutations against one document and applies them
//! all or none at commit time. The document store has no transactions of
//! its own, so atomicity comes from a pre-commit snapshot (or the captured
//! inverses when snapshots are disabled).
//!
//! # Transaction States
//!
//! ```text
//! ┌─────────┐  commit()  ┌────────────┐   all ops applied   ┌───────────┐
//! │ Pending │───────────▶│ Committing │────────────────────▶│ Committed │
//! └─────────┘            └────────────┘                     └───────────┘
//!   │     │                    │  op failed / cancelled
//!   │     │ rollback()         ├──── rollback ok ──────────▶ RolledBack
//!   │     └────────────────────┼─────────────────────────▶ RolledBack
//!   │ idle past TTL            └──── rollback failed ─────▶ Failed
//!   └────────────────────────────────────────────────────▶ Expired
//! ```
//!
//! At most one non-terminal transaction exists per document; the
//! [`TxnGate`] enforces it with compare-and-set claims.

mod registry;

pub use registry::TxnGate;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};
use std::time::Duration;

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use sheetguard_common::clock::SharedClock;
use sheetguard_common::config::TransactionConfig;
use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{
    DocumentFingerprint, DocumentId, DocumentVersion, ExpectedState, OpId, SessionId,
    SnapshotId, Timestamp, TxnId,
};
use sheetguard_executor::{ActionExecutor, IdempotencyKey, RetryPolicy};

use crate::conflict::{Conflict, ConflictManager};
use crate::fence::VersionFence;
use crate::history::HistoryLog;
use crate::pipeline::{apply_inverse_idempotent, ExecuteFailure, MutationPipeline, Stage};
use crate::request::{MutationOutcome, MutationRequest, MutationResponse};
use crate::snapshot::{RestoreObserver, RestoreOptions, SnapshotManager};
use crate::store::{load_records, put_record, RecordKind, StateStore};

/// Reports which transaction holds a document.
pub trait TxnHolder: Send + Sync {
    /// The non-terminal transaction holding `document`, with its state.
    fn holder(&self, document: &DocumentId) -> Option<(TxnId, TxnState)>;
}

/// Late-bound link from a component that writes outside the pipeline to
/// the coordinator.
#[derive(Default)]
pub struct HolderLink {
    holder: RwLock<Option<Weak<dyn TxnHolder>>>,
}

impl HolderLink {
    /// Points the link at a coordinator.
    pub fn set(&self, holder: Weak<dyn TxnHolder>) {
        *self.holder.write() = Some(holder);
    }

    /// Fails with `TRANSACTION_CONFLICT` if a transaction other than
    /// `owner` holds `document`.
    pub fn check(&self, document: &DocumentId, owner: Option<TxnId>) -> GuardResult<()> {
        self.refuse(document, owner, |_| true)
    }

    /// Fails with `TRANSACTION_CONFLICT` if a transaction other than
    /// `owner` is committing on `document`.
    pub fn check_not_committing(
        &self,
        document: &DocumentId,
        owner: Option<TxnId>,
    ) -> GuardResult<()> {
        self.refuse(document, owner, |state| state == TxnState::Committing)
    }

    fn refuse(
        &self,
        document: &DocumentId,
        owner: Option<TxnId>,
        blocks: impl Fn(TxnState) -> bool,
    ) -> GuardResult<()> {
        let holder = self.holder.read().as_ref().and_then(Weak::upgrade);
        match holder.and_then(|h| h.holder(document)) {
            Some((active, state)) if Some(active) != owner && blocks(state) => {
                Err(GuardError::TransactionConflict {
                    document: document.clone(),
                    active,
                })
            }
            _ => Ok(()),
        }
    }
}

impl fmt::Debug for HolderLink {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("HolderLink")
            .field("linked", &self.holder.read().is_some())
            .finish()
    }
}

/// The state of a transaction.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TxnState {
    /// Accepting queued operations.
    Pending,
    /// Applying its operations.
    Committing,
    /// Every operation applied.
    Committed,
    /// Abandoned, or undone after a failed commit.
    RolledBack,
    /// Idled past its TTL or invalidated by a restore.
    Expired,
    /// A failed commit could not be rolled back.
    Failed,
}

impl TxnState {
    /// Returns true if the transaction has ended.
    #[must_use]
    pub fn is_terminal(&self) -> bool {
        !matches!(self, TxnState::Pending | TxnState::Committing)
    }
}

impl fmt::Display for TxnState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TxnState::Pending => write!(f, "pending"),
            TxnState::Committing => write!(f, "committing"),
            TxnState::Committed => write!(f, "committed"),
            TxnState::RolledBack => write!(f, "rolled_back"),
            TxnState::Expired => write!(f, "expired"),
            TxnState::Failed => write!(f, "failed"),
        }
    }
}

/// Options chosen at `begin`.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TxnOptions {
    /// Idle timeout overriding configuration.
    pub ttl: Option<Duration>,
    /// Roll back through inverses instead of a pre-commit snapshot.
    pub skip_snapshot: bool,
    /// Session the queued writes are attributed to.
    pub session: Option<SessionId>,
    /// Label.
    pub name: Option<String>,
}

impl TxnOptions {
    /// Sets the TTL.
    #[must_use]
    pub fn with_ttl(mut self, ttl: Duration) -> Self {
        self.ttl = Some(ttl);
        self
    }

    /// Disables the pre-commit snapshot.
    #[must_use]
    pub fn skip_snapshot(mut self) -> Self {
        self.skip_snapshot = true;
        self
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Sets a label.
    #[must_use]
    pub fn named(mut self, name: impl Into<String>) -> Self {
        self.name = Some(name.into());
        self
    }
}

/// How a failed commit was undone.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "path", rename_all = "snake_case")]
pub enum RollbackPath {
    /// Nothing had been applied.
    Nothing,
    /// The pre-commit snapshot was restored.
    Snapshot {
        /// The restored snapshot.
        snapshot_id: SnapshotId,
    },
    /// Inverses were replayed newest first.
    Inverses {
        /// Inverses applied.
        count: usize,
    },
}

/// Why a transaction did not commit.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TxnReport {
    /// Error code of the cause.
    pub error_code: String,
    /// Error message of the cause.
    pub message: String,
    /// Index of the operation that failed, if one did.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_op: Option<usize>,
    /// Operations applied before the failure.
    #[serde(default)]
    pub applied: Vec<OpId>,
    /// How the applied operations were undone.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback: Option<RollbackPath>,
    /// Why the rollback failed.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub rollback_error: Option<String>,
}

impl TxnReport {
    fn from_error(err: &GuardError) -> Self {
        Self {
            error_code: err.code().as_str().to_string(),
            message: err.to_string(),
            failed_op: None,
            applied: Vec::new(),
            rollback: None,
            rollback_error: None,
        }
    }
}

/// A transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Transaction {
    /// Transaction id.
    pub id: TxnId,
    /// Document.
    pub document_id: DocumentId,
    /// Fingerprint at `begin`.
    pub baseline_fingerprint: DocumentFingerprint,
    /// State.
    pub state: TxnState,
    /// Queued operations, in enqueue order.
    pub queued_ops: Vec<MutationRequest>,
    /// Begin time.
    pub created_at: Timestamp,
    /// Last begin, queue or commit.
    pub last_activity: Timestamp,
    /// Expiry while pending.
    pub expires_at: Timestamp,
    /// Idle timeout.
    pub ttl: Duration,
    /// Options.
    pub options: TxnOptions,
    /// Failure report.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub report: Option<TxnReport>,
}

/// Point-in-time view of a transaction.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TxnStatus {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Document.
    pub document_id: DocumentId,
    /// State.
    pub state: TxnState,
    /// Queued operations.
    pub queued_ops: usize,
    /// Time since `begin`.
    pub elapsed: Duration,
    /// Expiry while pending.
    pub expires_at: Timestamp,
    /// Failure report.
    pub report: Option<TxnReport>,
}

/// A successful commit.
#[derive(Debug, Clone, PartialEq)]
pub struct CommitReport {
    /// Transaction id.
    pub txn_id: TxnId,
    /// Baseline version.
    pub version_before: DocumentVersion,
    /// Version after the last operation.
    pub version_after: DocumentVersion,
    /// Pre-commit snapshot.
    pub snapshot_id: Option<SnapshotId>,
    /// One response per queued operation.
    pub responses: Vec<MutationResponse>,
}

struct CommitFailure {
    error: GuardError,
    failed_op: Option<usize>,
    applied: Vec<OpId>,
    snapshot: Option<SnapshotId>,
}

impl CommitFailure {
    fn before_apply(error: GuardError) -> Self {
        Self {
            error,
            failed_op: None,
            applied: Vec::new(),
            snapshot: None,
        }
    }
}

/// The transaction coordinator.
pub struct TransactionCoordinator {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    fence: Arc<VersionFence>,
    pipeline: Arc<MutationPipeline>,
    snapshots: Arc<SnapshotManager>,
    history: Arc<HistoryLog>,
    conflicts: Arc<ConflictManager>,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    config: TransactionConfig,
    txns: RwLock<BTreeMap<TxnId, Transaction>>,
    gate: TxnGate,
    next_id: AtomicU64,
}

impl TransactionCoordinator {
    /// Opens the coordinator and recovers persisted transactions.
    ///
    /// Pending transactions past expiry become expired. Transactions found
    /// committing were interrupted mid-commit and become failed; how much of
    /// them was applied is unknown.
    #[allow(clippy::too_many_arguments)]
    pub fn open(
        executor: Arc<dyn ActionExecutor>,
        retry: RetryPolicy,
        fence: Arc<VersionFence>,
        pipeline: Arc<MutationPipeline>,
        snapshots: Arc<SnapshotManager>,
        history: Arc<HistoryLog>,
        conflicts: Arc<ConflictManager>,
        clock: SharedClock,
        store: Arc<dyn StateStore>,
        config: TransactionConfig,
    ) -> GuardResult<Self> {
        let loaded: Vec<Transaction> = load_records(store.as_ref(), RecordKind::Transaction)?;
        let next = loaded
            .iter()
            .map(|t| t.id.as_u64())
            .max()
            .map_or(TxnId::FIRST.as_u64(), |max| max + 1);

        let coordinator = Self {
            executor,
            retry,
            fence,
            pipeline,
            snapshots,
            history,
            conflicts,
            clock,
            store,
            config,
            txns: RwLock::new(BTreeMap::new()),
            gate: TxnGate::new(),
            next_id: AtomicU64::new(next),
        };

        let now = coordinator.clock.now();
        for mut txn in loaded {
            match txn.state {
                TxnState::Committing => {
                    warn!(txn = %txn.id, document = %txn.document_id, "commit was interrupted, marking failed");
                    txn.state = TxnState::Failed;
                    txn.report.get_or_insert_with(|| TxnReport {
                        error_code: "REPLAY_FAILED".into(),
                        message: "commit interrupted; partial application unknown".into(),
                        failed_op: None,
                        applied: Vec::new(),
                        rollback: None,
                        rollback_error: None,
                    });
                    coordinator.persist(&txn)?;
                }
                TxnState::Pending if now >= txn.expires_at => {
                    txn.state = TxnState::Expired;
                    coordinator.persist(&txn)?;
                    coordinator.conflicts.drop_for_transaction(txn.id)?;
                }
                TxnState::Pending => {
                    if let Err(holder) = coordinator.gate.claim(&txn.document_id, txn.id) {
                        warn!(txn = %txn.id, %holder, "two pending transactions on one document, expiring the later");
                        txn.state = TxnState::Expired;
                        coordinator.persist(&txn)?;
                    }
                }
                _ => {}
            }
            coordinator.txns.write().insert(txn.id, txn);
        }
        Ok(coordinator)
    }

    /// Starts a transaction on a document.
    pub async fn begin(
        &self,
        document: &DocumentId,
        options: TxnOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<TxnId> {
        let id = TxnId::new(self.next_id.fetch_add(1, Ordering::SeqCst));
        if let Err(holder) = self.gate.claim(document, id) {
            // Sweep a holder that has idled out, then claim once more.
            match self.fetch(holder) {
                Ok(held) if !held.state.is_terminal() => {
                    return Err(GuardError::TransactionConflict {
                        document: document.clone(),
                        active: holder,
                    });
                }
                _ => {
                    self.gate.release(document, holder);
                }
            }
            self.gate
                .claim(document, id)
                .map_err(|active| GuardError::TransactionConflict {
                    document: document.clone(),
                    active,
                })?;
        }

        let baseline = match self.fence.current(document, None, cancel).await {
            Ok(fingerprint) => fingerprint,
            Err(err) => {
                self.gate.release(document, id);
                return Err(err);
            }
        };

        let now = self.clock.now();
        let ttl = options.ttl.unwrap_or(self.config.ttl);
        let txn = Transaction {
            id,
            document_id: document.clone(),
            baseline_fingerprint: baseline,
            state: TxnState::Pending,
            queued_ops: Vec::new(),
            created_at: now,
            last_activity: now,
            expires_at: now.saturating_add(ttl),
            ttl,
            options,
            report: None,
        };
        if let Err(err) = self.persist(&txn) {
            self.gate.release(document, id);
            return Err(err);
        }
        info!(txn = %id, %document, version = %txn.baseline_fingerprint.version, "transaction started");
        self.txns.write().insert(id, txn);
        Ok(id)
    }

    /// Queues a mutation. Only its shape is validated; nothing is applied.
    ///
    /// Returns the number of queued operations.
    pub fn queue(&self, id: TxnId, request: MutationRequest) -> GuardResult<usize> {
        let txn = self.fetch(id)?;
        Self::require_pending(&txn)?;
        if request.document_id != txn.document_id {
            return Err(GuardError::invalid_request(format!(
                "{id} is on document {} but the request targets {}",
                txn.document_id, request.document_id
            )));
        }
        if request.options.dry_run {
            return Err(GuardError::invalid_request("dry-run requests cannot be queued"));
        }
        request.validate()?;
        if txn.queued_ops.len() >= self.config.max_queued_ops {
            return Err(GuardError::invalid_request(format!(
                "{id} already holds {} queued operations",
                self.config.max_queued_ops
            )));
        }

        let mut request = request;
        if request.session.is_none() {
            request.session = txn.options.session.clone();
        }
        let now = self.clock.now();
        let updated = self.update(id, |t| {
            t.queued_ops.push(request);
            t.last_activity = now;
            t.expires_at = now.saturating_add(t.ttl);
        })?;
        debug!(txn = %id, queued = updated.queued_ops.len(), "operation queued");
        Ok(updated.queued_ops.len())
    }

    /// Applies every queued operation, or none of them.
    pub async fn commit(&self, id: TxnId, cancel: &CancellationToken) -> GuardResult<CommitReport> {
        let txn = self.fetch(id)?;
        Self::require_pending(&txn)?;

        let now = self.clock.now();
        let txn = {
            let mut txns = self.txns.write();
            let t = txns.get_mut(&id).ok_or(GuardError::TransactionNotFound(id))?;
            Self::require_pending(t)?;
            t.state = TxnState::Committing;
            t.last_activity = now;
            t.clone()
        };
        if let Err(err) = self.persist(&txn) {
            // Nothing was applied; leave the transaction committable.
            if let Some(t) = self.txns.write().get_mut(&id) {
                t.state = TxnState::Pending;
            }
            warn!(txn = %id, error = %err, "could not persist commit start");
            return Err(err);
        }
        info!(txn = %id, document = %txn.document_id, ops = txn.queued_ops.len(), "commit started");

        match self.apply_all(&txn, cancel).await {
            Ok(report) => {
                let done = self.update(id, |t| t.state = TxnState::Committed)?;
                self.finish(&done)?;
                info!(txn = %id, version = %report.version_after, "transaction committed");
                Ok(report)
            }
            Err(failure) => Err(self.fail_commit(&txn, failure).await),
        }
    }

    async fn apply_all(
        &self,
        txn: &Transaction,
        cancel: &CancellationToken,
    ) -> Result<CommitReport, CommitFailure> {
        let document = &txn.document_id;
        let baseline = &txn.baseline_fingerprint;

        let mut expected = ExpectedState::default().with_checksum(baseline.checksum, None);
        if self.executor.monotonic_versions() {
            expected.version = Some(baseline.version);
        }
        self.fence
            .check(document, &expected, cancel)
            .await
            .map_err(CommitFailure::before_apply)?;

        for (index, request) in txn.queued_ops.iter().enumerate() {
            if let Err(error) = self.pipeline.preflight(request, baseline) {
                return Err(CommitFailure {
                    failed_op: Some(index),
                    ..CommitFailure::before_apply(error)
                });
            }
        }

        let snapshot = if txn.options.skip_snapshot {
            None
        } else {
            let name = format!("before {}", txn.id);
            let snapshot = self
                .snapshots
                .create(document, Some(&name), true, cancel)
                .await
                .map_err(CommitFailure::before_apply)?;
            Some(snapshot.id)
        };

        let mut applied = Vec::with_capacity(txn.queued_ops.len());
        let mut responses = Vec::with_capacity(txn.queued_ops.len());
        for (index, request) in txn.queued_ops.iter().enumerate() {
            match self
                .pipeline
                .execute_tracked(request, Stage::commit(txn.id), cancel)
                .await
            {
                Ok(MutationOutcome::Applied(response)) => {
                    applied.push(response.summary.op_id);
                    responses.push(*response);
                }
                Ok(MutationOutcome::DryRun(_)) => {}
                Err(ExecuteFailure { error, landed }) => {
                    applied.extend(landed);
                    return Err(CommitFailure {
                        error,
                        failed_op: Some(index),
                        applied,
                        snapshot,
                    });
                }
            }
        }

        Ok(CommitReport {
            txn_id: txn.id,
            version_before: baseline.version,
            version_after: responses
                .last()
                .map_or(baseline.version, |r| r.summary.version_after),
            snapshot_id: snapshot,
            responses,
        })
    }

    /// Undoes a failed commit and records why it failed. Returns the error
    /// the caller sees.
    async fn fail_commit(&self, txn: &Transaction, failure: CommitFailure) -> GuardError {
        let CommitFailure {
            error,
            failed_op,
            applied,
            snapshot,
        } = failure;
        warn!(
            txn = %txn.id,
            document = %txn.document_id,
            failed_op = ?failed_op,
            applied = applied.len(),
            error = %error,
            "commit failed, rolling back"
        );

        // Rollback runs to completion even when the commit was cancelled.
        let rollback_cancel = CancellationToken::new();
        let rollback = match snapshot {
            Some(snapshot_id) => self
                .snapshots
                .restore(
                    snapshot_id,
                    RestoreOptions::forced().for_txn(txn.id),
                    &rollback_cancel,
                )
                .await
                .map(|_| RollbackPath::Snapshot { snapshot_id }),
            None if applied.is_empty() => Ok(RollbackPath::Nothing),
            None => self
                .replay_inverses(&txn.document_id, &applied, &rollback_cancel)
                .await
                .map(|count| RollbackPath::Inverses { count }),
        };

        let mut report = TxnReport::from_error(&error);
        report.failed_op = failed_op;
        report.applied = applied.clone();

        match rollback {
            Ok(path) => {
                if let Err(err) = self.history.supersede(&txn.document_id, &applied) {
                    warn!(txn = %txn.id, error = %err, "could not mark rolled back history");
                }
                report.rollback = Some(path);
                match self.update(txn.id, |t| {
                    t.state = TxnState::RolledBack;
                    t.report = Some(report);
                }) {
                    Ok(done) => {
                        if let Err(err) = self.finish(&done) {
                            warn!(txn = %txn.id, error = %err, "could not release transaction");
                        }
                    }
                    Err(err) => warn!(txn = %txn.id, error = %err, "could not persist rollback"),
                }
                info!(txn = %txn.id, "transaction rolled back");
                error
            }
            Err(rollback_err) => {
                error!(
                    txn = %txn.id,
                    document = %txn.document_id,
                    error = %rollback_err,
                    "rollback failed, document needs an operator"
                );
                report.rollback_error = Some(rollback_err.to_string());
                match self.update(txn.id, |t| {
                    t.state = TxnState::Failed;
                    t.report = Some(report);
                }) {
                    Ok(done) => {
                        if let Err(err) = self.finish(&done) {
                            warn!(txn = %txn.id, error = %err, "could not release transaction");
                        }
                    }
                    Err(err) => warn!(txn = %txn.id, error = %err, "could not persist failure"),
                }
                GuardError::RollbackFailed {
                    txn_id: txn.id,
                    cause: error.to_string(),
                    reason: rollback_err.to_string(),
                }
            }
        }
    }

    async fn replay_inverses(
        &self,
        document: &DocumentId,
        applied: &[OpId],
        cancel: &CancellationToken,
    ) -> GuardResult<usize> {
        for op_id in applied.iter().rev() {
            let entry = self
                .history
                .get(document, *op_id)
                .ok_or(GuardError::OperationNotFound(*op_id))?;
            let inverse = entry.inverse.as_ref().ok_or_else(|| GuardError::ReplayFailed {
                op_id: *op_id,
                reason: "operation captured no inverse".into(),
            })?;
            let key = IdempotencyKey::for_inverse(document, *op_id, entry.generation, inverse);
            let result = apply_inverse_idempotent(
                &self.executor,
                &self.retry,
                document,
                inverse,
                key,
                cancel,
            )
            .await?;
            self.fence.record_head(document, result.fingerprint.version);
        }
        Ok(applied.len())
    }

    /// Abandons a pending transaction.
    pub fn rollback(&self, id: TxnId) -> GuardResult<TxnStatus> {
        let txn = self.fetch(id)?;
        Self::require_pending(&txn)?;
        let done = self.update(id, |t| t.state = TxnState::RolledBack)?;
        self.finish(&done)?;
        info!(txn = %id, document = %done.document_id, "transaction abandoned");
        Ok(self.status_of(&done))
    }

    /// Reports a transaction's state.
    pub fn status(&self, id: TxnId) -> GuardResult<TxnStatus> {
        let txn = self.fetch(id)?;
        Ok(self.status_of(&txn))
    }

    /// Transactions, optionally for one document, in id order.
    #[must_use]
    pub fn list(&self, document: Option<&DocumentId>) -> Vec<Transaction> {
        self.txns
            .read()
            .values()
            .filter(|t| document.map_or(true, |d| t.document_id == *d))
            .cloned()
            .collect()
    }

    /// The non-terminal transaction holding a document.
    pub fn active(&self, document: &DocumentId) -> Option<TxnId> {
        let holder = self.gate.holder(document)?;
        match self.fetch(holder) {
            Ok(txn) if !txn.state.is_terminal() => Some(holder),
            _ => None,
        }
    }

    /// Expires every pending transaction idle past its TTL.
    pub fn expire_idle(&self) -> GuardResult<Vec<TxnId>> {
        let now = self.clock.now();
        let idle: Vec<TxnId> = self
            .txns
            .read()
            .values()
            .filter(|t| t.state == TxnState::Pending && now >= t.expires_at)
            .map(|t| t.id)
            .collect();
        for id in &idle {
            self.expire(*id, None)?;
        }
        Ok(idle)
    }

    /// Runs [`expire_idle`](Self::expire_idle) on the configured interval
    /// until `shutdown` fires or the coordinator is dropped.
    pub fn spawn_reaper(self: &Arc<Self>, shutdown: CancellationToken) -> Option<JoinHandle<()>> {
        let interval = self.config.reaper_interval?;
        let weak = Arc::downgrade(self);
        Some(tokio::spawn(async move {
            let mut ticker = tokio::time::interval(interval);
            ticker.tick().await;
            loop {
                tokio::select! {
                    _ = shutdown.cancelled() => break,
                    _ = ticker.tick() => {}
                }
                let Some(coordinator) = weak.upgrade() else {
                    break;
                };
                match coordinator.expire_idle() {
                    Ok(expired) if !expired.is_empty() => {
                        debug!(count = expired.len(), "reaper expired idle transactions");
                    }
                    Ok(_) => {}
                    Err(err) => warn!(error = %err, "transaction reaper failed"),
                }
            }
        }))
    }

    fn require_pending(txn: &Transaction) -> GuardResult<()> {
        match txn.state {
            TxnState::Pending => Ok(()),
            TxnState::Expired => Err(GuardError::TransactionExpired { txn_id: txn.id }),
            other => Err(GuardError::InvalidTransactionState {
                txn_id: txn.id,
                current: other.to_string(),
                expected: "pending",
            }),
        }
    }

    /// Reads a transaction, expiring it first if it idled out.
    fn fetch(&self, id: TxnId) -> GuardResult<Transaction> {
        let txn = self
            .txns
            .read()
            .get(&id)
            .cloned()
            .ok_or(GuardError::TransactionNotFound(id))?;
        if txn.state == TxnState::Pending && self.clock.now() >= txn.expires_at {
            return self.expire(id, None);
        }
        Ok(txn)
    }

    fn expire(&self, id: TxnId, reason: Option<String>) -> GuardResult<Transaction> {
        let txn = {
            let mut txns = self.txns.write();
            let t = txns.get_mut(&id).ok_or(GuardError::TransactionNotFound(id))?;
            if t.state != TxnState::Pending {
                return Ok(t.clone());
            }
            t.state = TxnState::Expired;
            if let Some(message) = reason {
                t.report = Some(TxnReport {
                    message,
                    ..TxnReport::from_error(&GuardError::TransactionExpired { txn_id: id })
                });
            }
            t.clone()
        };
        self.persist(&txn)?;
        self.finish(&txn)?;
        info!(txn = %id, document = %txn.document_id, "transaction expired");
        Ok(txn)
    }

    /// Releases the gate and drops conflicts of an ended transaction.
    fn finish(&self, txn: &Transaction) -> GuardResult<()> {
        self.gate.release(&txn.document_id, txn.id);
        if txn.state != TxnState::Committed {
            self.conflicts.drop_for_transaction(txn.id)?;
        }
        Ok(())
    }

    fn update(&self, id: TxnId, f: impl FnOnce(&mut Transaction)) -> GuardResult<Transaction> {
        let txn = {
            let mut txns = self.txns.write();
            let t = txns.get_mut(&id).ok_or(GuardError::TransactionNotFound(id))?;
            f(t);
            t.clone()
        };
        self.persist(&txn)?;
        Ok(txn)
    }

    fn persist(&self, txn: &Transaction) -> GuardResult<()> {
        put_record(
            self.store.as_ref(),
            RecordKind::Transaction,
            &txn.id.as_u64().to_string(),
            txn,
        )?;
        Ok(())
    }

    fn status_of(&self, txn: &Transaction) -> TxnStatus {
        TxnStatus {
            txn_id: txn.id,
            document_id: txn.document_id.clone(),
            state: txn.state,
            queued_ops: txn.queued_ops.len(),
            elapsed: self.clock.now().duration_since(txn.created_at),
            expires_at: txn.expires_at,
            report: txn.report.clone(),
        }
    }
}

/// Expires overdue pending transactions directly in a store, for use while
/// no coordinator has the store open. Also discards their open conflicts.
pub fn expire_stored(store: &dyn StateStore, now: Timestamp) -> GuardResult<Vec<TxnId>> {
    let txns: Vec<Transaction> = load_records(store, RecordKind::Transaction)?;
    let mut expired = Vec::new();
    for mut txn in txns {
        if txn.state != TxnState::Pending || now < txn.expires_at {
            continue;
        }
        txn.state = TxnState::Expired;
        put_record(store, RecordKind::Transaction, &txn.id.as_u64().to_string(), &txn)?;
        expired.push(txn.id);
    }
    if !expired.is_empty() {
        let conflicts: Vec<Conflict> = load_records(store, RecordKind::Conflict)?;
        for conflict in conflicts {
            if conflict.transaction.map_or(false, |t| expired.contains(&t)) {
                store.delete(RecordKind::Conflict, &conflict.id.as_u64().to_string())?;
            }
        }
    }
    Ok(expired)
}

impl TxnHolder for TransactionCoordinator {
    fn holder(&self, document: &DocumentId) -> Option<(TxnId, TxnState)> {
        let id = self.active(document)?;
        self.fetch(id).ok().map(|t| (id, t.state))
    }
}

impl RestoreObserver for TransactionCoordinator {
    fn snapshot_restored(&self, document: &DocumentId, snapshot: SnapshotId) {
        let pending: Vec<TxnId> = self
            .txns
            .read()
            .values()
            .filter(|t| t.document_id == *document && t.state == TxnState::Pending)
            .map(|t| t.id)
            .collect();
        for id in pending {
            let reason = format!("{snapshot} was restored over the transaction's baseline");
            if let Err(err) = self.expire(id, Some(reason)) {
                warn!(txn = %id, error = %err, "could not invalidate transaction after restore");
            }
        }
    }
}

impl fmt::Debug for TransactionCoordinator {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TransactionCoordinator")
            .field("transactions", &self.txns.read().len())
            .field("active", &self.gate.len())
            .field("config", &self.config)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::sync::atomic::AtomicBool;

    use sheetguard_common::clock::{Clock, ManualClock};
    use sheetguard_common::config::GuardConfig;
    use sheetguard_common::error::ExecutorError;
    use sheetguard_common::types::{A1Range, CellGrid};
    use sheetguard_common::ErrorCode;
    use sheetguard_executor::{
        actions, EffectShape, ExecCall, ExecFuture, ExecutorResult, InverseOp, MemoryExecutor,
        OpDescriptor, SnapshotHandle,
    };

    use crate::guard::SheetGuard;
    use crate::history::ReplayOptions;
    use crate::store::MemoryStore;

    struct Fixture {
        exec: Arc<MemoryExecutor>,
        clock: Arc<ManualClock>,
        memory: Arc<MemoryStore>,
        store: Arc<dyn StateStore>,
        guard: SheetGuard,
        doc: DocumentId,
    }

    fn fixture() -> Fixture {
        let exec = MemoryExecutor::shared();
        let doc = DocumentId::new("S1");
        exec.add_document(&doc, &[("Sheet1", 10, 5)]);
        let clock = ManualClock::shared(1_000);
        let memory = Arc::new(MemoryStore::new());
        let store: Arc<dyn StateStore> = memory.clone();
        let guard = open(&exec, &clock, &store);
        Fixture {
            exec,
            clock,
            memory,
            store,
            guard,
            doc,
        }
    }

    /// Delegates to a [`MemoryExecutor`], failing the first cell read that
    /// follows a successful mutation.
    struct ReadFailsAfterWrite {
        inner: Arc<MemoryExecutor>,
        armed: AtomicBool,
    }

    impl ActionExecutor for ReadFailsAfterWrite {
        fn fetch_fingerprint<'a>(
            &'a self,
            document: &'a DocumentId,
            range: Option<&'a A1Range>,
        ) -> ExecFuture<'a, DocumentFingerprint> {
            self.inner.fetch_fingerprint(document, range)
        }

        fn read_range<'a>(&'a self, document: &'a DocumentId, range: &'a A1Range) -> ExecFuture<'a, CellGrid> {
            if self.armed.swap(false, Ordering::SeqCst) {
                return Box::pin(async { Err(ExecutorError::PermissionDenied("read revoked".into())) });
            }
            self.inner.read_range(document, range)
        }

        fn apply_mutation<'a>(
            &'a self,
            document: &'a DocumentId,
            op: &'a OpDescriptor,
            key: IdempotencyKey,
        ) -> ExecFuture<'a, ExecutorResult> {
            Box::pin(async move {
                let result = self.inner.apply_mutation(document, op, key).await;
                if result.is_ok() {
                    self.armed.store(true, Ordering::SeqCst);
                }
                result
            })
        }

        fn write_cells<'a>(
            &'a self,
            document: &'a DocumentId,
            cells: &'a CellGrid,
            key: IdempotencyKey,
        ) -> ExecFuture<'a, ExecutorResult> {
            self.inner.write_cells(document, cells, key)
        }

        fn apply_inverse<'a>(
            &'a self,
            document: &'a DocumentId,
            inverse: &'a InverseOp,
            key: IdempotencyKey,
        ) -> ExecFuture<'a, ExecutorResult> {
            self.inner.apply_inverse(document, inverse, key)
        }

        fn find_applied<'a>(
            &'a self,
            document: &'a DocumentId,
            key: IdempotencyKey,
        ) -> ExecFuture<'a, Option<ExecutorResult>> {
            self.inner.find_applied(document, key)
        }

        fn create_snapshot<'a>(&'a self, document: &'a DocumentId) -> ExecFuture<'a, SnapshotHandle> {
            self.inner.create_snapshot(document)
        }

        fn restore_snapshot<'a>(
            &'a self,
            document: &'a DocumentId,
            handle: &'a SnapshotHandle,
        ) -> ExecFuture<'a, DocumentFingerprint> {
            self.inner.restore_snapshot(document, handle)
        }

        fn delete_snapshot<'a>(&'a self, handle: &'a SnapshotHandle) -> ExecFuture<'a, ()> {
            self.inner.delete_snapshot(handle)
        }
    }

    fn open(exec: &Arc<MemoryExecutor>, clock: &Arc<ManualClock>, store: &Arc<dyn StateStore>) -> SheetGuard {
        SheetGuard::builder()
            .executor(exec.clone())
            .config(GuardConfig::for_testing())
            .clock(clock.clone())
            .store(store.clone())
            .build()
            .unwrap()
    }

    fn write(at: &str, value: serde_json::Value) -> MutationRequest {
        MutationRequest::new("S1", actions::write_range(at.parse().unwrap(), vec![vec![value]]))
    }

    fn unsupported(at: &str) -> MutationRequest {
        MutationRequest::new(
            "S1",
            OpDescriptor::new("explode", EffectShape::Range { range: at.parse().unwrap() }),
        )
    }

    #[tokio::test]
    async fn test_begin_conflicts_until_released() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();

        let err = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionConflict);

        let status = f.guard.rollback(txn).unwrap();
        assert_eq!(status.state, TxnState::RolledBack);
        assert!(f.guard.transactions().active(&f.doc).is_none());
        assert!(f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_begin_fails_for_missing_document() {
        let f = fixture();
        let missing = DocumentId::new("nope");
        let err = f
            .guard
            .begin_transaction(&missing, TxnOptions::default(), &CancellationToken::new())
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutorFailed);
        assert!(f.guard.transactions().active(&missing).is_none());
    }

    #[tokio::test]
    async fn test_queue_checks_shape_only() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.exec.reset_counters();

        assert_eq!(f.guard.queue(txn, write("Sheet1!A1", json!(1))).unwrap(), 1);
        assert_eq!(f.guard.queue(txn, unsupported("Sheet1!B1")).unwrap(), 2);
        assert_eq!(f.exec.total_calls(), 0);

        let other = MutationRequest::new(
            "S2",
            actions::write_range("Sheet1!A1".parse().unwrap(), vec![vec![json!(1)]]),
        );
        assert_eq!(f.guard.queue(txn, other).unwrap_err().code(), ErrorCode::InvalidRequest);
        let dry = write("Sheet1!A1", json!(1)).dry_run();
        assert_eq!(f.guard.queue(txn, dry).unwrap_err().code(), ErrorCode::InvalidRequest);
        assert_eq!(f.guard.status(txn).unwrap().queued_ops, 2);
    }

    #[tokio::test]
    async fn test_commit_applies_in_order() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!(1))).unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!(2))).unwrap();

        let report = f.guard.commit(txn, &cancel).await.unwrap();
        assert_eq!(report.responses.len(), 2);
        assert!(report.snapshot_id.is_some());
        assert!(report.version_after > report.version_before);
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "2");
        assert_eq!(f.guard.status(txn).unwrap().state, TxnState::Committed);
        assert!(f.guard.transactions().active(&f.doc).is_none());

        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::InvalidTransactionState);
    }

    #[tokio::test]
    async fn test_failed_commit_restores_snapshot() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let before = f.exec.checksum(&f.doc).unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!("x"))).unwrap();
        f.guard.queue(txn, unsupported("Sheet1!B1")).unwrap();

        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::ExecutorFailed);
        assert_eq!(f.exec.checksum(&f.doc).unwrap(), before);

        let status = f.guard.status(txn).unwrap();
        assert_eq!(status.state, TxnState::RolledBack);
        let report = status.report.unwrap();
        assert_eq!(report.failed_op, Some(1));
        assert_eq!(report.applied.len(), 1);
        assert!(matches!(report.rollback, Some(RollbackPath::Snapshot { .. })));

        let entry = f.guard.history().get(&f.doc, report.applied[0]).unwrap();
        assert_eq!(entry.status, crate::history::EntryStatus::Superseded);
    }

    #[tokio::test]
    async fn test_failed_commit_replays_inverses_without_snapshot() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let before = f.exec.checksum(&f.doc).unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default().skip_snapshot(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!("x"))).unwrap();
        f.guard.queue(txn, write("Sheet1!B2", json!("y"))).unwrap();
        f.guard.queue(txn, unsupported("Sheet1!C1")).unwrap();

        f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(f.exec.checksum(&f.doc).unwrap(), before);
        assert_eq!(f.exec.call_count(ExecCall::CreateSnapshot), 0);
        assert_eq!(f.exec.call_count(ExecCall::ApplyInverse), 2);

        let report = f.guard.status(txn).unwrap().report.unwrap();
        assert_eq!(report.rollback, Some(RollbackPath::Inverses { count: 2 }));
    }

    #[tokio::test]
    async fn test_capture_failure_after_write_keeps_the_write_recorded() {
        let inner = MemoryExecutor::shared();
        let doc = DocumentId::new("S1");
        inner.add_document(&doc, &[("Sheet1", 10, 5)]);
        let exec = Arc::new(ReadFailsAfterWrite {
            inner: inner.clone(),
            armed: AtomicBool::new(false),
        });
        let guard = SheetGuard::builder()
            .executor(exec)
            .config(GuardConfig::for_testing())
            .clock(ManualClock::shared(1_000))
            .build()
            .unwrap();
        let cancel = CancellationToken::new();
        let txn = guard
            .begin_transaction(&doc, TxnOptions::default().skip_snapshot(), &cancel)
            .await
            .unwrap();
        guard.queue(txn, write("Sheet1!A1", json!("x"))).unwrap();

        let report = guard.commit(txn, &cancel).await.unwrap();
        assert_eq!(inner.cell_text(&doc, "Sheet1!A1").unwrap(), "x");
        let response = &report.responses[0];
        assert_eq!(response.diff.kind(), crate::diff::TierKind::Metadata);

        let entry = guard.history().get(&doc, response.summary.op_id).unwrap();
        assert_eq!(entry.status, crate::history::EntryStatus::Applied);
        assert!(entry.is_reversible());
    }

    #[tokio::test]
    async fn test_write_landed_before_history_failure_is_rolled_back() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let before = f.exec.checksum(&f.doc).unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default().skip_snapshot(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!("x"))).unwrap();
        f.memory.fail_next_put(RecordKind::History, 1);

        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageFailed);
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "");
        assert_eq!(f.exec.checksum(&f.doc).unwrap(), before);

        let status = f.guard.status(txn).unwrap();
        assert_eq!(status.state, TxnState::RolledBack);
        let report = status.report.unwrap();
        assert_eq!(report.failed_op, Some(0));
        assert_eq!(report.applied.len(), 1);
        assert_eq!(report.rollback, Some(RollbackPath::Inverses { count: 1 }));
    }

    #[tokio::test]
    async fn test_lost_inverse_response_is_not_replayed_twice() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default().skip_snapshot(), &cancel)
            .await
            .unwrap();
        f.guard
            .queue(txn, MutationRequest::new("S1", actions::insert_rows(Some("Sheet1"), 2, 2)))
            .unwrap();
        f.guard.queue(txn, unsupported("Sheet1!A1")).unwrap();
        f.exec.lose_next_response(ExecCall::ApplyInverse);

        f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(f.exec.call_count(ExecCall::ApplyInverse), 1);
        assert_eq!(f.exec.row_count(&f.doc, Some("Sheet1")).unwrap(), 10);
        assert_eq!(f.guard.status(txn).unwrap().state, TxnState::RolledBack);
    }

    #[tokio::test]
    async fn test_commit_start_persist_failure_leaves_transaction_pending() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!("x"))).unwrap();
        f.memory.fail_next_put(RecordKind::Transaction, 1);

        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::StorageFailed);
        assert_eq!(f.guard.status(txn).unwrap().state, TxnState::Pending);
        assert_eq!(f.exec.mutating_calls(), 0);

        f.guard.commit(txn, &cancel).await.unwrap();
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "x");
        assert!(f.guard.transactions().active(&f.doc).is_none());
    }

    #[tokio::test]
    async fn test_history_replay_refused_while_transaction_holds_document() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let request = write("Sheet1!A1", json!("a"));
        f.guard.guarded_mutate(request, &cancel).await.unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();

        let history = f.guard.history();
        let err = history.undo(&f.doc, ReplayOptions::default(), &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionConflict);
        let err = history.redo(&f.doc, ReplayOptions::forced(), &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionConflict);
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "a");

        f.guard.rollback(txn).unwrap();
        history.undo(&f.doc, ReplayOptions::default(), &cancel).await.unwrap();
        assert_eq!(f.exec.cell_text(&f.doc, "Sheet1!A1").unwrap(), "");
    }

    #[tokio::test]
    async fn test_restore_refused_while_another_transaction_commits() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let snapshot = f
            .guard
            .snapshots()
            .create(&f.doc, None, false, &cancel)
            .await
            .unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.guard
            .transactions()
            .update(txn, |t| t.state = TxnState::Committing)
            .unwrap();

        let err = f
            .guard
            .snapshots()
            .restore(snapshot.id, RestoreOptions::forced(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionConflict);

        f.guard
            .snapshots()
            .restore(snapshot.id, RestoreOptions::forced().for_txn(txn), &cancel)
            .await
            .unwrap();
        assert_eq!(f.guard.status(txn).unwrap().state, TxnState::Committing);
    }

    #[tokio::test]
    async fn test_commit_fails_when_baseline_moved() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        f.guard.queue(txn, write("Sheet1!A1", json!(1))).unwrap();
        f.exec
            .external_write(&f.doc, &"Sheet1!C3".parse().unwrap(), &[vec![json!("ext")]])
            .unwrap();
        f.exec.reset_counters();

        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::PreconditionFailed);
        assert_eq!(f.exec.mutating_calls(), 0);
        let report = f.guard.status(txn).unwrap().report.unwrap();
        assert!(report.applied.is_empty());
        assert_eq!(report.rollback, Some(RollbackPath::Nothing));
    }

    #[tokio::test]
    async fn test_idle_transaction_expires() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(
                &f.doc,
                TxnOptions::default().with_ttl(Duration::from_secs(60)),
                &cancel,
            )
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(30));
        f.guard.queue(txn, write("Sheet1!A1", json!(1))).unwrap();
        f.clock.advance(Duration::from_secs(45));
        assert_eq!(f.guard.status(txn).unwrap().state, TxnState::Pending);

        f.clock.advance(Duration::from_secs(20));
        assert_eq!(f.guard.expire_idle_transactions().unwrap(), vec![txn]);
        let err = f.guard.commit(txn, &cancel).await.unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionExpired);
        assert!(f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .is_ok());
    }

    #[tokio::test]
    async fn test_begin_sweeps_expired_holder() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let stale = f
            .guard
            .begin_transaction(
                &f.doc,
                TxnOptions::default().with_ttl(Duration::from_secs(1)),
                &cancel,
            )
            .await
            .unwrap();
        f.clock.advance(Duration::from_secs(2));

        let fresh = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        assert_ne!(fresh, stale);
        assert_eq!(f.guard.status(stale).unwrap().state, TxnState::Expired);
        assert_eq!(f.guard.transactions().active(&f.doc), Some(fresh));
    }

    #[tokio::test]
    async fn test_restore_expires_pending_transaction() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let snapshot = f
            .guard
            .snapshots()
            .create(&f.doc, Some("manual"), false, &cancel)
            .await
            .unwrap();
        let txn = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();

        f.guard
            .snapshots()
            .restore(snapshot.id, RestoreOptions::forced(), &cancel)
            .await
            .unwrap();

        let status = f.guard.status(txn).unwrap();
        assert_eq!(status.state, TxnState::Expired);
        assert!(status.report.unwrap().message.contains(&snapshot.id.to_string()));
        assert!(f.guard.transactions().active(&f.doc).is_none());
    }

    #[tokio::test]
    async fn test_reopen_recovers_transactions() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let live = f
            .guard
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        let other = DocumentId::new("S2");
        f.exec.add_document(&other, &[("Sheet1", 5, 5)]);
        let interrupted = f
            .guard
            .begin_transaction(&other, TxnOptions::default(), &cancel)
            .await
            .unwrap();

        let mut record: Transaction = load_records::<Transaction>(f.store.as_ref(), RecordKind::Transaction)
            .unwrap()
            .into_iter()
            .find(|t| t.id == interrupted)
            .unwrap();
        record.state = TxnState::Committing;
        put_record(f.store.as_ref(), RecordKind::Transaction, &interrupted.as_u64().to_string(), &record).unwrap();
        drop(f.guard);

        let reopened = open(&f.exec, &f.clock, &f.store);
        assert_eq!(reopened.status(interrupted).unwrap().state, TxnState::Failed);
        assert_eq!(reopened.status(live).unwrap().state, TxnState::Pending);
        let err = reopened
            .begin_transaction(&f.doc, TxnOptions::default(), &cancel)
            .await
            .unwrap_err();
        assert_eq!(err.code(), ErrorCode::TransactionConflict);

        let next = reopened
            .begin_transaction(&other, TxnOptions::default(), &cancel)
            .await
            .unwrap();
        assert!(next > interrupted);
    }

    #[tokio::test]
    async fn test_expire_stored_marks_overdue_records() {
        let f = fixture();
        let cancel = CancellationToken::new();
        let txn = f
            .guard
            .begin_transaction(
                &f.doc,
                TxnOptions::default().with_ttl(Duration::from_secs(10)),
                &cancel,
            )
            .await
            .unwrap();
        drop(f.guard);

        let soon = f.clock.now().saturating_add(Duration::from_secs(5));
        assert!(expire_stored(f.store.as_ref(), soon).unwrap().is_empty());
        let later = f.clock.now().saturating_add(Duration::from_secs(11));
        assert_eq!(expire_stored(f.store.as_ref(), later).unwrap(), vec![txn]);

        let reopened = open(&f.exec, &f.clock, &f.store);
        assert_eq!(reopened.status(txn).unwrap().state, TxnState::Expired);
        assert!(reopened.transactions().active(&f.doc).is_none());
    }
}
