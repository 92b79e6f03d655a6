//! The SheetGuard facade.
//!
//! Wires the fence, scope guard, snapshot manager, diff engine, conflict
//! manager, transaction coordinator and history log around one
//! [`ActionExecutor`], and exposes the operations callers use.

use std::fmt;
use std::sync::Arc;

use parking_lot::Mutex;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;
use tracing::info;

use sheetguard_common::clock::{system_clock, SharedClock};
use sheetguard_common::config::GuardConfig;
use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{A1Range, ConflictId, DocumentFingerprint, DocumentId, TxnId};
use sheetguard_executor::{ActionExecutor, RetryPolicy};

use crate::conflict::{
    Conflict, ConflictManager, ConflictPolicy, ConflictQuery, DefaultConflictPolicy,
    Resolution, ResolutionStrategy, WriteLedger,
};
use crate::fence::VersionFence;
use crate::history::HistoryLog;
use crate::pipeline::{MutationPipeline, Stage};
use crate::request::{DryRunReport, MutationOutcome, MutationRequest};
use crate::snapshot::{RestoreObserver, SnapshotManager};
use crate::store::{FileStore, MemoryStore, StateStore};
use crate::txn::{CommitReport, TransactionCoordinator, TxnHolder, TxnOptions, TxnStatus};

/// Builder for [`SheetGuard`].
#[derive(Default)]
pub struct SheetGuardBuilder {
    executor: Option<Arc<dyn ActionExecutor>>,
    config: GuardConfig,
    clock: Option<SharedClock>,
    store: Option<Arc<dyn StateStore>>,
    policy: Option<Arc<dyn ConflictPolicy>>,
}

impl SheetGuardBuilder {
    /// Sets the executor. Required.
    #[must_use]
    pub fn executor(mut self, executor: Arc<dyn ActionExecutor>) -> Self {
        self.executor = Some(executor);
        self
    }

    /// Sets the configuration.
    #[must_use]
    pub fn config(mut self, config: GuardConfig) -> Self {
        self.config = config;
        self
    }

    /// Sets the clock. Defaults to the system clock.
    #[must_use]
    pub fn clock(mut self, clock: SharedClock) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Sets the state store. Defaults to a [`FileStore`] under `data_dir`
    /// when one is configured, else a [`MemoryStore`].
    #[must_use]
    pub fn store(mut self, store: Arc<dyn StateStore>) -> Self {
        self.store = Some(store);
        self
    }

    /// Sets the conflict policy.
    #[must_use]
    pub fn conflict_policy(mut self, policy: Arc<dyn ConflictPolicy>) -> Self {
        self.policy = Some(policy);
        self
    }

    /// Validates the configuration, opens the store and recovers state.
    pub fn build(self) -> GuardResult<SheetGuard> {
        let config = self.config;
        config.validate()?;
        let executor = self.executor.ok_or_else(|| GuardError::InvalidConfig {
            message: "an action executor is required".into(),
        })?;
        let clock = self.clock.unwrap_or_else(system_clock);
        let store: Arc<dyn StateStore> = match (self.store, &config.data_dir) {
            (Some(store), _) => store,
            (None, Some(dir)) => Arc::new(FileStore::open(dir)?),
            (None, None) => Arc::new(MemoryStore::new()),
        };
        let policy = self.policy.unwrap_or_else(|| Arc::new(DefaultConflictPolicy));
        let retry = RetryPolicy::from_config(&config.retry);

        let fence = Arc::new(VersionFence::new(executor.clone(), retry.clone()));
        let snapshots = Arc::new(SnapshotManager::open(
            executor.clone(),
            retry.clone(),
            fence.clone(),
            clock.clone(),
            store.clone(),
            config.snapshot.clone(),
        )?);
        let history = Arc::new(HistoryLog::open(
            executor.clone(),
            retry.clone(),
            fence.clone(),
            snapshots.clone(),
            store.clone(),
            &config.history,
        )?);
        let ledger = Arc::new(WriteLedger::open(
            store.clone(),
            config.conflict.ledger_capacity,
        )?);
        let conflicts = Arc::new(ConflictManager::open(
            executor.clone(),
            retry.clone(),
            fence.clone(),
            ledger.clone(),
            policy,
            clock.clone(),
            store.clone(),
            config.scope.max_cells_affected,
        )?);
        let pipeline = Arc::new(MutationPipeline::new(
            executor.clone(),
            retry.clone(),
            fence.clone(),
            snapshots.clone(),
            history.clone(),
            ledger,
            clock.clone(),
            &config,
        ));
        let transactions = Arc::new(TransactionCoordinator::open(
            executor.clone(),
            retry,
            fence.clone(),
            pipeline.clone(),
            snapshots.clone(),
            history.clone(),
            conflicts.clone(),
            clock,
            store,
            config.transaction.clone(),
        )?);

        let observer: Arc<dyn RestoreObserver> = transactions.clone();
        snapshots.set_observer(Arc::downgrade(&observer));
        let holder: Arc<dyn TxnHolder> = transactions.clone();
        snapshots.link_transactions(Arc::downgrade(&holder));
        history.link_transactions(Arc::downgrade(&holder));
        conflicts.link_transactions(Arc::downgrade(&holder));

        info!(
            persistent = config.data_dir.is_some(),
            monotonic = executor.monotonic_versions(),
            "sheetguard opened"
        );
        Ok(SheetGuard {
            config,
            fence,
            pipeline,
            snapshots,
            history,
            conflicts,
            transactions,
            shutdown: CancellationToken::new(),
            reaper: Mutex::new(None),
        })
    }
}

impl fmt::Debug for SheetGuardBuilder {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetGuardBuilder")
            .field("executor", &self.executor.is_some())
            .field("config", &self.config)
            .field("store", &self.store.is_some())
            .finish()
    }
}

/// The safety layer in front of one document store.
pub struct SheetGuard {
    config: GuardConfig,
    fence: Arc<VersionFence>,
    pipeline: Arc<MutationPipeline>,
    snapshots: Arc<SnapshotManager>,
    history: Arc<HistoryLog>,
    conflicts: Arc<ConflictManager>,
    transactions: Arc<TransactionCoordinator>,
    shutdown: CancellationToken,
    reaper: Mutex<Option<JoinHandle<()>>>,
}

impl SheetGuard {
    /// Creates a builder.
    #[must_use]
    pub fn builder() -> SheetGuardBuilder {
        SheetGuardBuilder::default()
    }

    /// The configuration.
    #[must_use]
    pub fn config(&self) -> &GuardConfig {
        &self.config
    }

    // =========================================================================
    // Mutations
    // =========================================================================

    /// Runs one mutation through the full pipeline.
    ///
    /// Rejected with `TRANSACTION_CONFLICT` while a transaction holds the
    /// document; dry runs are always allowed.
    pub async fn guarded_mutate(
        &self,
        request: MutationRequest,
        cancel: &CancellationToken,
    ) -> GuardResult<MutationOutcome> {
        if !request.options.dry_run {
            if let Some(active) = self.transactions.active(&request.document_id) {
                return Err(GuardError::TransactionConflict {
                    document: request.document_id.clone(),
                    active,
                });
            }
        }
        self.pipeline
            .execute(&request, Stage::standalone(), cancel)
            .await
    }

    /// Sizes a request without calling the executor.
    pub fn dry_run(&self, request: &MutationRequest) -> GuardResult<DryRunReport> {
        self.pipeline.dry_run(request)
    }

    /// Reads the live fingerprint, optionally checksummed over a range.
    pub async fn fingerprint(
        &self,
        document: &DocumentId,
        range: Option<&A1Range>,
        cancel: &CancellationToken,
    ) -> GuardResult<DocumentFingerprint> {
        self.fence.current(document, range, cancel).await
    }

    // =========================================================================
    // Transactions
    // =========================================================================

    /// Starts a transaction on a document.
    pub async fn begin_transaction(
        &self,
        document: &DocumentId,
        options: TxnOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<TxnId> {
        self.transactions.begin(document, options, cancel).await
    }

    /// Queues a mutation on a pending transaction.
    pub fn queue(&self, txn: TxnId, request: MutationRequest) -> GuardResult<usize> {
        self.transactions.queue(txn, request)
    }

    /// Commits a transaction.
    pub async fn commit(&self, txn: TxnId, cancel: &CancellationToken) -> GuardResult<CommitReport> {
        self.transactions.commit(txn, cancel).await
    }

    /// Abandons a pending transaction.
    pub fn rollback(&self, txn: TxnId) -> GuardResult<TxnStatus> {
        self.transactions.rollback(txn)
    }

    /// Reports a transaction's state.
    pub fn status(&self, txn: TxnId) -> GuardResult<TxnStatus> {
        self.transactions.status(txn)
    }

    /// Expires idle transactions now.
    pub fn expire_idle_transactions(&self) -> GuardResult<Vec<TxnId>> {
        self.transactions.expire_idle()
    }

    /// The transaction coordinator.
    #[must_use]
    pub fn transactions(&self) -> &Arc<TransactionCoordinator> {
        &self.transactions
    }

    /// Starts the background expiry sweep if one is configured and none is
    /// running. Must be called inside a Tokio runtime.
    pub fn start_reaper(&self) -> bool {
        let mut reaper = self.reaper.lock();
        if reaper.is_some() {
            return false;
        }
        *reaper = self.transactions.spawn_reaper(self.shutdown.child_token());
        reaper.is_some()
    }

    // =========================================================================
    // Conflicts
    // =========================================================================

    /// Checks a range for conflicting writes.
    pub async fn detect_conflicts(
        &self,
        query: &ConflictQuery,
        cancel: &CancellationToken,
    ) -> GuardResult<Vec<Conflict>> {
        self.conflicts.detect(query, cancel).await
    }

    /// Resolves an open conflict. Refused with `TRANSACTION_CONFLICT`
    /// while a transaction holds the document.
    pub async fn resolve_conflict(
        &self,
        id: ConflictId,
        strategy: ResolutionStrategy,
        merged_value: Option<Vec<Vec<serde_json::Value>>>,
        cancel: &CancellationToken,
    ) -> GuardResult<Resolution> {
        self.conflicts
            .resolve(id, strategy, merged_value, cancel)
            .await
    }

    /// Open conflicts on a document.
    #[must_use]
    pub fn list_conflicts(&self, document: &DocumentId) -> Vec<Conflict> {
        self.conflicts.list(document)
    }

    // =========================================================================
    // Snapshots and history
    // =========================================================================

    /// The snapshot manager. Restores are refused while a transaction is
    /// committing on the document and invalidate a pending one.
    #[must_use]
    pub fn snapshots(&self) -> &Arc<SnapshotManager> {
        &self.snapshots
    }

    /// The history log. Undo, redo and revert are refused while a
    /// transaction holds the document.
    #[must_use]
    pub fn history(&self) -> &Arc<HistoryLog> {
        &self.history
    }
}

impl Drop for SheetGuard {
    fn drop(&mut self) {
        self.shutdown.cancel();
    }
}

impl fmt::Debug for SheetGuard {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SheetGuard")
            .field("config", &self.config)
            .field("transactions", &self.transactions)
            .field("reaper", &self.reaper.lock().is_some())
            .finish()
    }
}
