//! The guarded mutation pipeline.
//!
//! ```text
//! validate ─▶ scope (dry run stops here) ─▶ fence ─▶ auto-snapshot
//!    ─▶ apply (retry + applied-key lookup) ─▶ diff ─▶ history ─▶ ledger
//! ```
//!
//! Dry runs are answered from the request alone. Inside a transaction
//! commit the per-request fence and snapshot are skipped; the commit fences
//! the baseline and snapshots once for the whole batch.

use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Instant;

use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use sheetguard_common::clock::SharedClock;
use sheetguard_common::config::GuardConfig;
use sheetguard_common::error::{ExecResult, GuardError, GuardResult};
use sheetguard_common::types::{
    A1Range, CellGrid, DocumentFingerprint, DocumentId, ExpectedState, OpId, SnapshotId, TxnId,
};
use sheetguard_executor::{
    ActionExecutor, EffectShape, ExecutorResult, IdempotencyKey, InverseOp, OpDescriptor,
    RetryPolicy,
};

use crate::conflict::{qualify, LedgerWrite, WriteLedger};
use crate::diff::{DiffEngine, DiffInput, TierKind};
use crate::fence::VersionFence;
use crate::history::{EntryStatus, HistoryEntry, HistoryLog};
use crate::request::{
    DryRunReport, MutationOutcome, MutationRequest, MutationResponse, MutationSummary, SheetShape,
};
use crate::scope::{EffectEstimate, ScopeGuard};
use crate::snapshot::SnapshotManager;

/// Runs a mutating executor call, checking for an already landed result
/// before every retry.
///
/// A transient failure can arrive after the executor applied the write.
/// Every retry first asks the executor whether `key` landed and reuses the
/// recorded result instead of writing twice.
pub(crate) async fn run_idempotent<'a, F, Fut>(
    executor: &'a Arc<dyn ActionExecutor>,
    retry: &RetryPolicy,
    what: &str,
    document: &'a DocumentId,
    key: IdempotencyKey,
    cancel: &CancellationToken,
    call: F,
) -> GuardResult<ExecutorResult>
where
    F: Fn(&'a dyn ActionExecutor) -> Fut,
    Fut: Future<Output = ExecResult<ExecutorResult>>,
{
    let exec: &'a dyn ActionExecutor = executor.as_ref();
    let call = &call;
    retry
        .run(what, cancel, |attempt| async move {
            if attempt > 1 {
                if let Some(done) = exec.find_applied(document, key).await? {
                    debug!(%document, %key, attempt, "write already landed, reusing result");
                    return Ok(done);
                }
            }
            call(exec).await
        })
        .await
}

/// Applies a mutation under `key`.
pub(crate) async fn apply_idempotent(
    executor: &Arc<dyn ActionExecutor>,
    retry: &RetryPolicy,
    document: &DocumentId,
    op: &OpDescriptor,
    key: IdempotencyKey,
    cancel: &CancellationToken,
) -> GuardResult<ExecutorResult> {
    run_idempotent(executor, retry, "apply_mutation", document, key, cancel, |exec| {
        exec.apply_mutation(document, op, key)
    })
    .await
}

/// Applies an inverse under `key`.
pub(crate) async fn apply_inverse_idempotent(
    executor: &Arc<dyn ActionExecutor>,
    retry: &RetryPolicy,
    document: &DocumentId,
    inverse: &InverseOp,
    key: IdempotencyKey,
    cancel: &CancellationToken,
) -> GuardResult<ExecutorResult> {
    run_idempotent(executor, retry, "apply_inverse", document, key, cancel, |exec| {
        exec.apply_inverse(document, inverse, key)
    })
    .await
}

/// Writes literal cells under `key`.
pub(crate) async fn write_cells_idempotent(
    executor: &Arc<dyn ActionExecutor>,
    retry: &RetryPolicy,
    document: &DocumentId,
    cells: &CellGrid,
    key: IdempotencyKey,
    cancel: &CancellationToken,
) -> GuardResult<ExecutorResult> {
    run_idempotent(executor, retry, "write_cells", document, key, cancel, |exec| {
        exec.write_cells(document, cells, key)
    })
    .await
}

/// A failed run of the pipeline.
#[derive(Debug)]
pub struct ExecuteFailure {
    /// Why it failed.
    pub error: GuardError,
    /// Operation whose write reached the document before the failure.
    /// Its history entry holds the inverse.
    pub landed: Option<OpId>,
}

impl From<GuardError> for ExecuteFailure {
    fn from(error: GuardError) -> Self {
        Self {
            error,
            landed: None,
        }
    }
}

/// Where a request runs.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stage {
    /// Transaction being committed.
    pub txn: Option<TxnId>,
}

impl Stage {
    /// A standalone request.
    #[must_use]
    pub fn standalone() -> Self {
        Self::default()
    }

    /// A request replayed by a commit.
    #[must_use]
    pub fn commit(txn: TxnId) -> Self {
        Self { txn: Some(txn) }
    }
}

/// Runs one request through every guard.
pub struct MutationPipeline {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    fence: Arc<VersionFence>,
    scope: ScopeGuard,
    snapshots: Arc<SnapshotManager>,
    diff: DiffEngine,
    history: Arc<HistoryLog>,
    ledger: Arc<WriteLedger>,
    clock: SharedClock,
    require_expected_state: bool,
    auto_threshold_cells: u64,
    next_op: AtomicU64,
}

impl MutationPipeline {
    /// Creates the pipeline. Operation ids continue after the highest one
    /// in history.
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        executor: Arc<dyn ActionExecutor>,
        retry: RetryPolicy,
        fence: Arc<VersionFence>,
        snapshots: Arc<SnapshotManager>,
        history: Arc<HistoryLog>,
        ledger: Arc<WriteLedger>,
        clock: SharedClock,
        config: &GuardConfig,
    ) -> Self {
        let next = history
            .max_op_id()
            .map_or(OpId::FIRST, OpId::next)
            .as_u64();
        Self {
            executor,
            retry,
            fence,
            scope: ScopeGuard::new(config.scope.clone()),
            snapshots,
            diff: DiffEngine::new(config.diff.clone()),
            history,
            ledger,
            clock,
            require_expected_state: config.fence.require_expected_state,
            auto_threshold_cells: config.snapshot.auto_threshold_cells,
            next_op: AtomicU64::new(next),
        }
    }

    /// The scope guard.
    #[must_use]
    pub fn scope(&self) -> &ScopeGuard {
        &self.scope
    }

    /// Validates and sizes a request without touching the executor.
    pub fn dry_run(&self, request: &MutationRequest) -> GuardResult<DryRunReport> {
        request.validate()?;
        let estimate = self.scope.evaluate(request)?;
        Ok(DryRunReport {
            would_snapshot: self.wants_snapshot(request, &estimate),
            diff_tier: self.diff.select_tier(estimate.cells_affected),
            estimate,
        })
    }

    /// Validates and sizes a request against a known fingerprint of the
    /// default sheet. Used by commits to fail before anything is applied.
    pub fn preflight(
        &self,
        request: &MutationRequest,
        live: &DocumentFingerprint,
    ) -> GuardResult<EffectEstimate> {
        request.validate()?;
        if request.sheets.is_empty() {
            self.scope.evaluate(&Self::with_sheet_hint(request, live))
        } else {
            self.scope.evaluate(request)
        }
    }

    fn wants_snapshot(&self, request: &MutationRequest, estimate: &EffectEstimate) -> bool {
        !request.options.skip_snapshot
            && (request.destructive || estimate.cells_affected > self.auto_threshold_cells)
    }

    /// Runs a request.
    pub async fn execute(
        &self,
        request: &MutationRequest,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> GuardResult<MutationOutcome> {
        self.execute_tracked(request, stage, cancel)
            .await
            .map_err(|failure| failure.error)
    }

    /// Runs a request, reporting a write that landed even when a later
    /// step failed.
    ///
    /// Once the executor accepts the write the operation is always appended
    /// to history. Failures capturing the after-image or recording the
    /// write for conflict detection downgrade the result to a metadata diff
    /// instead of failing it.
    pub async fn execute_tracked(
        &self,
        request: &MutationRequest,
        stage: Stage,
        cancel: &CancellationToken,
    ) -> Result<MutationOutcome, ExecuteFailure> {
        request.validate()?;
        if request.options.dry_run {
            return Ok(MutationOutcome::DryRun(self.dry_run(request)?));
        }

        let started = Instant::now();
        let document = &request.document_id;
        let expected = match (stage.txn, &request.expected_state) {
            (None, Some(expected)) if !expected.is_empty() => expected.clone(),
            (None, _) if self.require_expected_state => {
                return Err(GuardError::invalid_request(
                    "an expected state is required for every mutation",
                )
                .into());
            }
            _ => ExpectedState::default(),
        };
        let before = self.fence.check(document, &expected, cancel).await?;

        // The fingerprint describes the default sheet unless the fence
        // checksummed a named one.
        let default_sheet = expected
            .checksum_range
            .as_ref()
            .map_or(true, |r| r.sheet.is_none())
            .then(|| before.sheet_title.clone());
        let estimate = match &default_sheet {
            Some(_) if request.sheets.is_empty() => {
                self.scope.evaluate(&Self::with_sheet_hint(request, &before))?
            }
            _ => self.scope.evaluate(request)?,
        };
        let target = request.operation.shape.target().map(|range| {
            match estimate.resolved_sheet.as_deref().or(default_sheet.as_deref()) {
                Some(sheet) => qualify(&range, sheet),
                None => range,
            }
        });

        let snapshot_before = if stage.txn.is_none() && self.wants_snapshot(request, &estimate) {
            self.auto_snapshot(request, cancel).await?
        } else {
            None
        };

        let capture = self.diff.select_tier(estimate.cells_affected) != TierKind::Metadata;
        let cells_before = match (&target, capture) {
            (Some(range), true) => Some(self.read(document, range, cancel).await?),
            _ => None,
        };

        let op_id = OpId::new(self.next_op.fetch_add(1, Ordering::SeqCst));
        let key = IdempotencyKey::derive(document, op_id, &request.operation);
        let result = apply_idempotent(
            &self.executor,
            &self.retry,
            document,
            &request.operation,
            key,
            cancel,
        )
        .await?;
        let version_after = result.fingerprint.version;
        self.fence.record_head(document, version_after);

        // The write has landed: nothing below may drop it from history.
        let count = estimate.cells_affected.max(result.updated_cells);
        let cells_after = match &target {
            Some(range) if cells_before.is_some() && self.diff.select_tier(count) != TierKind::Metadata => {
                self.capture_after(op_id, document, range, cancel).await
            }
            _ => None,
        };

        let before_input = DiffInput::with_cells(before.clone(), cells_before.clone());
        let after_input = DiffInput::with_cells(result.fingerprint.clone(), cells_after.clone())
            .updated(result.updated_cells);
        let diff = self
            .diff
            .compute(&before_input, &after_input, &estimate, op_id, cancel)
            .unwrap_or_else(|err| {
                warn!(op = %op_id, %document, error = %err, "diff failed, reporting metadata only");
                DiffEngine::metadata_only(&before_input, &after_input, &estimate)
            });

        let appended = self.history.append(HistoryEntry {
            op_id,
            document_id: document.clone(),
            timestamp: self.clock.now(),
            operation: request.operation.clone(),
            inverse: result.inverse.clone(),
            version_before: before.version,
            result_fingerprint: result.fingerprint.clone(),
            snapshot_before,
            status: EntryStatus::Applied,
            session: request.session.clone(),
            txn: stage.txn,
            generation: 0,
        });
        if let Err(error) = appended {
            warn!(op = %op_id, %document, error = %error, "applied write could not be persisted to history");
            return Err(ExecuteFailure {
                error,
                landed: Some(op_id),
            });
        }

        if let Some(range) = target {
            let recorded = self
                .record_write(
                    request,
                    stage,
                    op_id,
                    range,
                    &before,
                    &result,
                    &estimate,
                    cells_before,
                    cells_after,
                    cancel,
                )
                .await;
            if let Err(err) = recorded {
                warn!(op = %op_id, %document, error = %err, "write not recorded for conflict detection");
            }
        }

        let summary = MutationSummary {
            op_id,
            action: request.operation.action.clone(),
            cells_affected: estimate.cells_affected,
            updated_cells: result.updated_cells,
            reversible: result.inverse.is_some() || snapshot_before.is_some(),
            revert_snapshot_id: snapshot_before,
            duration_ms: u64::try_from(started.elapsed().as_millis()).unwrap_or(u64::MAX),
            version_before: before.version,
            version_after,
        };
        info!(
            op = %op_id,
            %document,
            action = %summary.action,
            cells = summary.updated_cells,
            version = %version_after,
            tier = ?diff.kind(),
            "mutation applied"
        );

        Ok(MutationOutcome::Applied(Box::new(MutationResponse {
            result,
            diff,
            summary,
        })))
    }

    /// Sizes the request against the live default sheet.
    fn with_sheet_hint(request: &MutationRequest, live: &DocumentFingerprint) -> MutationRequest {
        request.clone().with_sheet(SheetShape::new(
            live.sheet_title.clone(),
            live.row_count,
            live.column_count,
        ))
    }

    async fn auto_snapshot(
        &self,
        request: &MutationRequest,
        cancel: &CancellationToken,
    ) -> GuardResult<Option<SnapshotId>> {
        let name = format!("before {}", request.operation.action);
        match self
            .snapshots
            .create(&request.document_id, Some(&name), true, cancel)
            .await
        {
            Ok(snapshot) => Ok(Some(snapshot.id)),
            Err(GuardError::Cancelled) => Err(GuardError::Cancelled),
            Err(err) if request.options.accept_risk => {
                warn!(
                    document = %request.document_id,
                    error = %err,
                    "automatic snapshot failed, proceeding at caller's risk"
                );
                Ok(None)
            }
            Err(err) => Err(err),
        }
    }

    async fn capture_after(
        &self,
        op_id: OpId,
        document: &DocumentId,
        range: &A1Range,
        cancel: &CancellationToken,
    ) -> Option<CellGrid> {
        match self.read(document, range, cancel).await {
            Ok(cells) => Some(cells),
            Err(err) => {
                warn!(op = %op_id, %document, error = %err, "after-image capture failed, reporting metadata only");
                None
            }
        }
    }

    async fn read(
        &self,
        document: &DocumentId,
        range: &A1Range,
        cancel: &CancellationToken,
    ) -> GuardResult<CellGrid> {
        let exec = &self.executor;
        self.retry
            .run("read_range", cancel, |_| exec.read_range(document, range))
            .await
    }

    #[allow(clippy::too_many_arguments)]
    async fn record_write(
        &self,
        request: &MutationRequest,
        stage: Stage,
        op_id: OpId,
        range: A1Range,
        before: &DocumentFingerprint,
        result: &ExecutorResult,
        estimate: &EffectEstimate,
        cells_before: Option<CellGrid>,
        cells_after: Option<CellGrid>,
        cancel: &CancellationToken,
    ) -> GuardResult<()> {
        let document = &request.document_id;
        let after = self.fence.current(document, Some(&range), cancel).await?;
        let partial = matches!(request.operation.shape, EffectShape::Payload { .. })
            && result.updated_cells < estimate.cells_affected;
        if partial {
            warn!(
                op = %op_id,
                %document,
                updated = result.updated_cells,
                estimated = estimate.cells_affected,
                "executor touched fewer cells than the payload held"
            );
        }
        self.ledger.record(
            document,
            LedgerWrite {
                op_id,
                session: request.session.clone(),
                range,
                sheet_rows: after.row_count.max(before.row_count),
                sheet_cols: after.column_count.max(before.column_count),
                version_before: before.version,
                version_after: result.fingerprint.version,
                cells_before,
                cells_after,
                range_checksum_after: Some(after.checksum),
                partial,
                at: self.clock.now(),
                txn: stage.txn,
            },
        )
    }
}

impl std::fmt::Debug for MutationPipeline {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("MutationPipeline")
            .field("scope", &self.scope)
            .field("diff", &self.diff)
            .field("next_op", &self.next_op.load(Ordering::Relaxed))
            .finish()
    }
}
