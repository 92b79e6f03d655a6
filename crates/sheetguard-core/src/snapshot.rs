//! Snapshot manager.
//!
//! Snapshots are executor-side copies of a whole document, indexed by the
//! core. They are taken on demand or automatically before destructive and
//! large mutations, restored under a version fence, and pruned by a
//! retention policy after every create.
//!
//! # Lifecycle
//!
//! ```text
//! create() ──▶ live ──restore()──▶ live (document replaced, txns invalidated)
//!               │
//!               ├── delete() ──▶ gone
//!               └── retention (count / age, automatic first) ──▶ gone
//! ```

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;
use tracing::{info, warn};

use sheetguard_common::clock::SharedClock;
use sheetguard_common::config::SnapshotConfig;
use sheetguard_common::error::{ExecutorError, GuardError, GuardResult};
use sheetguard_common::types::{
    DocumentFingerprint, DocumentId, ExpectedState, SnapshotId, Timestamp, TxnId,
};
use sheetguard_executor::{ActionExecutor, RetryPolicy, SnapshotHandle};

use crate::fence::VersionFence;
use crate::store::{load_records, put_record, RecordKind, StateStore};
use crate::txn::{HolderLink, TxnHolder};

/// An indexed document copy.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// Snapshot id.
    pub id: SnapshotId,
    /// Source document.
    pub document_id: DocumentId,
    /// Optional label.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    /// Creation time.
    pub created_at: Timestamp,
    /// Document fingerprint when the copy was taken.
    pub fingerprint_at_creation: DocumentFingerprint,
    /// Executor-side handle.
    pub storage_handle: SnapshotHandle,
    /// Taken by the pipeline rather than a caller.
    pub automatic: bool,
}

/// How a restore is fenced.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RestoreOptions {
    /// Fence on this state instead of the document's head version.
    pub expected: Option<ExpectedState>,
    /// Skip the fence entirely.
    pub force: bool,
    /// Transaction the restore runs for. Only the transaction committing
    /// on a document may restore over it.
    pub txn: Option<TxnId>,
}

impl RestoreOptions {
    /// Restores without a fence.
    #[must_use]
    pub fn forced() -> Self {
        Self {
            force: true,
            ..Self::default()
        }
    }

    /// Fences on an explicit expectation.
    #[must_use]
    pub fn expecting(expected: ExpectedState) -> Self {
        Self {
            expected: Some(expected),
            ..Self::default()
        }
    }

    /// Runs the restore on behalf of `txn`.
    #[must_use]
    pub fn for_txn(mut self, txn: TxnId) -> Self {
        self.txn = Some(txn);
        self
    }
}

/// Notified after a snapshot replaced a document's content.
pub trait RestoreObserver: Send + Sync {
    /// Called once the restore has landed.
    fn snapshot_restored(&self, document: &DocumentId, snapshot: SnapshotId);
}

/// The snapshot manager.
pub struct SnapshotManager {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    fence: Arc<VersionFence>,
    clock: SharedClock,
    store: Arc<dyn StateStore>,
    config: SnapshotConfig,
    snapshots: RwLock<BTreeMap<SnapshotId, Snapshot>>,
    next_id: AtomicU64,
    observer: RwLock<Option<Weak<dyn RestoreObserver>>>,
    txns: HolderLink,
}

impl SnapshotManager {
    /// Creates a manager, loading the persisted snapshot index.
    pub fn open(
        executor: Arc<dyn ActionExecutor>,
        retry: RetryPolicy,
        fence: Arc<VersionFence>,
        clock: SharedClock,
        store: Arc<dyn StateStore>,
        config: SnapshotConfig,
    ) -> GuardResult<Self> {
        let loaded: Vec<Snapshot> = load_records(store.as_ref(), RecordKind::Snapshot)?;
        let next = loaded
            .iter()
            .map(|s| s.id.as_u64())
            .max()
            .map_or(SnapshotId::FIRST.as_u64(), |max| max + 1);
        let snapshots = loaded.into_iter().map(|s| (s.id, s)).collect();

        Ok(Self {
            executor,
            retry,
            fence,
            clock,
            store,
            config,
            snapshots: RwLock::new(snapshots),
            next_id: AtomicU64::new(next),
            observer: RwLock::new(None),
            txns: HolderLink::default(),
        })
    }

    /// Registers the component told about restores.
    pub fn set_observer(&self, observer: Weak<dyn RestoreObserver>) {
        *self.observer.write() = Some(observer);
    }

    /// Links the manager to the transaction coordinator. Restores are
    /// refused while another transaction is committing on the document.
    pub fn link_transactions(&self, holder: Weak<dyn TxnHolder>) {
        self.txns.set(holder);
    }

    /// Returns the snapshot configuration.
    #[must_use]
    pub fn config(&self) -> &SnapshotConfig {
        &self.config
    }

    /// Takes a snapshot of a document.
    pub async fn create(
        &self,
        document: &DocumentId,
        name: Option<&str>,
        automatic: bool,
        cancel: &CancellationToken,
    ) -> GuardResult<Snapshot> {
        let creation_failed = |err: GuardError| match err {
            GuardError::Cancelled => GuardError::Cancelled,
            other => GuardError::SnapshotCreationFailed {
                document: document.clone(),
                reason: other.to_string(),
            },
        };

        let fingerprint = self
            .fence
            .current(document, None, cancel)
            .await
            .map_err(creation_failed)?;
        let exec = &self.executor;
        let handle = self
            .retry
            .run("create_snapshot", cancel, |_| exec.create_snapshot(document))
            .await
            .map_err(creation_failed)?;

        let snapshot = Snapshot {
            id: SnapshotId::new(self.next_id.fetch_add(1, Ordering::SeqCst)),
            document_id: document.clone(),
            name: name.map(str::to_string),
            created_at: self.clock.now(),
            fingerprint_at_creation: fingerprint,
            storage_handle: handle,
            automatic,
        };
        self.persist(&snapshot)?;
        self.snapshots.write().insert(snapshot.id, snapshot.clone());

        info!(
            id = %snapshot.id,
            %document,
            version = %snapshot.fingerprint_at_creation.version,
            automatic,
            "snapshot created"
        );

        self.prune(document, snapshot.id, cancel).await;
        Ok(snapshot)
    }

    /// Returns a snapshot by id.
    #[must_use]
    pub fn get(&self, id: SnapshotId) -> Option<Snapshot> {
        self.snapshots.read().get(&id).cloned()
    }

    /// Lists a document's snapshots, oldest first.
    #[must_use]
    pub fn list(&self, document: &DocumentId) -> Vec<Snapshot> {
        self.snapshots
            .read()
            .values()
            .filter(|s| s.document_id == *document)
            .cloned()
            .collect()
    }

    /// Restores a snapshot over its document.
    ///
    /// Unless forced, the live document must match `options.expected` or,
    /// by default, the latest version the core observed. Fails with
    /// `TRANSACTION_CONFLICT` while a transaction other than `options.txn`
    /// is committing on the document; a pending one is invalidated by the
    /// restore instead.
    pub async fn restore(
        &self,
        id: SnapshotId,
        options: RestoreOptions,
        cancel: &CancellationToken,
    ) -> GuardResult<DocumentFingerprint> {
        let snapshot = self.get(id).ok_or(GuardError::SnapshotNotFound(id))?;
        let document = &snapshot.document_id;
        self.txns.check_not_committing(document, options.txn)?;

        if !options.force {
            let expected = options.expected.unwrap_or_else(|| {
                let head = self
                    .fence
                    .head(document)
                    .unwrap_or(snapshot.fingerprint_at_creation.version);
                ExpectedState::version(head)
            });
            match self.fence.check(document, &expected, cancel).await {
                Ok(_) => {}
                Err(GuardError::PreconditionFailed { mismatched, .. }) => {
                    return Err(GuardError::SnapshotRestoreFailed {
                        snapshot_id: id,
                        reason: "document changed since its last known state".into(),
                        mismatched,
                    });
                }
                Err(err) => return Err(err),
            }
        }

        let exec = &self.executor;
        let handle = &snapshot.storage_handle;
        let fingerprint = self
            .retry
            .run("restore_snapshot", cancel, |_| {
                exec.restore_snapshot(document, handle)
            })
            .await
            .map_err(|err| match err {
                GuardError::Cancelled => GuardError::Cancelled,
                other => GuardError::SnapshotRestoreFailed {
                    snapshot_id: id,
                    reason: other.to_string(),
                    mismatched: Vec::new(),
                },
            })?;

        self.fence.record_head(document, fingerprint.version);
        info!(%id, %document, version = %fingerprint.version, "snapshot restored");

        let observer = self.observer.read().as_ref().and_then(Weak::upgrade);
        if let Some(observer) = observer {
            observer.snapshot_restored(document, id);
        }
        Ok(fingerprint)
    }

    /// Deletes a snapshot and its executor-side copy.
    pub async fn delete(&self, id: SnapshotId, cancel: &CancellationToken) -> GuardResult<()> {
        let snapshot = self.get(id).ok_or(GuardError::SnapshotNotFound(id))?;
        self.discard(&snapshot, cancel).await?;
        info!(%id, document = %snapshot.document_id, "snapshot deleted");
        Ok(())
    }

    async fn discard(&self, snapshot: &Snapshot, cancel: &CancellationToken) -> GuardResult<()> {
        let exec = &self.executor;
        let handle = &snapshot.storage_handle;
        match self
            .retry
            .run("delete_snapshot", cancel, |_| exec.delete_snapshot(handle))
            .await
        {
            Ok(())
            | Err(GuardError::Executor {
                source: ExecutorError::HandleNotFound(_),
            }) => {}
            Err(err) => return Err(err),
        }
        self.store
            .delete(RecordKind::Snapshot, &snapshot.id.as_u64().to_string())?;
        self.snapshots.write().remove(&snapshot.id);
        Ok(())
    }

    /// Snapshots of `document` the retention policy would drop, never
    /// including `keep`.
    fn expired_for(&self, document: &DocumentId, keep: SnapshotId, now: Timestamp) -> Vec<Snapshot> {
        let mut live: Vec<Snapshot> = self.list(document);
        let mut doomed = Vec::new();

        live.retain(|s| {
            let too_old = s.id != keep && now.duration_since(s.created_at) > self.config.max_age;
            if too_old {
                doomed.push(s.clone());
            }
            !too_old
        });

        let excess = live.len().saturating_sub(self.config.max_per_document);
        if excess > 0 {
            // Automatic snapshots go first, oldest within each group.
            let mut candidates: Vec<&Snapshot> = live.iter().filter(|s| s.id != keep).collect();
            candidates.sort_by_key(|s| (!s.automatic, s.created_at, s.id));
            doomed.extend(candidates.into_iter().take(excess).cloned());
        }
        doomed
    }

    async fn prune(&self, document: &DocumentId, keep: SnapshotId, cancel: &CancellationToken) {
        for snapshot in self.expired_for(document, keep, self.clock.now()) {
            match self.discard(&snapshot, cancel).await {
                Ok(()) => info!(id = %snapshot.id, %document, "snapshot pruned"),
                Err(err) => warn!(id = %snapshot.id, %document, error = %err, "snapshot prune failed"),
            }
        }
    }

    fn persist(&self, snapshot: &Snapshot) -> GuardResult<()> {
        put_record(
            self.store.as_ref(),
            RecordKind::Snapshot,
            &snapshot.id.as_u64().to_string(),
            snapshot,
        )?;
        Ok(())
    }
}

impl std::fmt::Debug for SnapshotManager {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SnapshotManager")
            .field("snapshots", &self.snapshots.read().len())
            .field("config", &self.config)
            .finish()
    }
}
