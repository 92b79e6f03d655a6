//! Version fence.
//!
//! Optimistic concurrency check run before every mutating call. The fence
//! fetches the live fingerprint and compares only the fields the caller
//! populated; any difference fails with `PRECONDITION_FAILED` listing every
//! mismatched field.
//!
//! The fence also remembers the latest version the core itself observed
//! for each document (its *head*). Snapshot restore and history replay
//! fence on it by default.

use std::sync::Arc;

use dashmap::DashMap;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{
    A1Range, DocumentFingerprint, DocumentId, DocumentVersion, ExpectedState,
};
use sheetguard_executor::{ActionExecutor, RetryPolicy};

/// The version fence.
pub struct VersionFence {
    executor: Arc<dyn ActionExecutor>,
    retry: RetryPolicy,
    heads: DashMap<DocumentId, DocumentVersion>,
}

impl VersionFence {
    /// Creates a fence.
    pub fn new(executor: Arc<dyn ActionExecutor>, retry: RetryPolicy) -> Self {
        Self {
            executor,
            retry,
            heads: DashMap::new(),
        }
    }

    /// Fetches the live fingerprint, optionally checksummed over `range`.
    pub async fn current(
        &self,
        document: &DocumentId,
        range: Option<&A1Range>,
        cancel: &CancellationToken,
    ) -> GuardResult<DocumentFingerprint> {
        let exec = &self.executor;
        self.retry
            .run("fetch_fingerprint", cancel, |_| {
                exec.fetch_fingerprint(document, range)
            })
            .await
    }

    /// Compares `expected` with the live document.
    ///
    /// Returns the live fingerprint when every populated field matches.
    pub async fn check(
        &self,
        document: &DocumentId,
        expected: &ExpectedState,
        cancel: &CancellationToken,
    ) -> GuardResult<DocumentFingerprint> {
        let current = self
            .current(document, expected.checksum_range.as_ref(), cancel)
            .await?;
        Self::compare(document, expected, &current)?;
        Ok(current)
    }

    /// Compares `expected` with an already fetched fingerprint.
    pub fn compare(
        document: &DocumentId,
        expected: &ExpectedState,
        current: &DocumentFingerprint,
    ) -> GuardResult<()> {
        let mismatched = expected.mismatches(current);
        if mismatched.is_empty() {
            debug!(%document, version = %current.version, "fence passed");
            return Ok(());
        }
        warn!(
            %document,
            fields = mismatched.len(),
            live = %current.version,
            "precondition failed"
        );
        Err(GuardError::PreconditionFailed {
            document: document.clone(),
            mismatched,
        })
    }

    /// Records the latest version the core observed for a document.
    pub fn record_head(&self, document: &DocumentId, version: DocumentVersion) {
        self.heads.insert(document.clone(), version);
    }

    /// The latest version the core observed for a document.
    #[must_use]
    pub fn head(&self, document: &DocumentId) -> Option<DocumentVersion> {
        self.heads.get(document).map(|v| *v)
    }
}

impl std::fmt::Debug for VersionFence {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("VersionFence")
            .field("retry", &self.retry)
            .field("heads", &self.heads.len())
            .finish()
    }
}
