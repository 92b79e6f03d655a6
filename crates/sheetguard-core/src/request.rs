//! Mutation requests and responses.

use serde::{Deserialize, Serialize};

use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{
    DocumentId, DocumentVersion, ExpectedState, OpId, SessionId, SnapshotId,
};
use sheetguard_executor::{EffectShape, ExecutorResult, OpDescriptor};

use crate::diff::{DiffTier, TierKind};
use crate::scope::EffectEstimate;

/// Size of one sheet, as known to the caller.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SheetShape {
    /// Sheet title.
    pub title: String,
    /// Rows.
    pub rows: u32,
    /// Columns.
    pub columns: u32,
}

impl SheetShape {
    /// Creates a shape hint.
    pub fn new(title: impl Into<String>, rows: u32, columns: u32) -> Self {
        Self {
            title: title.into(),
            rows,
            columns,
        }
    }
}

/// Per-request effect limits. Unset fields fall back to configuration.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct EffectLimits {
    /// Hard ceiling on affected cells.
    pub max_cells_affected: Option<u64>,
    /// Ceiling on affected rows.
    pub max_rows_affected: Option<u64>,
    /// Ceiling on affected columns.
    pub max_columns_affected: Option<u64>,
    /// Reject whole-sheet targets.
    pub require_explicit_range: Option<bool>,
}

impl EffectLimits {
    /// Limits with only a cell ceiling.
    #[must_use]
    pub fn max_cells(max: u64) -> Self {
        Self {
            max_cells_affected: Some(max),
            ..Default::default()
        }
    }
}

/// Switches that change how the pipeline treats one request.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct MutationOptions {
    /// Evaluate scope only; touch nothing.
    pub dry_run: bool,
    /// Do not take an automatic snapshot.
    pub skip_snapshot: bool,
    /// Proceed even if the automatic snapshot fails.
    pub accept_risk: bool,
}

/// One mutation as submitted by a caller.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationRequest {
    /// Target document.
    pub document_id: DocumentId,
    /// What to do.
    pub operation: OpDescriptor,
    /// Fence on the live document.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_state: Option<ExpectedState>,
    /// Effect limits overriding configuration.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub limits: Option<EffectLimits>,
    /// Calling session, for conflict attribution.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub session: Option<SessionId>,
    /// Known sheet sizes, used to size whole-sheet and dimension targets.
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub sheets: Vec<SheetShape>,
    /// The action destroys content (always snapshotted first).
    #[serde(default)]
    pub destructive: bool,
    /// Pipeline switches.
    #[serde(default)]
    pub options: MutationOptions,
}

impl MutationRequest {
    /// Creates a request with no fence, limits or hints.
    pub fn new(document_id: impl Into<DocumentId>, operation: OpDescriptor) -> Self {
        Self {
            document_id: document_id.into(),
            operation,
            expected_state: None,
            limits: None,
            session: None,
            sheets: Vec::new(),
            destructive: false,
            options: MutationOptions::default(),
        }
    }

    /// Sets the expected state.
    #[must_use]
    pub fn expect(mut self, expected: ExpectedState) -> Self {
        self.expected_state = Some(expected);
        self
    }

    /// Fences on a version only.
    #[must_use]
    pub fn expect_version(self, version: DocumentVersion) -> Self {
        self.expect(ExpectedState::version(version))
    }

    /// Sets effect limits.
    #[must_use]
    pub fn with_limits(mut self, limits: EffectLimits) -> Self {
        self.limits = Some(limits);
        self
    }

    /// Sets the session.
    #[must_use]
    pub fn with_session(mut self, session: impl Into<SessionId>) -> Self {
        self.session = Some(session.into());
        self
    }

    /// Adds a sheet shape hint.
    #[must_use]
    pub fn with_sheet(mut self, shape: SheetShape) -> Self {
        self.sheets.push(shape);
        self
    }

    /// Marks the request destructive.
    #[must_use]
    pub fn destructive(mut self) -> Self {
        self.destructive = true;
        self
    }

    /// Marks the request dry-run.
    #[must_use]
    pub fn dry_run(mut self) -> Self {
        self.options.dry_run = true;
        self
    }

    /// Opts out of the automatic snapshot.
    #[must_use]
    pub fn skip_snapshot(mut self) -> Self {
        self.options.skip_snapshot = true;
        self
    }

    /// Proceeds even if the automatic snapshot fails.
    #[must_use]
    pub fn accept_risk(mut self) -> Self {
        self.options.accept_risk = true;
        self
    }

    /// Checks the request's shape. Never touches the executor.
    pub fn validate(&self) -> GuardResult<()> {
        if self.document_id.as_str().trim().is_empty() {
            return Err(GuardError::invalid_request("document id is empty"));
        }
        if self.operation.action.trim().is_empty() {
            return Err(GuardError::invalid_request("action name is empty"));
        }
        if let Some(sheet) = self.operation.shape.sheet() {
            if sheet.trim().is_empty() {
                return Err(GuardError::invalid_request("sheet name is empty"));
            }
        }
        if let Some(expected) = &self.expected_state {
            if expected.checksum_range.is_some() && expected.checksum.is_none() {
                return Err(GuardError::invalid_request(
                    "expected state names a checksum range without a checksum",
                ));
            }
        }
        match &self.operation.shape {
            EffectShape::Payload { rows, columns, .. } if *rows == 0 || *columns == 0 => {
                Err(GuardError::invalid_request(format!(
                    "{} payload is empty ({rows} x {columns})",
                    self.operation.action
                )))
            }
            EffectShape::Dimension { count: 0, .. } => Err(GuardError::invalid_request(format!(
                "{} affects zero rows or columns",
                self.operation.action
            ))),
            _ => Ok(()),
        }
    }
}

/// What one applied mutation did.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationSummary {
    /// Operation id assigned by the core.
    pub op_id: OpId,
    /// Action name.
    pub action: String,
    /// Estimated cells affected.
    pub cells_affected: u64,
    /// Cells the executor reported touching.
    pub updated_cells: u64,
    /// Whether the mutation can be undone.
    pub reversible: bool,
    /// Snapshot taken before the write, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub revert_snapshot_id: Option<SnapshotId>,
    /// Wall time of the pipeline.
    pub duration_ms: u64,
    /// Version before the write.
    pub version_before: DocumentVersion,
    /// Version after the write.
    pub version_after: DocumentVersion,
}

/// Response to an applied mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MutationResponse {
    /// What the executor returned.
    pub result: ExecutorResult,
    /// Change report.
    pub diff: DiffTier,
    /// Summary.
    pub summary: MutationSummary,
}

/// What a mutation would do, computed without calling the executor.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct DryRunReport {
    /// Effect estimate.
    pub estimate: EffectEstimate,
    /// Whether an automatic snapshot would be taken.
    pub would_snapshot: bool,
    /// Diff tier the change report would use.
    pub diff_tier: TierKind,
}

/// Result of [`guarded_mutate`](crate::SheetGuard::guarded_mutate).
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
    /// The mutation was applied.
    Applied(Box<MutationResponse>),
    /// The request was a dry run.
    DryRun(DryRunReport),
}

impl MutationOutcome {
    /// Returns the response of an applied mutation.
    #[must_use]
    pub fn applied(self) -> Option<MutationResponse> {
        match self {
            MutationOutcome::Applied(response) => Some(*response),
            MutationOutcome::DryRun(_) => None,
        }
    }

    /// Returns the report of a dry run.
    #[must_use]
    pub fn dry_run(self) -> Option<DryRunReport> {
        match self {
            MutationOutcome::DryRun(report) => Some(report),
            MutationOutcome::Applied(_) => None,
        }
    }
}
