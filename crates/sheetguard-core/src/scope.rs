//! Effect scope guard.
//!
//! Estimates how many cells, rows and columns a request can touch from its
//! [`EffectShape`] alone and rejects requests that exceed their limits.
//! The guard is a pure function of the request and configuration: it never
//! calls the executor and never mutates state, so it is safe in dry-run
//! mode even when it fails.

use serde::{Deserialize, Serialize};
use tracing::debug;

use sheetguard_common::config::ScopeConfig;
use sheetguard_common::error::{GuardError, GuardResult, ScopeDimension};
use sheetguard_executor::{Dimension, EffectShape};

use crate::request::{EffectLimits, MutationRequest, SheetShape};

/// Statically derived blast radius of a request.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct EffectEstimate {
    /// Cells the request can change.
    pub cells_affected: u64,
    /// Rows spanned.
    pub rows_affected: u64,
    /// Columns spanned.
    pub columns_affected: u64,
    /// False when the target resolves to an entire sheet.
    pub range_is_explicit: bool,
    /// Canonical title of the matched sheet hint, if any.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resolved_sheet: Option<String>,
}

/// Limits after merging request overrides with configuration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ResolvedLimits {
    /// Cell ceiling.
    pub max_cells: u64,
    /// Row ceiling.
    pub max_rows: Option<u64>,
    /// Column ceiling.
    pub max_columns: Option<u64>,
    /// Reject whole-sheet targets.
    pub require_explicit_range: bool,
}

/// The effect scope guard.
#[derive(Debug, Clone)]
pub struct ScopeGuard {
    config: ScopeConfig,
}

impl ScopeGuard {
    /// Creates a guard.
    #[must_use]
    pub fn new(config: ScopeConfig) -> Self {
        Self { config }
    }

    /// Merges per-request limits over configuration.
    #[must_use]
    pub fn limits(&self, limits: Option<&EffectLimits>) -> ResolvedLimits {
        let limits = limits.cloned().unwrap_or_default();
        ResolvedLimits {
            max_cells: limits
                .max_cells_affected
                .unwrap_or(self.config.max_cells_affected),
            max_rows: limits.max_rows_affected,
            max_columns: limits.max_columns_affected,
            require_explicit_range: limits
                .require_explicit_range
                .unwrap_or(self.config.require_explicit_range),
        }
    }

    /// Resolves a sheet name against the caller's shape hints.
    ///
    /// A unique exact match wins. Otherwise trimmed, case-insensitive
    /// matches are collected; more than one fails closed.
    pub fn resolve_sheet<'a>(
        &self,
        name: Option<&str>,
        sheets: &'a [SheetShape],
    ) -> GuardResult<Option<&'a SheetShape>> {
        let Some(name) = name else {
            return Ok(sheets.first());
        };

        let exact: Vec<&SheetShape> = sheets.iter().filter(|s| s.title == name).collect();
        if exact.len() == 1 {
            return Ok(Some(exact[0]));
        }

        let wanted = name.trim();
        let loose: Vec<&SheetShape> = sheets
            .iter()
            .filter(|s| s.title.trim().eq_ignore_ascii_case(wanted))
            .collect();
        match loose.len() {
            0 => Ok(None),
            1 => Ok(Some(loose[0])),
            _ => Err(GuardError::AmbiguousRange {
                name: name.to_string(),
                candidates: loose.iter().map(|s| s.title.clone()).collect(),
            }),
        }
    }

    /// Estimates a request's effect without checking limits.
    pub fn estimate(&self, request: &MutationRequest) -> GuardResult<EffectEstimate> {
        let shape = &request.operation.shape;
        let sheet = self.resolve_sheet(shape.sheet(), &request.sheets)?;
        let (sheet_rows, sheet_cols) = sheet.map_or(
            (self.config.default_sheet_rows, self.config.default_sheet_columns),
            |s| (s.rows, s.columns),
        );

        let (rows, cols, explicit) = match shape {
            EffectShape::Payload { range, rows, columns } => {
                (u64::from(*rows), u64::from(*columns), range.is_explicit())
            }
            EffectShape::Range { range } => {
                let rect = range.rect(sheet_rows, sheet_cols);
                (u64::from(rect.height), u64::from(rect.width), range.is_explicit())
            }
            EffectShape::Dimension {
                dimension, count, ..
            } => match dimension {
                Dimension::Rows => (u64::from(*count), u64::from(sheet_cols), true),
                Dimension::Columns => (u64::from(sheet_rows), u64::from(*count), true),
            },
            EffectShape::Sheet { .. } => (u64::from(sheet_rows), u64::from(sheet_cols), false),
            EffectShape::NoCells => (0, 0, true),
        };

        Ok(EffectEstimate {
            cells_affected: rows.saturating_mul(cols),
            rows_affected: rows,
            columns_affected: cols,
            range_is_explicit: explicit,
            resolved_sheet: sheet.map(|s| s.title.clone()),
        })
    }

    /// Estimates a request's effect and enforces its limits.
    pub fn evaluate(&self, request: &MutationRequest) -> GuardResult<EffectEstimate> {
        let estimate = self.estimate(request)?;
        let limits = self.limits(request.limits.as_ref());
        Self::check(&estimate, &limits)?;
        debug!(
            document = %request.document_id,
            action = %request.operation.action,
            cells = estimate.cells_affected,
            "effect scope within limits"
        );
        Ok(estimate)
    }

    /// Checks an estimate against resolved limits.
    pub fn check(estimate: &EffectEstimate, limits: &ResolvedLimits) -> GuardResult<()> {
        if limits.require_explicit_range && !estimate.range_is_explicit {
            return Err(GuardError::ExplicitRangeRequired {
                reason: "target resolves to an entire sheet".into(),
            });
        }
        if estimate.cells_affected > limits.max_cells {
            return Err(GuardError::EffectScopeExceeded {
                dimension: ScopeDimension::Cells,
                estimated: estimate.cells_affected,
                limit: limits.max_cells,
            });
        }
        if let Some(max) = limits.max_rows {
            if estimate.rows_affected > max {
                return Err(GuardError::EffectScopeExceeded {
                    dimension: ScopeDimension::Rows,
                    estimated: estimate.rows_affected,
                    limit: max,
                });
            }
        }
        if let Some(max) = limits.max_columns {
            if estimate.columns_affected > max {
                return Err(GuardError::EffectScopeExceeded {
                    dimension: ScopeDimension::Columns,
                    estimated: estimate.columns_affected,
                    limit: max,
                });
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetguard_common::ErrorCode;
    use sheetguard_executor::{actions, OpDescriptor};

    fn guard() -> ScopeGuard {
        ScopeGuard::new(ScopeConfig::default())
    }

    fn request(op: OpDescriptor) -> MutationRequest {
        MutationRequest::new("S1", op)
    }

    fn grid(rows: usize, cols: usize) -> Vec<Vec<serde_json::Value>> {
        vec![vec![json!(0); cols]; rows]
    }

    #[test]
    fn test_payload_estimate() {
        let est = guard()
            .estimate(&request(actions::write_range(
                "Sheet1!B2".parse().unwrap(),
                grid(3, 4),
            )))
            .unwrap();
        assert_eq!(est.cells_affected, 12);
        assert_eq!(est.rows_affected, 3);
        assert_eq!(est.columns_affected, 4);
        assert!(est.range_is_explicit);
    }

    #[test]
    fn test_whole_sheet_uses_default_grid() {
        let req = request(actions::clear_range(sheetguard_common::A1Range::whole_sheet(
            "Sheet1",
        )));
        let est = guard().estimate(&req).unwrap();
        assert_eq!(est.cells_affected, 1000 * 26);
        assert!(!est.range_is_explicit);

        let hinted = req.with_sheet(SheetShape::new("Sheet1", 10, 5));
        let est = guard().estimate(&hinted).unwrap();
        assert_eq!(est.cells_affected, 50);
        assert_eq!(est.resolved_sheet.as_deref(), Some("Sheet1"));
    }

    #[test]
    fn test_cell_limit() {
        let req = request(actions::write_range("A1".parse().unwrap(), grid(20, 25)))
            .with_limits(EffectLimits::max_cells(100));
        let err = guard().evaluate(&req).unwrap_err();
        assert_eq!(err.code(), ErrorCode::EffectScopeExceeded);
        match err {
            GuardError::EffectScopeExceeded {
                dimension,
                estimated,
                limit,
            } => {
                assert_eq!(dimension, ScopeDimension::Cells);
                assert_eq!(estimated, 500);
                assert_eq!(limit, 100);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_row_limit() {
        let req = request(actions::delete_rows(None, 0, 10)).with_limits(EffectLimits {
            max_rows_affected: Some(5),
            ..Default::default()
        });
        let err = guard().evaluate(&req).unwrap_err();
        assert!(matches!(
            err,
            GuardError::EffectScopeExceeded {
                dimension: ScopeDimension::Rows,
                ..
            }
        ));
    }

    #[test]
    fn test_explicit_range_required() {
        let req = request(actions::clear_range(sheetguard_common::A1Range::whole_sheet(
            "Sheet1",
        )))
        .with_sheet(SheetShape::new("Sheet1", 2, 2))
        .with_limits(EffectLimits {
            require_explicit_range: Some(true),
            ..Default::default()
        });
        assert_eq!(
            guard().evaluate(&req).unwrap_err().code(),
            ErrorCode::ExplicitRangeRequired
        );
    }

    #[test]
    fn test_ambiguous_sheet_fails_closed() {
        let req = request(actions::clear_range("data!A1:B2".parse().unwrap()))
            .with_sheet(SheetShape::new("Data", 10, 10))
            .with_sheet(SheetShape::new("DATA ", 10, 10));
        let err = guard().estimate(&req).unwrap_err();
        match err {
            GuardError::AmbiguousRange { name, candidates } => {
                assert_eq!(name, "data");
                assert_eq!(candidates.len(), 2);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_exact_match_beats_loose_matches() {
        let req = request(actions::clear_range("Data!A1:B2".parse().unwrap()))
            .with_sheet(SheetShape::new("Data", 10, 10))
            .with_sheet(SheetShape::new("data", 10, 10));
        let est = guard().estimate(&req).unwrap();
        assert_eq!(est.resolved_sheet.as_deref(), Some("Data"));
    }

    #[test]
    fn test_no_cells() {
        let req = request(OpDescriptor::new("rename_sheet", EffectShape::NoCells));
        let est = guard().evaluate(&req).unwrap();
        assert_eq!(est.cells_affected, 0);
        assert!(est.range_is_explicit);
    }
}
