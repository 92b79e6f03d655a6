//! Tiered diff engine.
//!
//! The change report attached to every mutation is bounded in size no
//! matter how large the mutation was. The tier is a monotonic function of
//! the affected-cell count:
//!
//! ```text
//!   count ≤ full_max_cells    ──▶ FULL      every changed cell
//!   count ≤ sample_max_cells  ──▶ SAMPLE    first/last N rows + M random rows
//!   otherwise                 ──▶ METADATA  counts and checksums only
//! ```
//!
//! Random rows are drawn with an RNG seeded from the operation id, so the
//! same mutation always yields the same sample.

use std::collections::BTreeMap;

use rand::rngs::StdRng;
use rand::SeedableRng;
use serde::{Deserialize, Serialize};
use tokio_util::sync::CancellationToken;

use sheetguard_common::config::DiffConfig;
use sheetguard_common::error::{GuardError, GuardResult};
use sheetguard_common::types::{Cell, CellGrid, CellRef, DocumentFingerprint, GridRect, OpId};

use crate::scope::EffectEstimate;

/// What kind of change a cell saw. When several attributes changed, the
/// most significant one wins: formula, then value, then format, then note.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChangeType {
    /// The computed value changed.
    Value,
    /// The format changed.
    Format,
    /// The formula changed.
    Formula,
    /// The note changed.
    Note,
}

impl ChangeType {
    /// Classifies the difference between two cells, `None` if equal.
    #[must_use]
    pub fn classify(before: &Cell, after: &Cell) -> Option<Self> {
        if before.formula != after.formula {
            Some(ChangeType::Formula)
        } else if before.value != after.value {
            Some(ChangeType::Value)
        } else if before.format != after.format {
            Some(ChangeType::Format)
        } else if before.note != after.note {
            Some(ChangeType::Note)
        } else {
            None
        }
    }
}

/// One changed cell.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CellChange {
    /// Coordinate.
    pub cell: CellRef,
    /// Content before.
    pub before: Cell,
    /// Content after.
    pub after: Cell,
    /// Classification.
    pub change_type: ChangeType,
}

/// The changed cells of one row.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RowChange {
    /// Zero-based row.
    pub row: u32,
    /// Changed cells, left to right.
    pub changes: Vec<CellChange>,
}

/// Aggregate counts of a change report.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct DiffSummary {
    /// Changed cells (estimated for metadata reports).
    pub cells_changed: u64,
    /// Rows with at least one change.
    pub rows_changed: u64,
    /// Value changes.
    pub value_changes: u64,
    /// Format changes.
    pub format_changes: u64,
    /// Formula changes.
    pub formula_changes: u64,
    /// Note changes.
    pub note_changes: u64,
    /// True when the counts come from the estimate, not a comparison.
    pub estimated: bool,
}

impl DiffSummary {
    fn from_changes(changes: &[CellChange], rows: usize) -> Self {
        let mut summary = DiffSummary {
            cells_changed: changes.len() as u64,
            rows_changed: rows as u64,
            ..Default::default()
        };
        for change in changes {
            match change.change_type {
                ChangeType::Value => summary.value_changes += 1,
                ChangeType::Format => summary.format_changes += 1,
                ChangeType::Formula => summary.formula_changes += 1,
                ChangeType::Note => summary.note_changes += 1,
            }
        }
        summary
    }
}

/// Shape and checksum of a sheet at one point in time.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct GridStats {
    /// Rows.
    pub row_count: u32,
    /// Columns.
    pub column_count: u32,
    /// Checksum.
    pub checksum: u32,
}

impl From<&DocumentFingerprint> for GridStats {
    fn from(fp: &DocumentFingerprint) -> Self {
        Self {
            row_count: fp.row_count,
            column_count: fp.column_count,
            checksum: fp.checksum,
        }
    }
}

/// Report detail level.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TierKind {
    /// Every changed cell.
    Full,
    /// Sampled rows.
    Sample,
    /// Counts and checksums.
    Metadata,
}

/// A change report.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "tier", rename_all = "snake_case")]
pub enum DiffTier {
    /// Counts and checksums before and after.
    Metadata {
        /// Before the write.
        before: GridStats,
        /// After the write.
        after: GridStats,
        /// Estimated counts.
        summary: DiffSummary,
    },
    /// Sampled changed rows.
    Sample {
        /// First changed rows.
        first_rows: Vec<RowChange>,
        /// Last changed rows.
        last_rows: Vec<RowChange>,
        /// Randomly sampled rows in between, top to bottom.
        random_rows: Vec<RowChange>,
        /// Counts over every changed row.
        summary: DiffSummary,
    },
    /// Every changed cell.
    Full {
        /// Changes, row-major.
        changes: Vec<CellChange>,
        /// Counts.
        summary: DiffSummary,
    },
}

impl DiffTier {
    /// The tier of this report.
    #[must_use]
    pub fn kind(&self) -> TierKind {
        match self {
            DiffTier::Metadata { .. } => TierKind::Metadata,
            DiffTier::Sample { .. } => TierKind::Sample,
            DiffTier::Full { .. } => TierKind::Full,
        }
    }

    /// The report's summary.
    #[must_use]
    pub fn summary(&self) -> &DiffSummary {
        match self {
            DiffTier::Metadata { summary, .. }
            | DiffTier::Sample { summary, .. }
            | DiffTier::Full { summary, .. } => summary,
        }
    }
}

/// One side of a comparison.
#[derive(Debug, Clone, PartialEq)]
pub struct DiffInput {
    /// Document fingerprint.
    pub fingerprint: DocumentFingerprint,
    /// Captured cells of the target range, when read.
    pub cells: Option<CellGrid>,
    /// Cells the executor reported touching (after side only).
    pub updated_cells: u64,
}

impl DiffInput {
    /// An input with no captured cells.
    #[must_use]
    pub fn metadata(fingerprint: DocumentFingerprint) -> Self {
        Self {
            fingerprint,
            cells: None,
            updated_cells: 0,
        }
    }

    /// An input with captured cells.
    #[must_use]
    pub fn with_cells(fingerprint: DocumentFingerprint, cells: Option<CellGrid>) -> Self {
        Self {
            fingerprint,
            cells,
            updated_cells: 0,
        }
    }

    /// Sets the executor-reported count.
    #[must_use]
    pub fn updated(mut self, cells: u64) -> Self {
        self.updated_cells = cells;
        self
    }
}

/// The diff engine.
#[derive(Debug, Clone)]
pub struct DiffEngine {
    config: DiffConfig,
}

impl DiffEngine {
    /// Creates an engine.
    #[must_use]
    pub fn new(config: DiffConfig) -> Self {
        Self { config }
    }

    /// Chooses the tier for an affected-cell count.
    #[must_use]
    pub fn select_tier(&self, count: u64) -> TierKind {
        if count <= self.config.full_max_cells {
            TierKind::Full
        } else if count <= self.config.sample_max_cells {
            TierKind::Sample
        } else {
            TierKind::Metadata
        }
    }

    /// Builds the change report for one mutation.
    pub fn compute(
        &self,
        before: &DiffInput,
        after: &DiffInput,
        estimate: &EffectEstimate,
        op_id: OpId,
        cancel: &CancellationToken,
    ) -> GuardResult<DiffTier> {
        let count = estimate.cells_affected.max(after.updated_cells);
        let tier = self.select_tier(count);

        let (Some(old), Some(new)) = (&before.cells, &after.cells) else {
            return Ok(Self::metadata(before, after, estimate, count));
        };
        if tier == TierKind::Metadata {
            return Ok(Self::metadata(before, after, estimate, count));
        }

        let rows = Self::changed_rows(old, new, cancel)?;
        let all: Vec<CellChange> = rows.iter().flat_map(|r| r.changes.iter().cloned()).collect();
        let summary = DiffSummary::from_changes(&all, rows.len());

        if tier == TierKind::Full {
            return Ok(DiffTier::Full {
                changes: all,
                summary,
            });
        }

        let edge = self.config.sample_edge_rows;
        let (first_rows, last_rows, random_rows) = if rows.len() <= edge * 2 {
            let split = rows.len().min(edge);
            (rows[..split].to_vec(), rows[split..].to_vec(), Vec::new())
        } else {
            let middle = &rows[edge..rows.len() - edge];
            let amount = self.config.sample_random_rows.min(middle.len());
            let mut rng = StdRng::seed_from_u64(op_id.as_u64());
            let mut picked = rand::seq::index::sample(&mut rng, middle.len(), amount).into_vec();
            picked.sort_unstable();
            (
                rows[..edge].to_vec(),
                rows[rows.len() - edge..].to_vec(),
                picked.into_iter().map(|i| middle[i].clone()).collect(),
            )
        };

        Ok(DiffTier::Sample {
            first_rows,
            last_rows,
            random_rows,
            summary,
        })
    }

    /// Builds a metadata-only report.
    #[must_use]
    pub fn metadata_only(before: &DiffInput, after: &DiffInput, estimate: &EffectEstimate) -> DiffTier {
        let count = estimate.cells_affected.max(after.updated_cells);
        Self::metadata(before, after, estimate, count)
    }

    fn metadata(
        before: &DiffInput,
        after: &DiffInput,
        estimate: &EffectEstimate,
        count: u64,
    ) -> DiffTier {
        DiffTier::Metadata {
            before: GridStats::from(&before.fingerprint),
            after: GridStats::from(&after.fingerprint),
            summary: DiffSummary {
                cells_changed: count,
                rows_changed: estimate.rows_affected,
                estimated: true,
                ..Default::default()
            },
        }
    }

    /// Compares two captures over the union of their rectangles.
    fn changed_rows(
        before: &CellGrid,
        after: &CellGrid,
        cancel: &CancellationToken,
    ) -> GuardResult<Vec<RowChange>> {
        let area = union(before.rect(), after.rect());
        let mut rows: BTreeMap<u32, Vec<CellChange>> = BTreeMap::new();

        for r in area.row..area.row + area.height {
            if cancel.is_cancelled() {
                return Err(GuardError::Cancelled);
            }
            for c in area.col..area.col + area.width {
                let at = CellRef::new(r, c);
                let old = before.get_or_blank(at);
                let new = after.get_or_blank(at);
                if let Some(change_type) = ChangeType::classify(&old, &new) {
                    rows.entry(r).or_default().push(CellChange {
                        cell: at,
                        before: old,
                        after: new,
                        change_type,
                    });
                }
            }
        }

        Ok(rows
            .into_iter()
            .map(|(row, changes)| RowChange { row, changes })
            .collect())
    }
}

fn union(a: GridRect, b: GridRect) -> GridRect {
    if a.is_empty() {
        return b;
    }
    if b.is_empty() {
        return a;
    }
    let row = a.row.min(b.row);
    let col = a.col.min(b.col);
    let bottom = (a.row + a.height).max(b.row + b.height);
    let right = (a.col + a.width).max(b.col + b.width);
    GridRect::new(row, col, bottom - row, right - col)
}

#[cfg(test)]
mod tests {
    use super::*;
    use sheetguard_common::types::DocumentVersion;

    fn engine() -> DiffEngine {
        DiffEngine::new(DiffConfig {
            full_max_cells: 10,
            sample_max_cells: 200,
            sample_edge_rows: 2,
            sample_random_rows: 2,
        })
    }

    fn fingerprint(version: u64, checksum: u32) -> DocumentFingerprint {
        DocumentFingerprint {
            version: DocumentVersion::new(version),
            row_count: 50,
            column_count: 4,
            sheet_title: "Sheet1".into(),
            checksum,
            checksum_range: None,
            first_row_values: Vec::new(),
        }
    }

    fn column(rows: u32, value: impl Fn(u32) -> Cell) -> CellGrid {
        CellGrid::new(
            None,
            CellRef::new(0, 0),
            (0..rows).map(|r| vec![value(r)]).collect(),
        )
    }

    fn estimate(cells: u64) -> EffectEstimate {
        EffectEstimate {
            cells_affected: cells,
            rows_affected: cells,
            columns_affected: 1,
            range_is_explicit: true,
            resolved_sheet: None,
        }
    }

    #[test]
    fn test_tier_selection_is_monotonic() {
        let engine = engine();
        let mut last = TierKind::Full;
        for count in 0..500 {
            let tier = engine.select_tier(count);
            assert!(tier >= last, "tier went back at {count}");
            last = tier;
        }
        assert_eq!(engine.select_tier(10), TierKind::Full);
        assert_eq!(engine.select_tier(11), TierKind::Sample);
        assert_eq!(engine.select_tier(201), TierKind::Metadata);
    }

    #[test]
    fn test_classification_priority() {
        let plain = Cell::number(1.0);
        let mut formula = Cell::number(2.0);
        formula.formula = Some("=A1+1".into());
        assert_eq!(ChangeType::classify(&plain, &formula), Some(ChangeType::Formula));

        let mut formatted = plain.clone();
        formatted.format = Some("0.00".into());
        assert_eq!(ChangeType::classify(&plain, &formatted), Some(ChangeType::Format));

        let mut noted = plain.clone();
        noted.note = Some("check".into());
        assert_eq!(ChangeType::classify(&plain, &noted), Some(ChangeType::Note));
        assert_eq!(ChangeType::classify(&plain, &Cell::number(3.0)), Some(ChangeType::Value));
        assert_eq!(ChangeType::classify(&plain, &plain), None);
    }

    #[test]
    fn test_full_lists_every_change() {
        let before = DiffInput::with_cells(fingerprint(1, 1), Some(column(4, |_| Cell::number(0.0))));
        let after = DiffInput::with_cells(
            fingerprint(2, 2),
            Some(column(4, |r| Cell::number(if r % 2 == 0 { 9.0 } else { 0.0 }))),
        );
        let diff = engine()
            .compute(&before, &after, &estimate(4), OpId::new(1), &CancellationToken::new())
            .unwrap();
        match diff {
            DiffTier::Full { changes, summary } => {
                assert_eq!(changes.len(), 2);
                assert_eq!(changes[1].cell, CellRef::new(2, 0));
                assert_eq!(summary.value_changes, 2);
                assert!(!summary.estimated);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_sample_is_deterministic_per_op() {
        let before = DiffInput::with_cells(fingerprint(1, 1), Some(column(40, |_| Cell::default())));
        let after = DiffInput::with_cells(
            fingerprint(2, 2),
            Some(column(40, |r| Cell::number(f64::from(r)))),
        );
        let run = |op| {
            engine()
                .compute(&before, &after, &estimate(40), OpId::new(op), &CancellationToken::new())
                .unwrap()
        };

        let first = run(7);
        assert_eq!(first, run(7));
        match first {
            DiffTier::Sample {
                first_rows,
                last_rows,
                random_rows,
                summary,
            } => {
                // Blank to a number is a value change, so every row changed.
                assert_eq!(summary.rows_changed, 40);
                assert_eq!(first_rows.iter().map(|r| r.row).collect::<Vec<_>>(), vec![0, 1]);
                assert_eq!(last_rows.iter().map(|r| r.row).collect::<Vec<_>>(), vec![38, 39]);
                assert_eq!(random_rows.len(), 2);
                assert!(random_rows.iter().all(|r| (2..38).contains(&r.row)));
                assert!(random_rows[0].row < random_rows[1].row);
            }
            other => panic!("unexpected {other:?}"),
        }
    }

    #[test]
    fn test_metadata_when_large_or_unread() {
        let before = DiffInput::metadata(fingerprint(1, 10));
        let after = DiffInput::metadata(fingerprint(2, 20)).updated(3);
        let diff = engine()
            .compute(&before, &after, &estimate(3), OpId::new(1), &CancellationToken::new())
            .unwrap();
        match diff {
            DiffTier::Metadata {
                before,
                after,
                summary,
            } => {
                assert_eq!(before.checksum, 10);
                assert_eq!(after.checksum, 20);
                assert!(summary.estimated);
                assert_eq!(summary.cells_changed, 3);
            }
            other => panic!("unexpected {other:?}"),
        }

        // The executor's count can push a report past the sample ceiling.
        let grid = Some(column(2, |_| Cell::default()));
        let before = DiffInput::with_cells(fingerprint(1, 1), grid.clone());
        let after = DiffInput::with_cells(fingerprint(2, 2), grid).updated(5000);
        let diff = engine()
            .compute(&before, &after, &estimate(2), OpId::new(1), &CancellationToken::new())
            .unwrap();
        assert_eq!(diff.kind(), TierKind::Metadata);
    }

    #[test]
    fn test_cancelled_comparison() {
        let cancel = CancellationToken::new();
        cancel.cancel();
        let grid = Some(column(3, |_| Cell::default()));
        let before = DiffInput::with_cells(fingerprint(1, 1), grid.clone());
        let after = DiffInput::with_cells(fingerprint(2, 2), grid);
        let err = engine()
            .compute(&before, &after, &estimate(3), OpId::new(1), &cancel)
            .unwrap_err();
        assert!(matches!(err, GuardError::Cancelled));
    }
}
