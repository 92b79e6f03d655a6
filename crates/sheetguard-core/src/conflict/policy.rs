//! Conflict severity and strategy policy.

use std::fmt;

use serde::{Deserialize, Serialize};

use sheetguard_common::types::{CellGrid, CellRef, GridRect};

/// How a conflict came about.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ConflictType {
    /// The caller and another writer both wrote the range.
    ConcurrentWrite,
    /// The version moved but no overlapping write is known.
    VersionMismatch,
    /// Content changed without the version moving, or a write was partial.
    DataRace,
}

impl fmt::Display for ConflictType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ConflictType::ConcurrentWrite => write!(f, "concurrent_write"),
            ConflictType::VersionMismatch => write!(f, "version_mismatch"),
            ConflictType::DataRace => write!(f, "data_race"),
        }
    }
}

/// How bad a conflict is.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    /// Informational.
    Low,
    /// Resolvable automatically.
    Medium,
    /// Needs a decision.
    High,
    /// Data may already be wrong.
    Critical,
}

/// How to settle a conflict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ResolutionStrategy {
    /// Write the caller's value back.
    KeepLocal,
    /// Keep the other writer's value.
    KeepRemote,
    /// Combine cell-wise against the pre-write base.
    Merge,
    /// Write a caller-supplied value.
    Manual,
}

impl fmt::Display for ResolutionStrategy {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ResolutionStrategy::KeepLocal => write!(f, "keep_local"),
            ResolutionStrategy::KeepRemote => write!(f, "keep_remote"),
            ResolutionStrategy::Merge => write!(f, "merge"),
            ResolutionStrategy::Manual => write!(f, "manual"),
        }
    }
}

/// The values a policy sees.
#[derive(Debug, Clone, Copy)]
pub struct ConflictValues<'a> {
    /// Before the caller's write.
    pub base: Option<&'a CellGrid>,
    /// The caller's write.
    pub local: Option<&'a CellGrid>,
    /// The live range.
    pub remote: Option<&'a CellGrid>,
}

/// Decides severity and the suggested strategy of a detected conflict.
pub trait ConflictPolicy: Send + Sync {
    /// Assesses one conflict.
    fn assess(&self, kind: ConflictType, values: ConflictValues<'_>) -> (Severity, ResolutionStrategy);
}

/// Suggests `merge` for disjoint cell changes and `manual` when both
/// sides changed the same cell differently.
#[derive(Debug, Clone, Copy, Default)]
pub struct DefaultConflictPolicy;

impl ConflictPolicy for DefaultConflictPolicy {
    fn assess(&self, kind: ConflictType, values: ConflictValues<'_>) -> (Severity, ResolutionStrategy) {
        match kind {
            ConflictType::VersionMismatch => (Severity::Low, ResolutionStrategy::KeepRemote),
            ConflictType::DataRace => (Severity::Critical, ResolutionStrategy::Manual),
            ConflictType::ConcurrentWrite => match three_way_merge(values) {
                Ok(_) => (Severity::Medium, ResolutionStrategy::Merge),
                Err(_) => (Severity::High, ResolutionStrategy::Manual),
            },
        }
    }
}

/// Why values could not be merged.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeError {
    /// Base, local or remote was not captured.
    MissingValues,
    /// Cells both sides changed to different contents.
    Clashes(Vec<CellRef>),
}

/// Merges local and remote changes cell by cell over the remote range.
///
/// A cell conflicts when local and remote both differ from the base and
/// from each other. Cells outside the local capture count as unchanged
/// locally.
pub fn three_way_merge(values: ConflictValues<'_>) -> Result<CellGrid, MergeError> {
    let (Some(base), Some(local), Some(remote)) = (values.base, values.local, values.remote) else {
        return Err(MergeError::MissingValues);
    };

    let area: GridRect = remote.rect();
    let local_area = local.rect();
    let mut clashes = Vec::new();
    let mut rows = Vec::with_capacity(area.height as usize);

    for r in 0..area.height {
        let mut row = Vec::with_capacity(area.width as usize);
        for c in 0..area.width {
            let at = CellRef::new(area.row + r, area.col + c);
            let theirs = remote.get_or_blank(at);
            if !local_area.contains(at) {
                row.push(theirs);
                continue;
            }
            let ours = local.get_or_blank(at);
            let original = base.get_or_blank(at);
            let merged = if ours == theirs || ours == original {
                theirs
            } else if theirs == original {
                ours
            } else {
                clashes.push(at);
                theirs
            };
            row.push(merged);
        }
        rows.push(row);
    }

    if clashes.is_empty() {
        Ok(CellGrid::new(
            remote.sheet.clone(),
            CellRef::new(area.row, area.col),
            rows,
        ))
    } else {
        Err(MergeError::Clashes(clashes))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn grid(values: &[Vec<serde_json::Value>]) -> CellGrid {
        CellGrid::from_json_rows(Some("Sheet1".into()), CellRef::new(0, 0), values)
    }

    #[test]
    fn test_disjoint_changes_merge() {
        let base = grid(&[vec![json!(1), json!(2)]]);
        let local = grid(&[vec![json!(10), json!(2)]]);
        let remote = grid(&[vec![json!(1), json!(20)]]);
        let values = ConflictValues {
            base: Some(&base),
            local: Some(&local),
            remote: Some(&remote),
        };
        let merged = three_way_merge(values).unwrap();
        assert_eq!(merged, grid(&[vec![json!(10), json!(20)]]));
        assert_eq!(
            DefaultConflictPolicy.assess(ConflictType::ConcurrentWrite, values),
            (Severity::Medium, ResolutionStrategy::Merge)
        );
    }

    #[test]
    fn test_same_cell_clash() {
        let base = grid(&[vec![json!(1)]]);
        let local = grid(&[vec![json!(2)]]);
        let remote = grid(&[vec![json!(3)]]);
        let values = ConflictValues {
            base: Some(&base),
            local: Some(&local),
            remote: Some(&remote),
        };
        assert_eq!(
            three_way_merge(values),
            Err(MergeError::Clashes(vec![CellRef::new(0, 0)]))
        );
        assert_eq!(
            DefaultConflictPolicy.assess(ConflictType::ConcurrentWrite, values),
            (Severity::High, ResolutionStrategy::Manual)
        );
    }

    #[test]
    fn test_identical_changes_do_not_clash() {
        let base = grid(&[vec![json!(1)]]);
        let both = grid(&[vec![json!(5)]]);
        let values = ConflictValues {
            base: Some(&base),
            local: Some(&both),
            remote: Some(&both),
        };
        assert_eq!(three_way_merge(values).unwrap(), both);
    }

    #[test]
    fn test_other_kinds() {
        let none = ConflictValues {
            base: None,
            local: None,
            remote: None,
        };
        assert_eq!(
            DefaultConflictPolicy.assess(ConflictType::VersionMismatch, none).1,
            ResolutionStrategy::KeepRemote
        );
        assert_eq!(
            DefaultConflictPolicy.assess(ConflictType::DataRace, none).0,
            Severity::Critical
        );
        assert_eq!(three_way_merge(none), Err(MergeError::MissingValues));
    }
}
