//! Operation descriptors and executor results.
//!
//! A mutation reaches the executor as an [`OpDescriptor`]: an action name,
//! an [`EffectShape`] describing which cells it can touch, and an opaque
//! JSON payload only the executor interprets. The shape is all the safety
//! layer needs to estimate blast radius and pick a diff range.

use serde::{Deserialize, Serialize};
use std::fmt;

use sheetguard_common::types::{
    A1Range, CellGrid, CellRef, DocumentFingerprint, DocumentId, Extent, OpId,
};

/// A row or column axis.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Dimension {
    /// Rows.
    Rows,
    /// Columns.
    Columns,
}

impl fmt::Display for Dimension {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Dimension::Rows => write!(f, "rows"),
            Dimension::Columns => write!(f, "columns"),
        }
    }
}

/// How an operation's effect is estimated.
///
/// The set is closed: every action an executor supports maps onto one of
/// these shapes.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum EffectShape {
    /// A `rows` x `columns` payload written at the origin of `range`.
    Payload {
        /// Anchor (and sheet) of the write.
        range: A1Range,
        /// Payload rows.
        rows: u32,
        /// Widest payload row.
        columns: u32,
    },
    /// Every cell of `range`.
    Range {
        /// The affected range.
        range: A1Range,
    },
    /// Whole rows or columns inserted or removed.
    Dimension {
        /// Sheet, `None` for the default sheet.
        #[serde(default, skip_serializing_if = "Option::is_none")]
        sheet: Option<String>,
        /// Axis.
        dimension: Dimension,
        /// First index (zero-based).
        start: u32,
        /// Number of rows or columns.
        count: u32,
    },
    /// An entire sheet.
    Sheet {
        /// The sheet.
        sheet: String,
    },
    /// No cells (renames, sharing, metadata).
    NoCells,
}

impl EffectShape {
    /// The sheet the shape names, if any.
    #[must_use]
    pub fn sheet(&self) -> Option<&str> {
        match self {
            EffectShape::Payload { range, .. } | EffectShape::Range { range } => {
                range.sheet.as_deref()
            }
            EffectShape::Dimension { sheet, .. } => sheet.as_deref(),
            EffectShape::Sheet { sheet } => Some(sheet),
            EffectShape::NoCells => None,
        }
    }

    /// The range whose cells the operation can change.
    #[must_use]
    pub fn target(&self) -> Option<A1Range> {
        match self {
            EffectShape::Payload {
                range,
                rows,
                columns,
            } => {
                if *rows == 0 || *columns == 0 {
                    return Some(range.clone());
                }
                let origin = range.origin();
                let end = CellRef::new(
                    origin.row.saturating_add(rows - 1),
                    origin.col.saturating_add(columns - 1),
                );
                Some(A1Range::cells(range.sheet.as_deref(), origin, end))
            }
            EffectShape::Range { range } => Some(range.clone()),
            EffectShape::Dimension {
                sheet,
                dimension,
                start,
                count,
            } => {
                let end = start.saturating_add(count.saturating_sub(1));
                let extent = match dimension {
                    Dimension::Rows => Extent::Rows { start: *start, end },
                    Dimension::Columns => Extent::Columns { start: *start, end },
                };
                Some(A1Range {
                    sheet: sheet.clone(),
                    extent,
                })
            }
            EffectShape::Sheet { sheet } => Some(A1Range::whole_sheet(sheet.clone())),
            EffectShape::NoCells => None,
        }
    }

    /// Returns the same shape with its sheet replaced.
    #[must_use]
    pub fn with_sheet(&self, name: &str) -> Self {
        match self {
            EffectShape::Payload {
                range,
                rows,
                columns,
            } => EffectShape::Payload {
                range: range.with_sheet(name),
                rows: *rows,
                columns: *columns,
            },
            EffectShape::Range { range } => EffectShape::Range {
                range: range.with_sheet(name),
            },
            EffectShape::Dimension {
                dimension,
                start,
                count,
                ..
            } => EffectShape::Dimension {
                sheet: Some(name.to_string()),
                dimension: *dimension,
                start: *start,
                count: *count,
            },
            EffectShape::Sheet { .. } => EffectShape::Sheet {
                sheet: name.to_string(),
            },
            EffectShape::NoCells => EffectShape::NoCells,
        }
    }
}

/// A mutation as the executor sees it.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct OpDescriptor {
    /// Action name, e.g. `write_range`.
    pub action: String,
    /// Effect estimation strategy.
    pub shape: EffectShape,
    /// Action-specific arguments.
    #[serde(default)]
    pub payload: serde_json::Value,
}

impl OpDescriptor {
    /// Creates a descriptor with an empty payload.
    pub fn new(action: impl Into<String>, shape: EffectShape) -> Self {
        Self {
            action: action.into(),
            shape,
            payload: serde_json::Value::Null,
        }
    }

    /// Sets the payload.
    #[must_use]
    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }
}

/// An opaque instruction that undoes one mutation.
///
/// Produced by the executor when it applies a mutation, stored in history,
/// and handed back to the same executor for undo or rollback.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct InverseOp(pub serde_json::Value);

/// Key identifying one logical mutation across retries.
///
/// # Example
///
/// ```rust
/// use sheetguard_common::types::{DocumentId, OpId};
/// use sheetguard_executor::{EffectShape, IdempotencyKey, OpDescriptor};
///
/// let op = OpDescriptor::new("rename_sheet", EffectShape::NoCells);
/// let a = IdempotencyKey::derive(&DocumentId::new("S1"), OpId::new(1), &op);
/// let b = IdempotencyKey::derive(&DocumentId::new("S1"), OpId::new(1), &op);
/// assert_eq!(a, b);
/// ```
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct IdempotencyKey(u32);

impl IdempotencyKey {
    /// CRC32 over the document id, op id and serialized descriptor.
    #[must_use]
    pub fn derive(document: &DocumentId, op_id: OpId, op: &OpDescriptor) -> Self {
        Self::for_generation(document, op_id, 0, op)
    }

    /// Key for the `generation`-th application of the same operation.
    ///
    /// Redoing an undone operation applies it again; each application needs
    /// its own key so a lookup never finds the earlier one. Generation 0 is
    /// [`derive`](Self::derive).
    #[must_use]
    pub fn for_generation(
        document: &DocumentId,
        op_id: OpId,
        generation: u32,
        op: &OpDescriptor,
    ) -> Self {
        let body = serde_json::to_vec(op).unwrap_or_default();
        Self::hash(document, b"", op_id.as_u64(), generation, &body)
    }

    /// Key for undoing the `generation`-th application of an operation.
    ///
    /// Inverses are keyed apart from forward writes, so a lookup for an
    /// undo never finds the write it reverses.
    #[must_use]
    pub fn for_inverse(
        document: &DocumentId,
        op_id: OpId,
        generation: u32,
        inverse: &InverseOp,
    ) -> Self {
        let body = serde_json::to_vec(&inverse.0).unwrap_or_default();
        Self::hash(document, b"inverse", op_id.as_u64(), generation, &body)
    }

    /// Key for a literal cell write tagged with a caller sequence number.
    #[must_use]
    pub fn for_cells(document: &DocumentId, seq: u64, cells: &CellGrid) -> Self {
        let body = serde_json::to_vec(cells).unwrap_or_default();
        Self::hash(document, b"cells", seq, 0, &body)
    }

    fn hash(document: &DocumentId, domain: &[u8], seq: u64, generation: u32, body: &[u8]) -> Self {
        let mut hasher = crc32fast::Hasher::new();
        hasher.update(document.as_str().as_bytes());
        hasher.update(&[0]);
        if !domain.is_empty() {
            hasher.update(domain);
            hasher.update(&[0]);
        }
        hasher.update(&seq.to_le_bytes());
        if generation > 0 {
            hasher.update(&generation.to_le_bytes());
        }
        hasher.update(body);
        Self(hasher.finalize())
    }

    /// Returns the raw key.
    #[must_use]
    pub const fn as_u32(self) -> u32 {
        self.0
    }
}

impl fmt::Debug for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "IdempotencyKey({:08x})", self.0)
    }
}

impl fmt::Display for IdempotencyKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{:08x}", self.0)
    }
}

/// Executor-side reference to a document copy.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct SnapshotHandle(String);

impl SnapshotHandle {
    /// Creates a handle.
    pub fn new(handle: impl Into<String>) -> Self {
        Self(handle.into())
    }

    /// Returns the handle as a string slice.
    #[must_use]
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for SnapshotHandle {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

/// What the executor reports after applying a mutation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ExecutorResult {
    /// Fingerprint of the document after the write.
    pub fingerprint: DocumentFingerprint,
    /// Cells the executor actually touched.
    pub updated_cells: u64,
    /// How to undo the write, when the executor can.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub inverse: Option<InverseOp>,
    /// Action-specific response body.
    #[serde(default)]
    pub detail: serde_json::Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn range(s: &str) -> A1Range {
        s.parse().unwrap()
    }

    #[test]
    fn test_payload_target() {
        let shape = EffectShape::Payload {
            range: range("Sheet1!B2"),
            rows: 3,
            columns: 2,
        };
        assert_eq!(shape.target().unwrap().to_string(), "Sheet1!B2:C4");
        assert_eq!(shape.sheet(), Some("Sheet1"));
    }

    #[test]
    fn test_dimension_target() {
        let shape = EffectShape::Dimension {
            sheet: Some("Data".into()),
            dimension: Dimension::Rows,
            start: 4,
            count: 2,
        };
        assert_eq!(shape.target().unwrap().to_string(), "Data!5:6");
        assert_eq!(EffectShape::NoCells.target(), None);
    }

    #[test]
    fn test_with_sheet() {
        let shape = EffectShape::Range {
            range: range("sheet1!A1:A3"),
        };
        assert_eq!(shape.with_sheet("Sheet1").sheet(), Some("Sheet1"));
    }

    #[test]
    fn test_idempotency_key_depends_on_every_input() {
        let doc = DocumentId::new("S1");
        let op = OpDescriptor::new("write_range", EffectShape::NoCells)
            .with_payload(json!({"values": [[1]]}));
        let base = IdempotencyKey::derive(&doc, OpId::new(1), &op);

        assert_ne!(base, IdempotencyKey::derive(&DocumentId::new("S2"), OpId::new(1), &op));
        assert_ne!(base, IdempotencyKey::derive(&doc, OpId::new(2), &op));
        let other = op.clone().with_payload(json!({"values": [[2]]}));
        assert_ne!(base, IdempotencyKey::derive(&doc, OpId::new(1), &other));
        assert_eq!(base, IdempotencyKey::for_generation(&doc, OpId::new(1), 0, &op));
        assert_ne!(base, IdempotencyKey::for_generation(&doc, OpId::new(1), 1, &op));

        let inverse = InverseOp(json!({"values": [[1]]}));
        let undo = IdempotencyKey::for_inverse(&doc, OpId::new(1), 0, &inverse);
        assert_ne!(undo, base);
        assert_ne!(undo, IdempotencyKey::for_inverse(&doc, OpId::new(1), 1, &inverse));
        assert_eq!(undo, IdempotencyKey::for_inverse(&doc, OpId::new(1), 0, &inverse));
    }

    #[test]
    fn test_shape_serde_tag() {
        let shape = EffectShape::Sheet {
            sheet: "Summary".into(),
        };
        let value = serde_json::to_value(&shape).unwrap();
        assert_eq!(value, json!({"kind": "sheet", "sheet": "Summary"}));
    }
}
