//! Cell contents and rectangular cell captures.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::range::{A1Range, CellRef, GridRect};

/// The computed value held by a cell.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
#[serde(tag = "type", content = "value", rename_all = "snake_case")]
pub enum CellValue {
    /// No value.
    #[default]
    Empty,
    /// Boolean value.
    Bool(bool),
    /// Numeric value.
    Number(f64),
    /// Text value.
    Text(String),
}

impl CellValue {
    /// Returns true if the value is empty.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        matches!(self, CellValue::Empty)
    }

    /// Converts a JSON scalar into a cell value.
    ///
    /// Nulls become `Empty`; arrays and objects are stored as their JSON
    /// text, the way the document store renders them.
    #[must_use]
    pub fn from_json(value: &serde_json::Value) -> Self {
        match value {
            serde_json::Value::Null => CellValue::Empty,
            serde_json::Value::Bool(b) => CellValue::Bool(*b),
            serde_json::Value::Number(n) => n
                .as_f64()
                .map_or_else(|| CellValue::Text(n.to_string()), CellValue::Number),
            serde_json::Value::String(s) if s.is_empty() => CellValue::Empty,
            serde_json::Value::String(s) => CellValue::Text(s.clone()),
            other => CellValue::Text(other.to_string()),
        }
    }
}

impl fmt::Display for CellValue {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            CellValue::Empty => Ok(()),
            CellValue::Bool(b) => write!(f, "{}", if *b { "TRUE" } else { "FALSE" }),
            CellValue::Number(n) => write!(f, "{}", n),
            CellValue::Text(s) => f.write_str(s),
        }
    }
}

/// A single cell: value plus the attributes a diff distinguishes.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Cell {
    /// Computed value.
    #[serde(default)]
    pub value: CellValue,
    /// Formula text, if the cell holds one.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub formula: Option<String>,
    /// Number/text format descriptor.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub format: Option<String>,
    /// Attached note.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub note: Option<String>,
}

impl Cell {
    /// A cell holding only a value.
    #[must_use]
    pub fn value(value: CellValue) -> Self {
        Self {
            value,
            ..Default::default()
        }
    }

    /// A cell holding text.
    pub fn text(text: impl Into<String>) -> Self {
        Self::value(CellValue::Text(text.into()))
    }

    /// A cell holding a number.
    #[must_use]
    pub fn number(n: f64) -> Self {
        Self::value(CellValue::Number(n))
    }

    /// Returns true if the cell carries nothing at all.
    #[must_use]
    pub fn is_blank(&self) -> bool {
        self.value.is_empty()
            && self.formula.is_none()
            && self.format.is_none()
            && self.note.is_none()
    }

    /// Feeds the cell's contents into a checksum.
    pub fn hash_into(&self, hasher: &mut crc32fast::Hasher) {
        hasher.update(self.value.to_string().as_bytes());
        hasher.update(&[0x1f]);
        for part in [&self.formula, &self.format, &self.note] {
            if let Some(s) = part {
                hasher.update(s.as_bytes());
            }
            hasher.update(&[0x1f]);
        }
        hasher.update(&[0x1e]);
    }
}

/// A rectangular capture of cells anchored at `origin`.
///
/// Row vectors may be shorter than the widest row; missing cells read as
/// blank.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct CellGrid {
    /// Sheet the cells came from (`None` for the default sheet).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sheet: Option<String>,
    /// Top-left coordinate.
    pub origin: CellRef,
    /// Cells, row-major.
    pub rows: Vec<Vec<Cell>>,
}

impl CellGrid {
    /// Creates a grid.
    #[must_use]
    pub fn new(sheet: Option<String>, origin: CellRef, rows: Vec<Vec<Cell>>) -> Self {
        Self {
            sheet,
            origin,
            rows,
        }
    }

    /// Builds a grid of text/number values from JSON rows.
    #[must_use]
    pub fn from_json_rows(sheet: Option<String>, origin: CellRef, rows: &[Vec<serde_json::Value>]) -> Self {
        let rows = rows
            .iter()
            .map(|row| {
                row.iter()
                    .map(|v| match v {
                        serde_json::Value::String(s) if s.starts_with('=') => Cell {
                            formula: Some(s.clone()),
                            ..Default::default()
                        },
                        other => Cell::value(CellValue::from_json(other)),
                    })
                    .collect()
            })
            .collect();
        Self::new(sheet, origin, rows)
    }

    /// Number of rows.
    #[must_use]
    pub fn height(&self) -> u32 {
        self.rows.len() as u32
    }

    /// Width of the widest row.
    #[must_use]
    pub fn width(&self) -> u32 {
        self.rows.iter().map(Vec::len).max().unwrap_or(0) as u32
    }

    /// The rectangle this grid covers.
    #[must_use]
    pub fn rect(&self) -> GridRect {
        GridRect::new(self.origin.row, self.origin.col, self.height(), self.width())
    }

    /// Returns the cell at an absolute coordinate, if it lies in the grid.
    #[must_use]
    pub fn get(&self, at: CellRef) -> Option<&Cell> {
        if at.row < self.origin.row || at.col < self.origin.col {
            return None;
        }
        self.rows
            .get((at.row - self.origin.row) as usize)
            .and_then(|row| row.get((at.col - self.origin.col) as usize))
    }

    /// Returns the cell at an absolute coordinate, treating anything outside
    /// the grid as blank.
    #[must_use]
    pub fn get_or_blank(&self, at: CellRef) -> Cell {
        self.get(at).cloned().unwrap_or_default()
    }

    /// CRC32 over the grid's cells, row by row.
    #[must_use]
    pub fn checksum(&self) -> u32 {
        let mut hasher = crc32fast::Hasher::new();
        let width = self.width();
        for r in 0..self.height() {
            for c in 0..width {
                let at = CellRef::new(self.origin.row + r, self.origin.col + c);
                self.get_or_blank(at).hash_into(&mut hasher);
            }
        }
        hasher.finalize()
    }

    /// The A1 range the grid covers, on its own sheet.
    #[must_use]
    pub fn range(&self) -> A1Range {
        let rect = self.rect();
        let end = CellRef::new(
            rect.row + rect.height.saturating_sub(1),
            rect.col + rect.width.saturating_sub(1),
        );
        A1Range::cells(self.sheet.as_deref(), self.origin, end)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_cell_value_from_json() {
        assert_eq!(CellValue::from_json(&json!(null)), CellValue::Empty);
        assert_eq!(CellValue::from_json(&json!("")), CellValue::Empty);
        assert_eq!(CellValue::from_json(&json!(1.5)), CellValue::Number(1.5));
        assert_eq!(CellValue::from_json(&json!(true)), CellValue::Bool(true));
        assert_eq!(CellValue::from_json(&json!("x")), CellValue::Text("x".into()));
    }

    #[test]
    fn test_grid_from_json_rows_detects_formulas() {
        let grid = CellGrid::from_json_rows(None, CellRef::new(0, 0), &[vec![json!(1), json!("=A1*2")]]);
        let formula = grid.get(CellRef::new(0, 1)).unwrap();
        assert_eq!(formula.formula.as_deref(), Some("=A1*2"));
        assert_eq!(grid.width(), 2);
    }

    #[test]
    fn test_grid_lookup_is_absolute() {
        let grid = CellGrid::new(None, CellRef::new(5, 2), vec![vec![Cell::text("a"), Cell::text("b")]]);
        assert_eq!(grid.get(CellRef::new(5, 3)), Some(&Cell::text("b")));
        assert_eq!(grid.get(CellRef::new(0, 0)), None);
        assert!(grid.get_or_blank(CellRef::new(6, 2)).is_blank());
    }

    #[test]
    fn test_checksum_reflects_content() {
        let a = CellGrid::new(None, CellRef::new(0, 0), vec![vec![Cell::number(1.0)]]);
        let mut b = a.clone();
        assert_eq!(a.checksum(), b.checksum());
        b.rows[0][0].note = Some("hi".into());
        assert_ne!(a.checksum(), b.checksum());
    }

    #[test]
    fn test_ragged_rows_read_as_blank() {
        let ragged = CellGrid::new(
            None,
            CellRef::new(0, 0),
            vec![vec![Cell::text("a"), Cell::text("b")], vec![Cell::text("c")]],
        );
        let padded = CellGrid::new(
            None,
            CellRef::new(0, 0),
            vec![
                vec![Cell::text("a"), Cell::text("b")],
                vec![Cell::text("c"), Cell::default()],
            ],
        );
        assert_eq!(ragged.checksum(), padded.checksum());
    }
}
