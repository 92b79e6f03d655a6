//! A1-notation ranges.
//!
//! Ranges identify the target of a mutation. They are parsed from the
//! familiar spreadsheet notation:
//!
//! | Input              | Extent                      |
//! |--------------------|-----------------------------|
//! | `Sheet1`           | whole sheet                 |
//! | `Sheet1!B3`        | single cell                 |
//! | `'My Sheet'!A1:C10`| cell rectangle              |
//! | `A:D`              | full columns (default sheet)|
//! | `3:7`              | full rows (default sheet)   |
//!
//! Rows and columns are stored zero-based; display is one-based as usual.

use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use thiserror::Error;

/// Error returned when a string is not valid A1 notation.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid A1 range '{input}': {reason}")]
pub struct RangeParseError {
    /// The rejected input.
    pub input: String,
    /// Why it was rejected.
    pub reason: &'static str,
}

impl RangeParseError {
    fn new(input: &str, reason: &'static str) -> Self {
        Self {
            input: input.to_string(),
            reason,
        }
    }
}

/// A single cell coordinate (zero-based).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct CellRef {
    /// Zero-based row index.
    pub row: u32,
    /// Zero-based column index.
    pub col: u32,
}

impl CellRef {
    /// Creates a cell reference.
    #[must_use]
    pub const fn new(row: u32, col: u32) -> Self {
        Self { row, col }
    }
}

impl fmt::Display for CellRef {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}{}", column_name(self.col), self.row + 1)
    }
}

/// Converts a zero-based column index into letters (`0 -> A`, `26 -> AA`).
#[must_use]
pub fn column_name(mut col: u32) -> String {
    let mut letters = Vec::new();
    loop {
        letters.push(b'A' + (col % 26) as u8);
        if col < 26 {
            break;
        }
        col = col / 26 - 1;
    }
    letters.reverse();
    String::from_utf8(letters).unwrap_or_default()
}

/// Converts column letters into a zero-based index.
fn parse_column(letters: &str) -> Option<u32> {
    if letters.is_empty() || letters.len() > 6 {
        return None;
    }
    let mut value: u32 = 0;
    for b in letters.bytes() {
        if !b.is_ascii_alphabetic() {
            return None;
        }
        value = value * 26 + u32::from(b.to_ascii_uppercase() - b'A' + 1);
    }
    Some(value - 1)
}

/// Converts a one-based row number into a zero-based index.
fn parse_row(digits: &str) -> Option<u32> {
    let n: u32 = digits.parse().ok()?;
    n.checked_sub(1)
}

fn parse_cell(text: &str) -> Option<CellRef> {
    let split = text.find(|c: char| c.is_ascii_digit())?;
    let (letters, digits) = text.split_at(split);
    Some(CellRef::new(parse_row(digits)?, parse_column(letters)?))
}

/// The portion of a sheet a range covers.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Extent {
    /// The entire sheet.
    Sheet,
    /// A rectangle of cells (inclusive corners).
    Cells {
        /// Top-left corner.
        start: CellRef,
        /// Bottom-right corner.
        end: CellRef,
    },
    /// Full rows, inclusive.
    Rows {
        /// First row.
        start: u32,
        /// Last row.
        end: u32,
    },
    /// Full columns, inclusive.
    Columns {
        /// First column.
        start: u32,
        /// Last column.
        end: u32,
    },
}

/// A resolved rectangle on a sheet of known size.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct GridRect {
    /// First row.
    pub row: u32,
    /// First column.
    pub col: u32,
    /// Number of rows.
    pub height: u32,
    /// Number of columns.
    pub width: u32,
}

impl GridRect {
    /// Creates a rectangle.
    #[must_use]
    pub const fn new(row: u32, col: u32, height: u32, width: u32) -> Self {
        Self {
            row,
            col,
            height,
            width,
        }
    }

    /// Number of cells covered.
    #[must_use]
    pub fn cell_count(&self) -> u64 {
        u64::from(self.height) * u64::from(self.width)
    }

    /// Returns true if the rectangle covers no cells.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.height == 0 || self.width == 0
    }

    /// Returns true if the cell lies inside the rectangle.
    #[must_use]
    pub fn contains(&self, cell: CellRef) -> bool {
        cell.row >= self.row
            && cell.row < self.row + self.height
            && cell.col >= self.col
            && cell.col < self.col + self.width
    }

    /// Returns the overlapping rectangle, if any.
    #[must_use]
    pub fn intersection(&self, other: &GridRect) -> Option<GridRect> {
        let row = self.row.max(other.row);
        let col = self.col.max(other.col);
        let row_end = (self.row + self.height).min(other.row + other.height);
        let col_end = (self.col + self.width).min(other.col + other.width);
        if row < row_end && col < col_end {
            Some(GridRect::new(row, col, row_end - row, col_end - col))
        } else {
            None
        }
    }
}

/// A parsed A1 range with an optional sheet qualifier.
///
/// # Example
///
/// ```rust
/// use sheetguard_common::types::A1Range;
///
/// let range: A1Range = "'Q1 Data'!A1:C10".parse().unwrap();
/// assert_eq!(range.sheet.as_deref(), Some("Q1 Data"));
/// assert_eq!(range.to_string(), "'Q1 Data'!A1:C10");
/// ```
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct A1Range {
    /// Sheet name; `None` means the document's default (first) sheet.
    pub sheet: Option<String>,
    /// What part of the sheet is covered.
    pub extent: Extent,
}

impl A1Range {
    /// A cell rectangle on the given sheet.
    pub fn cells(sheet: Option<&str>, start: CellRef, end: CellRef) -> Self {
        Self {
            sheet: sheet.map(str::to_string),
            extent: Extent::Cells {
                start: CellRef::new(start.row.min(end.row), start.col.min(end.col)),
                end: CellRef::new(start.row.max(end.row), start.col.max(end.col)),
            },
        }
    }

    /// The whole of a sheet.
    pub fn whole_sheet(sheet: impl Into<String>) -> Self {
        Self {
            sheet: Some(sheet.into()),
            extent: Extent::Sheet,
        }
    }

    /// Returns the same extent on another sheet.
    #[must_use]
    pub fn with_sheet(&self, sheet: impl Into<String>) -> Self {
        Self {
            sheet: Some(sheet.into()),
            extent: self.extent,
        }
    }

    /// Returns true unless the range resolves to an entire sheet.
    #[must_use]
    pub fn is_explicit(&self) -> bool {
        !matches!(self.extent, Extent::Sheet)
    }

    /// Resolves the range to a rectangle on a sheet of the given size.
    ///
    /// Cell rectangles are returned as written even when they extend past
    /// the sheet; full rows and columns are clipped to the sheet size.
    #[must_use]
    pub fn rect(&self, sheet_rows: u32, sheet_cols: u32) -> GridRect {
        match self.extent {
            Extent::Sheet => GridRect::new(0, 0, sheet_rows, sheet_cols),
            Extent::Cells { start, end } => GridRect::new(
                start.row,
                start.col,
                end.row - start.row + 1,
                end.col - start.col + 1,
            ),
            Extent::Rows { start, end } => {
                GridRect::new(start, 0, end - start + 1, sheet_cols)
            }
            Extent::Columns { start, end } => {
                GridRect::new(0, start, sheet_rows, end - start + 1)
            }
        }
    }

    /// Returns the top-left cell of the range.
    #[must_use]
    pub fn origin(&self) -> CellRef {
        match self.extent {
            Extent::Sheet => CellRef::new(0, 0),
            Extent::Cells { start, .. } => start,
            Extent::Rows { start, .. } => CellRef::new(start, 0),
            Extent::Columns { start, .. } => CellRef::new(0, start),
        }
    }

    /// Returns true if both ranges name the same sheet.
    ///
    /// Sheet names compare case-insensitively, as the document store does.
    #[must_use]
    pub fn same_sheet(&self, other: &A1Range) -> bool {
        match (&self.sheet, &other.sheet) {
            (Some(a), Some(b)) => a.eq_ignore_ascii_case(b),
            (None, None) => true,
            _ => false,
        }
    }

    /// Returns true if the ranges may share a cell on a sheet of the given size.
    #[must_use]
    pub fn overlaps(&self, other: &A1Range, sheet_rows: u32, sheet_cols: u32) -> bool {
        self.same_sheet(other)
            && self
                .rect(sheet_rows, sheet_cols)
                .intersection(&other.rect(sheet_rows, sheet_cols))
                .is_some()
    }

    fn parse_extent(input: &str, text: &str) -> Result<Extent, RangeParseError> {
        let (first, second) = match text.split_once(':') {
            Some((a, b)) => (a, b),
            None => (text, text),
        };

        if let (Some(a), Some(b)) = (parse_cell(first), parse_cell(second)) {
            return Ok(Extent::Cells {
                start: CellRef::new(a.row.min(b.row), a.col.min(b.col)),
                end: CellRef::new(a.row.max(b.row), a.col.max(b.col)),
            });
        }

        let all_digits = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_digit());
        let all_letters = |s: &str| !s.is_empty() && s.bytes().all(|b| b.is_ascii_alphabetic());

        if text.contains(':') && all_digits(first) && all_digits(second) {
            let a = parse_row(first).ok_or_else(|| RangeParseError::new(input, "row 0"))?;
            let b = parse_row(second).ok_or_else(|| RangeParseError::new(input, "row 0"))?;
            return Ok(Extent::Rows {
                start: a.min(b),
                end: a.max(b),
            });
        }

        if text.contains(':') && all_letters(first) && all_letters(second) {
            let a = parse_column(first)
                .ok_or_else(|| RangeParseError::new(input, "column out of range"))?;
            let b = parse_column(second)
                .ok_or_else(|| RangeParseError::new(input, "column out of range"))?;
            return Ok(Extent::Columns {
                start: a.min(b),
                end: a.max(b),
            });
        }

        Err(RangeParseError::new(input, "unrecognised cell reference"))
    }
}

fn needs_quotes(sheet: &str) -> bool {
    !sheet
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_')
        || parse_cell(sheet).is_some()
}

impl fmt::Display for A1Range {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(sheet) = &self.sheet {
            if needs_quotes(sheet) {
                write!(f, "'{}'", sheet.replace('\'', "''"))?;
            } else {
                f.write_str(sheet)?;
            }
            if matches!(self.extent, Extent::Sheet) {
                return Ok(());
            }
            f.write_str("!")?;
        }
        match self.extent {
            Extent::Sheet => Ok(()),
            Extent::Cells { start, end } if start == end => write!(f, "{}", start),
            Extent::Cells { start, end } => write!(f, "{}:{}", start, end),
            Extent::Rows { start, end } => write!(f, "{}:{}", start + 1, end + 1),
            Extent::Columns { start, end } => {
                write!(f, "{}:{}", column_name(start), column_name(end))
            }
        }
    }
}

impl FromStr for A1Range {
    type Err = RangeParseError;

    fn from_str(input: &str) -> Result<Self, Self::Err> {
        let text = input.trim();
        if text.is_empty() {
            return Err(RangeParseError::new(input, "empty range"));
        }

        let (sheet, reference) = match text.rfind('!') {
            Some(pos) => (Some(&text[..pos]), Some(&text[pos + 1..])),
            None => (None, Some(text)),
        };

        let sheet = match sheet {
            Some(raw) if raw.len() >= 2 && raw.starts_with('\'') && raw.ends_with('\'') => {
                Some(raw[1..raw.len() - 1].replace("''", "'"))
            }
            Some("") => return Err(RangeParseError::new(input, "empty sheet name")),
            Some(raw) => Some(raw.to_string()),
            None => None,
        };

        match (sheet, reference) {
            (Some(sheet), Some(reference)) => Ok(Self {
                extent: Self::parse_extent(input, reference)?,
                sheet: Some(sheet),
            }),
            (None, Some(reference)) => match Self::parse_extent(input, reference) {
                Ok(extent) => Ok(Self {
                    sheet: None,
                    extent,
                }),
                // A bare word that is not a reference names a sheet.
                Err(_) => {
                    let name = reference
                        .strip_prefix('\'')
                        .and_then(|s| s.strip_suffix('\''))
                        .map(|s| s.replace("''", "'"))
                        .unwrap_or_else(|| reference.to_string());
                    Ok(Self::whole_sheet(name))
                }
            },
            (_, None) => Err(RangeParseError::new(input, "missing reference")),
        }
    }
}

impl TryFrom<String> for A1Range {
    type Error = RangeParseError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<A1Range> for String {
    fn from(range: A1Range) -> Self {
        range.to_string()
    }
}
