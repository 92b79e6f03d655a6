//! Document fingerprints and the partial fingerprints callers fence on.

use serde::{Deserialize, Serialize};
use std::fmt;

use super::ids::DocumentVersion;
use super::range::A1Range;

/// A compact summary of a document's current state.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct DocumentFingerprint {
    /// Opaque version token.
    pub version: DocumentVersion,
    /// Rows in the fingerprinted sheet.
    pub row_count: u32,
    /// Columns in the fingerprinted sheet.
    pub column_count: u32,
    /// Title of the fingerprinted sheet.
    pub sheet_title: String,
    /// CRC32 of the cells in `checksum_range` (or the whole sheet).
    pub checksum: u32,
    /// Range the checksum covers; `None` means the whole sheet.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub checksum_range: Option<A1Range>,
    /// Display values of the first row.
    #[serde(default)]
    pub first_row_values: Vec<String>,
}

impl DocumentFingerprint {
    /// Returns an expectation that fences on every field of this fingerprint.
    #[must_use]
    pub fn to_expected(&self) -> ExpectedState {
        ExpectedState {
            version: Some(self.version),
            row_count: Some(self.row_count),
            column_count: Some(self.column_count),
            sheet_title: Some(self.sheet_title.clone()),
            checksum: Some(self.checksum),
            checksum_range: self.checksum_range.clone(),
            first_row_values: Some(self.first_row_values.clone()),
        }
    }
}

/// The fields of a fingerprint a caller expects to hold.
///
/// Only populated fields are compared. Fencing on `version` alone is the
/// cheap default; adding `checksum` and `first_row_values` protects against
/// silent reordering that does not bump the version.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct ExpectedState {
    /// Expected version.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub version: Option<DocumentVersion>,
    /// Expected row count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub row_count: Option<u32>,
    /// Expected column count.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column_count: Option<u32>,
    /// Expected sheet title.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub sheet_title: Option<String>,
    /// Expected checksum.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum: Option<u32>,
    /// Range the checksum was taken over.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub checksum_range: Option<A1Range>,
    /// Expected first-row values.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub first_row_values: Option<Vec<String>>,
}

impl ExpectedState {
    /// An expectation on the version only.
    #[must_use]
    pub fn version(version: DocumentVersion) -> Self {
        Self {
            version: Some(version),
            ..Default::default()
        }
    }

    /// Adds a checksum expectation.
    #[must_use]
    pub fn with_checksum(mut self, checksum: u32, range: Option<A1Range>) -> Self {
        self.checksum = Some(checksum);
        self.checksum_range = range;
        self
    }

    /// Adds a first-row expectation.
    #[must_use]
    pub fn with_first_row(mut self, values: Vec<String>) -> Self {
        self.first_row_values = Some(values);
        self
    }

    /// Returns true if no field is populated.
    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.version.is_none()
            && self.row_count.is_none()
            && self.column_count.is_none()
            && self.sheet_title.is_none()
            && self.checksum.is_none()
            && self.first_row_values.is_none()
    }

    /// Compares every populated field against `current`.
    ///
    /// A checksum is only comparable when both sides were taken over the
    /// same range; a differing range is reported as a `checksum_range`
    /// mismatch.
    #[must_use]
    pub fn mismatches(&self, current: &DocumentFingerprint) -> Vec<FieldMismatch> {
        let mut out = Vec::new();

        if let Some(v) = self.version {
            if v != current.version {
                out.push(FieldMismatch::new("version", v, current.version));
            }
        }
        if let Some(rows) = self.row_count {
            if rows != current.row_count {
                out.push(FieldMismatch::new("row_count", rows, current.row_count));
            }
        }
        if let Some(cols) = self.column_count {
            if cols != current.column_count {
                out.push(FieldMismatch::new("column_count", cols, current.column_count));
            }
        }
        if let Some(title) = &self.sheet_title {
            if *title != current.sheet_title {
                out.push(FieldMismatch::new("sheet_title", title, &current.sheet_title));
            }
        }
        if let Some(checksum) = self.checksum {
            if self.checksum_range != current.checksum_range {
                out.push(FieldMismatch::new(
                    "checksum_range",
                    display_range(&self.checksum_range),
                    display_range(&current.checksum_range),
                ));
            } else if checksum != current.checksum {
                out.push(FieldMismatch::new(
                    "checksum",
                    format!("{:#010x}", checksum),
                    format!("{:#010x}", current.checksum),
                ));
            }
        }
        if let Some(values) = &self.first_row_values {
            if *values != current.first_row_values {
                out.push(FieldMismatch::new(
                    "first_row_values",
                    values.join("|"),
                    current.first_row_values.join("|"),
                ));
            }
        }

        out
    }
}

fn display_range(range: &Option<A1Range>) -> String {
    range
        .as_ref()
        .map_or_else(|| "<sheet>".to_string(), ToString::to_string)
}

/// One field whose expected value differs from the live document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FieldMismatch {
    /// Field name.
    pub field: String,
    /// What the caller expected.
    pub expected: String,
    /// What the document holds.
    pub actual: String,
}

impl FieldMismatch {
    /// Creates a mismatch record.
    pub fn new(field: &str, expected: impl fmt::Display, actual: impl fmt::Display) -> Self {
        Self {
            field: field.to_string(),
            expected: expected.to_string(),
            actual: actual.to_string(),
        }
    }
}

impl fmt::Display for FieldMismatch {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: expected {}, found {}", self.field, self.expected, self.actual)
    }
}
