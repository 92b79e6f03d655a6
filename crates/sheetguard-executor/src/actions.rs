//! Built-in cell actions.
//!
//! Descriptor builders for the actions [`MemoryExecutor`](crate::MemoryExecutor)
//! understands. A production executor is free to support more; the safety
//! layer only ever reads `shape`.

use serde_json::json;

use sheetguard_common::types::A1Range;

use crate::descriptor::{Dimension, EffectShape, OpDescriptor};

/// Writes literal values (strings starting with `=` are formulas).
pub const WRITE_RANGE: &str = "write_range";
/// Clears values, formulas, formats and notes.
pub const CLEAR_RANGE: &str = "clear_range";
/// Applies a number/text format.
pub const FORMAT_RANGE: &str = "format_range";
/// Attaches a note to a cell.
pub const SET_NOTE: &str = "set_note";
/// Inserts empty rows.
pub const INSERT_ROWS: &str = "insert_rows";
/// Deletes rows, shifting the rest up.
pub const DELETE_ROWS: &str = "delete_rows";

/// Builds a `write_range` descriptor anchored at `range`'s origin.
#[must_use]
pub fn write_range(range: A1Range, values: Vec<Vec<serde_json::Value>>) -> OpDescriptor {
    let rows = values.len() as u32;
    let columns = values.iter().map(Vec::len).max().unwrap_or(0) as u32;
    OpDescriptor::new(
        WRITE_RANGE,
        EffectShape::Payload {
            range,
            rows,
            columns,
        },
    )
    .with_payload(json!({ "values": values }))
}

/// Builds a `clear_range` descriptor.
#[must_use]
pub fn clear_range(range: A1Range) -> OpDescriptor {
    OpDescriptor::new(CLEAR_RANGE, EffectShape::Range { range })
}

/// Builds a `format_range` descriptor.
#[must_use]
pub fn format_range(range: A1Range, format: &str) -> OpDescriptor {
    OpDescriptor::new(FORMAT_RANGE, EffectShape::Range { range })
        .with_payload(json!({ "format": format }))
}

/// Builds a `set_note` descriptor for the range's top-left cell.
#[must_use]
pub fn set_note(range: A1Range, note: &str) -> OpDescriptor {
    let origin = range.origin();
    let cell = A1Range::cells(range.sheet.as_deref(), origin, origin);
    OpDescriptor::new(SET_NOTE, EffectShape::Range { range: cell })
        .with_payload(json!({ "note": note }))
}

/// Builds an `insert_rows` descriptor (`start` is zero-based).
#[must_use]
pub fn insert_rows(sheet: Option<&str>, start: u32, count: u32) -> OpDescriptor {
    OpDescriptor::new(
        INSERT_ROWS,
        EffectShape::Dimension {
            sheet: sheet.map(str::to_string),
            dimension: Dimension::Rows,
            start,
            count,
        },
    )
}

/// Builds a `delete_rows` descriptor (`start` is zero-based).
#[must_use]
pub fn delete_rows(sheet: Option<&str>, start: u32, count: u32) -> OpDescriptor {
    OpDescriptor::new(
        DELETE_ROWS,
        EffectShape::Dimension {
            sheet: sheet.map(str::to_string),
            dimension: Dimension::Rows,
            start,
            count,
        },
    )
}
