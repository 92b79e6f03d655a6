//! In-memory executor for testing.
//!
//! `MemoryExecutor` keeps whole workbooks in memory and implements every
//! [`ActionExecutor`] call against them. Besides the built-in actions it can
//! simulate the conditions the safety layer exists for: writes by other
//! clients, silent content changes that do not bump the version, transient
//! failures and responses lost after the write landed.

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::fmt;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use dashmap::DashMap;
use parking_lot::Mutex;
use serde::{Deserialize, Serialize};
use serde_json::json;

use sheetguard_common::error::{ExecResult, ExecutorError};
use sheetguard_common::types::{
    A1Range, Cell, CellGrid, CellRef, DocumentFingerprint, DocumentId, DocumentVersion, GridRect,
};

use crate::actions;
use crate::descriptor::{
    Dimension, EffectShape, ExecutorResult, IdempotencyKey, InverseOp, OpDescriptor,
    SnapshotHandle,
};
use crate::executor::{ActionExecutor, ExecFuture};

/// Executor calls, for counting and fault injection.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ExecCall {
    /// `fetch_fingerprint`.
    FetchFingerprint,
    /// `read_range`.
    ReadRange,
    /// `apply_mutation`.
    ApplyMutation,
    /// `write_cells`.
    WriteCells,
    /// `apply_inverse`.
    ApplyInverse,
    /// `find_applied`.
    FindApplied,
    /// `create_snapshot`.
    CreateSnapshot,
    /// `restore_snapshot`.
    RestoreSnapshot,
    /// `delete_snapshot`.
    DeleteSnapshot,
}

impl ExecCall {
    /// Calls that change document content.
    pub const MUTATING: [ExecCall; 4] = [
        ExecCall::ApplyMutation,
        ExecCall::WriteCells,
        ExecCall::ApplyInverse,
        ExecCall::RestoreSnapshot,
    ];
}

impl fmt::Display for ExecCall {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            ExecCall::FetchFingerprint => "fetch_fingerprint",
            ExecCall::ReadRange => "read_range",
            ExecCall::ApplyMutation => "apply_mutation",
            ExecCall::WriteCells => "write_cells",
            ExecCall::ApplyInverse => "apply_inverse",
            ExecCall::FindApplied => "find_applied",
            ExecCall::CreateSnapshot => "create_snapshot",
            ExecCall::RestoreSnapshot => "restore_snapshot",
            ExecCall::DeleteSnapshot => "delete_snapshot",
        };
        f.write_str(name)
    }
}

#[derive(Debug, Clone)]
enum Fault {
    Fail(ExecutorError),
    LoseResponse,
}

#[derive(Debug, Clone)]
struct SheetData {
    title: String,
    rows: u32,
    cols: u32,
    cells: BTreeMap<CellRef, Cell>,
}

impl SheetData {
    fn new(title: &str, rows: u32, cols: u32) -> Self {
        Self {
            title: title.to_string(),
            rows,
            cols,
            cells: BTreeMap::new(),
        }
    }

    fn bounds(&self) -> GridRect {
        GridRect::new(0, 0, self.rows, self.cols)
    }

    fn clip(&self, rect: GridRect) -> GridRect {
        rect.intersection(&self.bounds())
            .unwrap_or(GridRect::new(rect.row, rect.col, 0, 0))
    }

    fn read(&self, rect: GridRect) -> CellGrid {
        let rows = (0..rect.height)
            .map(|r| {
                (0..rect.width)
                    .map(|c| {
                        self.cells
                            .get(&CellRef::new(rect.row + r, rect.col + c))
                            .cloned()
                            .unwrap_or_default()
                    })
                    .collect()
            })
            .collect();
        CellGrid::new(
            Some(self.title.clone()),
            CellRef::new(rect.row, rect.col),
            rows,
        )
    }

    fn entries_in(&self, rect: GridRect) -> Vec<(CellRef, Cell)> {
        self.cells
            .iter()
            .filter(|(at, _)| rect.contains(**at))
            .map(|(at, cell)| (*at, cell.clone()))
            .collect()
    }

    fn set(&mut self, at: CellRef, cell: Cell) {
        self.rows = self.rows.max(at.row + 1);
        self.cols = self.cols.max(at.col + 1);
        if cell.is_blank() {
            self.cells.remove(&at);
        } else {
            self.cells.insert(at, cell);
        }
    }

    fn write_grid(&mut self, grid: &CellGrid) {
        for (r, row) in grid.rows.iter().enumerate() {
            for (c, cell) in row.iter().enumerate() {
                let at = CellRef::new(grid.origin.row + r as u32, grid.origin.col + c as u32);
                self.set(at, cell.clone());
            }
        }
    }

    fn first_row_values(&self) -> Vec<String> {
        let mut values: Vec<String> = (0..self.cols)
            .map(|c| {
                self.cells
                    .get(&CellRef::new(0, c))
                    .map(|cell| cell.value.to_string())
                    .unwrap_or_default()
            })
            .collect();
        while values.last().is_some_and(String::is_empty) {
            values.pop();
        }
        values
    }
}

#[derive(Debug, Clone)]
struct Workbook {
    version: DocumentVersion,
    sheets: Vec<SheetData>,
}

impl Workbook {
    fn sheet_index(&self, name: Option<&str>) -> ExecResult<usize> {
        let Some(name) = name else {
            return if self.sheets.is_empty() {
                Err(ExecutorError::InvalidRequest("document has no sheets".into()))
            } else {
                Ok(0)
            };
        };
        if let Some(i) = self.sheets.iter().position(|s| s.title == name) {
            return Ok(i);
        }
        let wanted = name.trim();
        self.sheets
            .iter()
            .position(|s| s.title.trim().eq_ignore_ascii_case(wanted))
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("unknown sheet '{name}'")))
    }

    fn fingerprint(&self, range: Option<&A1Range>) -> ExecResult<DocumentFingerprint> {
        let sheet = &self.sheets[self.sheet_index(range.and_then(|r| r.sheet.as_deref()))?];
        let rect = match range {
            Some(range) => range.rect(sheet.rows, sheet.cols),
            None => sheet.bounds(),
        };
        Ok(DocumentFingerprint {
            version: self.version,
            row_count: sheet.rows,
            column_count: sheet.cols,
            sheet_title: sheet.title.clone(),
            checksum: sheet.read(rect).checksum(),
            checksum_range: range.cloned(),
            first_row_values: sheet.first_row_values(),
        })
    }

    fn bump(&mut self) {
        self.version = self.version.next();
    }
}

/// Undo instructions produced by this executor.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
enum MemoryInverse {
    RestoreCells {
        sheet: String,
        rect: GridRect,
        cells: Vec<(CellRef, Cell)>,
        rows: u32,
        cols: u32,
    },
    DeleteRows {
        sheet: String,
        start: u32,
        count: u32,
    },
    ReinsertRows {
        sheet: String,
        start: u32,
        count: u32,
        cells: Vec<(CellRef, Cell)>,
    },
}

impl MemoryInverse {
    fn restore(sheet: &SheetData, rect: GridRect) -> Self {
        MemoryInverse::RestoreCells {
            sheet: sheet.title.clone(),
            rect,
            cells: sheet.entries_in(rect),
            rows: sheet.rows,
            cols: sheet.cols,
        }
    }

    fn into_op(self) -> Option<InverseOp> {
        serde_json::to_value(self).ok().map(InverseOp)
    }
}

#[derive(Debug)]
struct DocumentState {
    book: Workbook,
    applied: HashMap<IdempotencyKey, ExecutorResult>,
}

/// In-memory [`ActionExecutor`].
///
/// # Example
///
/// ```rust
/// use sheetguard_executor::{ActionExecutor, MemoryExecutor};
/// use sheetguard_common::types::DocumentId;
///
/// # tokio_test_block(async {
/// let exec = MemoryExecutor::new();
/// let doc = DocumentId::new("S1");
/// exec.add_document(&doc, &[("Sheet1", 100, 26)]);
/// let fp = exec.fetch_fingerprint(&doc, None).await.unwrap();
/// assert_eq!(fp.sheet_title, "Sheet1");
/// # });
/// # fn tokio_test_block<F: std::future::Future>(f: F) {
/// #     tokio::runtime::Builder::new_current_thread().build().unwrap().block_on(f);
/// # }
/// ```
#[derive(Debug)]
pub struct MemoryExecutor {
    documents: DashMap<DocumentId, DocumentState>,
    snapshots: DashMap<SnapshotHandle, (DocumentId, Workbook)>,
    next_snapshot: AtomicU64,
    calls: DashMap<ExecCall, u64>,
    faults: Mutex<HashMap<ExecCall, VecDeque<Fault>>>,
    monotonic: AtomicBool,
}

impl Default for MemoryExecutor {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryExecutor {
    /// Creates an executor with no documents.
    #[must_use]
    pub fn new() -> Self {
        Self {
            documents: DashMap::new(),
            snapshots: DashMap::new(),
            next_snapshot: AtomicU64::new(1),
            calls: DashMap::new(),
            faults: Mutex::new(HashMap::new()),
            monotonic: AtomicBool::new(true),
        }
    }

    /// Creates an executor wrapped in Arc.
    #[must_use]
    pub fn shared() -> Arc<Self> {
        Arc::new(Self::new())
    }

    // =========================================================================
    // Setup and inspection
    // =========================================================================

    /// Adds (or replaces) a document with the given `(title, rows, columns)`
    /// sheets. The document starts at version 1.
    pub fn add_document(&self, document: &DocumentId, sheets: &[(&str, u32, u32)]) {
        let book = Workbook {
            version: DocumentVersion::new(1),
            sheets: sheets
                .iter()
                .map(|(title, rows, cols)| SheetData::new(title, *rows, *cols))
                .collect(),
        };
        self.documents.insert(
            document.clone(),
            DocumentState {
                book,
                applied: HashMap::new(),
            },
        );
    }

    /// Writes values without counting a call or changing the version.
    pub fn seed(
        &self,
        document: &DocumentId,
        range: &A1Range,
        values: &[Vec<serde_json::Value>],
    ) -> ExecResult<()> {
        self.write_values(document, range, values, false).map(|_| ())
    }

    /// Simulates another client writing values; the version advances unless
    /// the executor was made non-monotonic.
    pub fn external_write(
        &self,
        document: &DocumentId,
        range: &A1Range,
        values: &[Vec<serde_json::Value>],
    ) -> ExecResult<DocumentVersion> {
        let bump = self.monotonic.load(Ordering::SeqCst);
        self.write_values(document, range, values, bump)
    }

    /// Simulates a content change that does not advance the version.
    pub fn external_write_silent(
        &self,
        document: &DocumentId,
        range: &A1Range,
        values: &[Vec<serde_json::Value>],
    ) -> ExecResult<DocumentVersion> {
        self.write_values(document, range, values, false)
    }

    fn write_values(
        &self,
        document: &DocumentId,
        range: &A1Range,
        values: &[Vec<serde_json::Value>],
        bump: bool,
    ) -> ExecResult<DocumentVersion> {
        let mut state = self.document_mut(document)?;
        let index = state.book.sheet_index(range.sheet.as_deref())?;
        let sheet = &mut state.book.sheets[index];
        let grid = CellGrid::from_json_rows(Some(sheet.title.clone()), range.origin(), values);
        sheet.write_grid(&grid);
        if bump {
            state.book.bump();
        }
        Ok(state.book.version)
    }

    /// Makes writes leave the version unchanged (or restores the default).
    pub fn set_monotonic(&self, monotonic: bool) {
        self.monotonic.store(monotonic, Ordering::SeqCst);
    }

    /// Returns the cell at `at` (e.g. `Sheet1!B2`), blank if unset.
    pub fn cell(&self, document: &DocumentId, at: &str) -> ExecResult<Cell> {
        let range: A1Range = at
            .parse()
            .map_err(|e: sheetguard_common::types::RangeParseError| {
                ExecutorError::InvalidRequest(e.to_string())
            })?;
        let state = self.document(document)?;
        let sheet = &state.book.sheets[state.book.sheet_index(range.sheet.as_deref())?];
        Ok(sheet.cells.get(&range.origin()).cloned().unwrap_or_default())
    }

    /// Returns the display value of a cell.
    pub fn cell_text(&self, document: &DocumentId, at: &str) -> ExecResult<String> {
        self.cell(document, at).map(|c| c.value.to_string())
    }

    /// Returns the document's current version.
    pub fn version(&self, document: &DocumentId) -> ExecResult<DocumentVersion> {
        Ok(self.document(document)?.book.version)
    }

    /// Returns the row count of a sheet.
    pub fn row_count(&self, document: &DocumentId, sheet: Option<&str>) -> ExecResult<u32> {
        let state = self.document(document)?;
        Ok(state.book.sheets[state.book.sheet_index(sheet)?].rows)
    }

    /// Returns the whole-first-sheet checksum.
    pub fn checksum(&self, document: &DocumentId) -> ExecResult<u32> {
        Ok(self.document(document)?.book.fingerprint(None)?.checksum)
    }

    /// Number of live snapshot copies.
    #[must_use]
    pub fn snapshot_count(&self) -> usize {
        self.snapshots.len()
    }

    // =========================================================================
    // Counters and fault injection
    // =========================================================================

    /// Number of times `call` was made.
    #[must_use]
    pub fn call_count(&self, call: ExecCall) -> u64 {
        self.calls.get(&call).map_or(0, |c| *c)
    }

    /// Number of calls of any kind.
    #[must_use]
    pub fn total_calls(&self) -> u64 {
        self.calls.iter().map(|entry| *entry.value()).sum()
    }

    /// Number of calls that change document content.
    #[must_use]
    pub fn mutating_calls(&self) -> u64 {
        ExecCall::MUTATING.iter().map(|c| self.call_count(*c)).sum()
    }

    /// Resets every call counter.
    pub fn reset_counters(&self) {
        self.calls.clear();
    }

    /// Fails the next `times` calls of `call` with `error`.
    pub fn fail_next(&self, call: ExecCall, times: usize, error: ExecutorError) {
        let mut faults = self.faults.lock();
        let queue = faults.entry(call).or_default();
        for _ in 0..times {
            queue.push_back(Fault::Fail(error.clone()));
        }
    }

    /// Applies the next `call` but reports it as a transient failure.
    pub fn lose_next_response(&self, call: ExecCall) {
        self.faults
            .lock()
            .entry(call)
            .or_default()
            .push_back(Fault::LoseResponse);
    }

    /// Counts the call and returns whether its response should be lost.
    fn enter(&self, call: ExecCall) -> ExecResult<bool> {
        *self.calls.entry(call).or_insert(0) += 1;
        let fault = self
            .faults
            .lock()
            .get_mut(&call)
            .and_then(VecDeque::pop_front);
        match fault {
            Some(Fault::Fail(err)) => Err(err),
            Some(Fault::LoseResponse) => Ok(true),
            None => Ok(false),
        }
    }

    fn lost(call: ExecCall) -> ExecutorError {
        ExecutorError::Unavailable(format!("{call} response lost"))
    }

    fn document(
        &self,
        document: &DocumentId,
    ) -> ExecResult<dashmap::mapref::one::Ref<'_, DocumentId, DocumentState>> {
        self.documents
            .get(document)
            .ok_or_else(|| ExecutorError::DocumentNotFound(document.to_string()))
    }

    fn document_mut(
        &self,
        document: &DocumentId,
    ) -> ExecResult<dashmap::mapref::one::RefMut<'_, DocumentId, DocumentState>> {
        self.documents
            .get_mut(document)
            .ok_or_else(|| ExecutorError::DocumentNotFound(document.to_string()))
    }

    // =========================================================================
    // Actions
    // =========================================================================

    fn run_action(
        book: &mut Workbook,
        op: &OpDescriptor,
    ) -> ExecResult<(u64, Option<InverseOp>, serde_json::Value)> {
        let index = book.sheet_index(op.shape.sheet())?;
        let sheet = &mut book.sheets[index];

        match op.action.as_str() {
            actions::WRITE_RANGE => {
                let anchor = match &op.shape {
                    EffectShape::Payload { range, .. } | EffectShape::Range { range } => {
                        range.origin()
                    }
                    _ => return Err(Self::bad_shape(op)),
                };
                let values: Vec<Vec<serde_json::Value>> = op
                    .payload
                    .get("values")
                    .cloned()
                    .map(serde_json::from_value)
                    .transpose()
                    .map_err(|e| ExecutorError::InvalidRequest(e.to_string()))?
                    .ok_or_else(|| ExecutorError::InvalidRequest("missing values".into()))?;
                let grid = CellGrid::from_json_rows(Some(sheet.title.clone()), anchor, &values);
                let inverse = MemoryInverse::restore(sheet, grid.rect());
                sheet.write_grid(&grid);
                let rect = grid.rect();
                Ok((rect.cell_count(), inverse.into_op(), json!({ "updated_range": rect })))
            }
            actions::CLEAR_RANGE => {
                let rect = sheet.clip(Self::range_rect(op, sheet)?);
                let inverse = MemoryInverse::restore(sheet, rect);
                sheet.cells.retain(|at, _| !rect.contains(*at));
                Ok((rect.cell_count(), inverse.into_op(), json!({})))
            }
            actions::FORMAT_RANGE => {
                let format = Self::payload_str(op, "format")?;
                let rect = sheet.clip(Self::range_rect(op, sheet)?);
                let inverse = MemoryInverse::restore(sheet, rect);
                for r in 0..rect.height {
                    for c in 0..rect.width {
                        let at = CellRef::new(rect.row + r, rect.col + c);
                        let mut cell = sheet.cells.get(&at).cloned().unwrap_or_default();
                        cell.format = Some(format.clone());
                        sheet.set(at, cell);
                    }
                }
                Ok((rect.cell_count(), inverse.into_op(), json!({})))
            }
            actions::SET_NOTE => {
                let note = Self::payload_str(op, "note")?;
                let at = match &op.shape {
                    EffectShape::Range { range } | EffectShape::Payload { range, .. } => {
                        range.origin()
                    }
                    _ => return Err(Self::bad_shape(op)),
                };
                let inverse = MemoryInverse::restore(sheet, GridRect::new(at.row, at.col, 1, 1));
                let mut cell = sheet.cells.get(&at).cloned().unwrap_or_default();
                cell.note = Some(note);
                sheet.set(at, cell);
                Ok((1, inverse.into_op(), json!({})))
            }
            actions::INSERT_ROWS => {
                let (start, count) = Self::row_span(op)?;
                Self::shift_rows_down(sheet, start, count);
                let inverse = MemoryInverse::DeleteRows {
                    sheet: sheet.title.clone(),
                    start,
                    count,
                };
                Ok((u64::from(count) * u64::from(sheet.cols), inverse.into_op(), json!({})))
            }
            actions::DELETE_ROWS => {
                let (start, count) = Self::row_span(op)?;
                let removed = Self::remove_rows(sheet, start, count);
                let inverse = MemoryInverse::ReinsertRows {
                    sheet: sheet.title.clone(),
                    start,
                    count,
                    cells: removed,
                };
                Ok((u64::from(count) * u64::from(sheet.cols), inverse.into_op(), json!({})))
            }
            other => Err(ExecutorError::UnsupportedAction(other.to_string())),
        }
    }

    fn undo(book: &mut Workbook, inverse: &InverseOp) -> ExecResult<u64> {
        let inverse: MemoryInverse = serde_json::from_value(inverse.0.clone())
            .map_err(|e| ExecutorError::InvalidRequest(format!("unrecognised inverse: {e}")))?;
        match inverse {
            MemoryInverse::RestoreCells {
                sheet,
                rect,
                cells,
                rows,
                cols,
            } => {
                let index = book.sheet_index(Some(&sheet))?;
                let sheet = &mut book.sheets[index];
                sheet.cells.retain(|at, _| !rect.contains(*at));
                sheet.rows = rows;
                sheet.cols = cols;
                for (at, cell) in cells {
                    sheet.set(at, cell);
                }
                Ok(rect.cell_count())
            }
            MemoryInverse::DeleteRows {
                sheet,
                start,
                count,
            } => {
                let index = book.sheet_index(Some(&sheet))?;
                let sheet = &mut book.sheets[index];
                Self::remove_rows(sheet, start, count);
                Ok(u64::from(count) * u64::from(sheet.cols))
            }
            MemoryInverse::ReinsertRows {
                sheet,
                start,
                count,
                cells,
            } => {
                let index = book.sheet_index(Some(&sheet))?;
                let sheet = &mut book.sheets[index];
                Self::shift_rows_down(sheet, start, count);
                for (at, cell) in cells {
                    sheet.set(at, cell);
                }
                Ok(u64::from(count) * u64::from(sheet.cols))
            }
        }
    }

    fn shift_rows_down(sheet: &mut SheetData, start: u32, count: u32) {
        let cells = std::mem::take(&mut sheet.cells);
        sheet.cells = cells
            .into_iter()
            .map(|(at, cell)| {
                if at.row >= start {
                    (CellRef::new(at.row + count, at.col), cell)
                } else {
                    (at, cell)
                }
            })
            .collect();
        sheet.rows = sheet.rows.saturating_add(count);
    }

    fn remove_rows(sheet: &mut SheetData, start: u32, count: u32) -> Vec<(CellRef, Cell)> {
        let end = start.saturating_add(count);
        let mut removed = Vec::new();
        let cells = std::mem::take(&mut sheet.cells);
        sheet.cells = cells
            .into_iter()
            .filter_map(|(at, cell)| {
                if at.row < start {
                    Some((at, cell))
                } else if at.row < end {
                    removed.push((at, cell));
                    None
                } else {
                    Some((CellRef::new(at.row - count, at.col), cell))
                }
            })
            .collect();
        sheet.rows = sheet.rows.saturating_sub(count.min(sheet.rows.saturating_sub(start)));
        removed
    }

    fn range_rect(op: &OpDescriptor, sheet: &SheetData) -> ExecResult<GridRect> {
        match op.shape.target() {
            Some(range) => Ok(range.rect(sheet.rows, sheet.cols)),
            None => Err(Self::bad_shape(op)),
        }
    }

    fn row_span(op: &OpDescriptor) -> ExecResult<(u32, u32)> {
        match op.shape {
            EffectShape::Dimension {
                dimension: Dimension::Rows,
                start,
                count,
                ..
            } => Ok((start, count)),
            _ => Err(Self::bad_shape(op)),
        }
    }

    fn payload_str(op: &OpDescriptor, field: &str) -> ExecResult<String> {
        op.payload
            .get(field)
            .and_then(serde_json::Value::as_str)
            .map(str::to_string)
            .ok_or_else(|| ExecutorError::InvalidRequest(format!("missing '{field}'")))
    }

    fn bad_shape(op: &OpDescriptor) -> ExecutorError {
        ExecutorError::InvalidRequest(format!("{} does not accept this effect shape", op.action))
    }

    fn finish(
        state: &mut DocumentState,
        updated: u64,
        inverse: Option<InverseOp>,
        detail: serde_json::Value,
        bump: bool,
    ) -> ExecResult<ExecutorResult> {
        if bump {
            state.book.bump();
        }
        Ok(ExecutorResult {
            fingerprint: state.book.fingerprint(None)?,
            updated_cells: updated,
            inverse,
            detail,
        })
    }
}

impl ActionExecutor for MemoryExecutor {
    fn fetch_fingerprint<'a>(
        &'a self,
        document: &'a DocumentId,
        range: Option<&'a A1Range>,
    ) -> ExecFuture<'a, DocumentFingerprint> {
        Box::pin(async move {
            self.enter(ExecCall::FetchFingerprint)?;
            self.document(document)?.book.fingerprint(range)
        })
    }

    fn read_range<'a>(
        &'a self,
        document: &'a DocumentId,
        range: &'a A1Range,
    ) -> ExecFuture<'a, CellGrid> {
        Box::pin(async move {
            self.enter(ExecCall::ReadRange)?;
            let state = self.document(document)?;
            let sheet = &state.book.sheets[state.book.sheet_index(range.sheet.as_deref())?];
            Ok(sheet.read(range.rect(sheet.rows, sheet.cols)))
        })
    }

    fn apply_mutation<'a>(
        &'a self,
        document: &'a DocumentId,
        op: &'a OpDescriptor,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult> {
        Box::pin(async move {
            let lose = self.enter(ExecCall::ApplyMutation)?;
            let bump = self.monotonic.load(Ordering::SeqCst);
            let mut state = self.document_mut(document)?;
            let (updated, inverse, detail) = Self::run_action(&mut state.book, op)?;
            let result = Self::finish(&mut state, updated, inverse, detail, bump)?;
            state.applied.insert(key, result.clone());
            if lose {
                return Err(Self::lost(ExecCall::ApplyMutation));
            }
            Ok(result)
        })
    }

    fn write_cells<'a>(
        &'a self,
        document: &'a DocumentId,
        cells: &'a CellGrid,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult> {
        Box::pin(async move {
            let lose = self.enter(ExecCall::WriteCells)?;
            let bump = self.monotonic.load(Ordering::SeqCst);
            let mut state = self.document_mut(document)?;
            let index = state.book.sheet_index(cells.sheet.as_deref())?;
            let sheet = &mut state.book.sheets[index];
            let inverse = MemoryInverse::restore(sheet, cells.rect());
            sheet.write_grid(cells);
            let result = Self::finish(
                &mut state,
                cells.rect().cell_count(),
                inverse.into_op(),
                json!({}),
                bump,
            )?;
            state.applied.insert(key, result.clone());
            if lose {
                return Err(Self::lost(ExecCall::WriteCells));
            }
            Ok(result)
        })
    }

    fn apply_inverse<'a>(
        &'a self,
        document: &'a DocumentId,
        inverse: &'a InverseOp,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, ExecutorResult> {
        Box::pin(async move {
            let lose = self.enter(ExecCall::ApplyInverse)?;
            let bump = self.monotonic.load(Ordering::SeqCst);
            let mut state = self.document_mut(document)?;
            let updated = Self::undo(&mut state.book, inverse)?;
            let result = Self::finish(&mut state, updated, None, json!({}), bump)?;
            state.applied.insert(key, result.clone());
            if lose {
                return Err(Self::lost(ExecCall::ApplyInverse));
            }
            Ok(result)
        })
    }

    fn find_applied<'a>(
        &'a self,
        document: &'a DocumentId,
        key: IdempotencyKey,
    ) -> ExecFuture<'a, Option<ExecutorResult>> {
        Box::pin(async move {
            self.enter(ExecCall::FindApplied)?;
            Ok(self.document(document)?.applied.get(&key).cloned())
        })
    }

    fn create_snapshot<'a>(&'a self, document: &'a DocumentId) -> ExecFuture<'a, SnapshotHandle> {
        Box::pin(async move {
            self.enter(ExecCall::CreateSnapshot)?;
            let book = self.document(document)?.book.clone();
            let id = self.next_snapshot.fetch_add(1, Ordering::SeqCst);
            let handle = SnapshotHandle::new(format!("copy-{}-{}", document, id));
            self.snapshots
                .insert(handle.clone(), (document.clone(), book));
            Ok(handle)
        })
    }

    fn restore_snapshot<'a>(
        &'a self,
        document: &'a DocumentId,
        handle: &'a SnapshotHandle,
    ) -> ExecFuture<'a, DocumentFingerprint> {
        Box::pin(async move {
            let lose = self.enter(ExecCall::RestoreSnapshot)?;
            let sheets = {
                let copy = self
                    .snapshots
                    .get(handle)
                    .ok_or_else(|| ExecutorError::HandleNotFound(handle.to_string()))?;
                if copy.0 != *document {
                    return Err(ExecutorError::InvalidRequest(format!(
                        "snapshot {} belongs to document {}",
                        handle, copy.0
                    )));
                }
                copy.1.sheets.clone()
            };
            let mut state = self.document_mut(document)?;
            state.book.sheets = sheets;
            // Restoring is a write: the version always moves forward.
            state.book.bump();
            let fingerprint = state.book.fingerprint(None)?;
            if lose {
                return Err(Self::lost(ExecCall::RestoreSnapshot));
            }
            Ok(fingerprint)
        })
    }

    fn delete_snapshot<'a>(&'a self, handle: &'a SnapshotHandle) -> ExecFuture<'a, ()> {
        Box::pin(async move {
            self.enter(ExecCall::DeleteSnapshot)?;
            self.snapshots
                .remove(handle)
                .map(|_| ())
                .ok_or_else(|| ExecutorError::HandleNotFound(handle.to_string()))
        })
    }

    fn monotonic_versions(&self) -> bool {
        self.monotonic.load(Ordering::SeqCst)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use sheetguard_common::types::OpId;

    fn doc() -> DocumentId {
        DocumentId::new("S1")
    }

    fn range(s: &str) -> A1Range {
        s.parse().unwrap()
    }

    fn create_executor() -> MemoryExecutor {
        let exec = MemoryExecutor::new();
        exec.add_document(&doc(), &[("Sheet1", 100, 26), ("Data", 50, 5)]);
        exec
    }

    fn key(n: u64, op: &OpDescriptor) -> IdempotencyKey {
        IdempotencyKey::derive(&doc(), OpId::new(n), op)
    }

    #[tokio::test]
    async fn test_write_and_inverse() {
        let exec = create_executor();
        exec.seed(&doc(), &range("Sheet1!A1"), &[vec![json!("old")]]).unwrap();

        let op = actions::write_range(range("Sheet1!A1"), vec![vec![json!("new"), json!(2)]]);
        let result = exec.apply_mutation(&doc(), &op, key(1, &op)).await.unwrap();
        assert_eq!(result.fingerprint.version, DocumentVersion::new(2));
        assert_eq!(result.updated_cells, 2);
        assert_eq!(exec.cell_text(&doc(), "Sheet1!A1").unwrap(), "new");

        let inverse = result.inverse.unwrap();
        let undo = IdempotencyKey::for_inverse(&doc(), OpId::new(1), 0, &inverse);
        exec.apply_inverse(&doc(), &inverse, undo).await.unwrap();
        assert_eq!(exec.cell_text(&doc(), "Sheet1!A1").unwrap(), "old");
        assert_eq!(exec.cell_text(&doc(), "Sheet1!B1").unwrap(), "");
        assert_eq!(exec.version(&doc()).unwrap(), DocumentVersion::new(3));
    }

    #[tokio::test]
    async fn test_delete_rows_round_trip() {
        let exec = create_executor();
        exec.seed(
            &doc(),
            &range("Data!A1"),
            &[vec![json!("r1")], vec![json!("r2")], vec![json!("r3")]],
        )
        .unwrap();
        let before = exec.checksum(&doc()).unwrap();

        let op = actions::delete_rows(Some("Data"), 1, 1);
        let result = exec.apply_mutation(&doc(), &op, key(1, &op)).await.unwrap();
        assert_eq!(exec.cell_text(&doc(), "Data!A2").unwrap(), "r3");
        assert_eq!(exec.row_count(&doc(), Some("Data")).unwrap(), 49);

        let inverse = result.inverse.unwrap();
        let undo = IdempotencyKey::for_inverse(&doc(), OpId::new(1), 0, &inverse);
        exec.apply_inverse(&doc(), &inverse, undo).await.unwrap();
        assert_eq!(exec.cell_text(&doc(), "Data!A2").unwrap(), "r2");
        assert_eq!(exec.row_count(&doc(), Some("Data")).unwrap(), 50);
        assert_eq!(exec.checksum(&doc()).unwrap(), before);
    }

    #[tokio::test]
    async fn test_snapshot_restore() {
        let exec = create_executor();
        exec.seed(&doc(), &range("Sheet1!A1"), &[vec![json!(1)]]).unwrap();
        let handle = exec.create_snapshot(&doc()).await.unwrap();
        let checksum = exec.checksum(&doc()).unwrap();

        exec.external_write(&doc(), &range("Sheet1!A1"), &[vec![json!(99)]]).unwrap();
        assert_ne!(exec.checksum(&doc()).unwrap(), checksum);

        let fp = exec.restore_snapshot(&doc(), &handle).await.unwrap();
        assert_eq!(fp.checksum, checksum);
        assert_eq!(fp.version, DocumentVersion::new(3));

        exec.delete_snapshot(&handle).await.unwrap();
        assert_eq!(exec.snapshot_count(), 0);
        assert!(exec.delete_snapshot(&handle).await.is_err());
    }

    #[tokio::test]
    async fn test_fault_injection() {
        let exec = create_executor();
        exec.fail_next(ExecCall::FetchFingerprint, 2, ExecutorError::RateLimited("429".into()));
        assert!(exec.fetch_fingerprint(&doc(), None).await.is_err());
        assert!(exec.fetch_fingerprint(&doc(), None).await.is_err());
        assert!(exec.fetch_fingerprint(&doc(), None).await.is_ok());
        assert_eq!(exec.call_count(ExecCall::FetchFingerprint), 3);
    }

    #[tokio::test]
    async fn test_lost_response_is_findable() {
        let exec = create_executor();
        exec.lose_next_response(ExecCall::ApplyMutation);
        let op = actions::clear_range(range("Sheet1!A1:B2"));
        let k = key(7, &op);

        let err = exec.apply_mutation(&doc(), &op, k).await.unwrap_err();
        assert!(err.is_transient());
        let found = exec.find_applied(&doc(), k).await.unwrap().unwrap();
        assert_eq!(found.fingerprint.version, DocumentVersion::new(2));
        assert!(exec.find_applied(&doc(), key(8, &op)).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn test_lost_inverse_is_findable() {
        let exec = create_executor();
        let op = actions::insert_rows(Some("Sheet1"), 2, 2);
        let result = exec.apply_mutation(&doc(), &op, key(1, &op)).await.unwrap();
        let inverse = result.inverse.unwrap();
        let undo = IdempotencyKey::for_inverse(&doc(), OpId::new(1), 0, &inverse);

        exec.lose_next_response(ExecCall::ApplyInverse);
        assert!(exec.apply_inverse(&doc(), &inverse, undo).await.is_err());
        assert_eq!(exec.row_count(&doc(), Some("Sheet1")).unwrap(), 100);
        assert!(exec.find_applied(&doc(), undo).await.unwrap().is_some());
    }

    #[tokio::test]
    async fn test_fingerprint_over_range() {
        let exec = create_executor();
        exec.seed(&doc(), &range("Sheet1!A1"), &[vec![json!("id"), json!("name")]]).unwrap();
        let r = range("Sheet1!A1:B1");
        let fp = exec.fetch_fingerprint(&doc(), Some(&r)).await.unwrap();
        assert_eq!(fp.checksum_range, Some(r.clone()));
        assert_eq!(fp.first_row_values, vec!["id".to_string(), "name".to_string()]);

        let grid = exec.read_range(&doc(), &r).await.unwrap();
        assert_eq!(grid.checksum(), fp.checksum);
    }

    #[tokio::test]
    async fn test_silent_write_keeps_version() {
        let exec = create_executor();
        let v = exec
            .external_write_silent(&doc(), &range("Sheet1!C3"), &[vec![json!("x")]])
            .unwrap();
        assert_eq!(v, DocumentVersion::new(1));
    }

    #[tokio::test]
    async fn test_unknown_action_and_sheet() {
        let exec = create_executor();
        let op = OpDescriptor::new("add_chart", EffectShape::NoCells);
        let err = exec.apply_mutation(&doc(), &op, key(1, &op)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::UnsupportedAction(_)));

        let op = actions::clear_range(range("Missing!A1"));
        let err = exec.apply_mutation(&doc(), &op, key(2, &op)).await.unwrap_err();
        assert!(matches!(err, ExecutorError::InvalidRequest(_)));
        assert_eq!(exec.version(&doc()).unwrap(), DocumentVersion::new(1));
    }
}
