//! System-wide constants for SheetGuard.
//!
//! These are the defaults the configuration falls back to and the fixed
//! sizes the diff engine reports with.

use std::time::Duration;

// =============================================================================
// Effect Scope
// =============================================================================

/// Default ceiling on cells a single mutation may touch.
pub const DEFAULT_MAX_CELLS_AFFECTED: u64 = 10_000;

/// Rows assumed for a sheet whose size is not known.
pub const DEFAULT_SHEET_ROWS: u32 = 1_000;

/// Columns assumed for a sheet whose size is not known.
pub const DEFAULT_SHEET_COLUMNS: u32 = 26;

// =============================================================================
// Snapshots
// =============================================================================

/// Estimated cell count above which a snapshot is taken automatically.
pub const DEFAULT_AUTO_SNAPSHOT_THRESHOLD: u64 = 1_000;

/// Snapshots retained per document.
pub const DEFAULT_MAX_SNAPSHOTS_PER_DOCUMENT: usize = 20;

/// Maximum age of a retained snapshot (7 days).
pub const DEFAULT_SNAPSHOT_MAX_AGE: Duration = Duration::from_secs(7 * 24 * 60 * 60);

// =============================================================================
// Diff Engine
// =============================================================================

/// Largest affected-cell count that still gets a full diff.
pub const DEFAULT_FULL_DIFF_MAX_CELLS: u64 = 100;

/// Largest affected-cell count that still gets a sampled diff.
pub const DEFAULT_SAMPLE_DIFF_MAX_CELLS: u64 = 5_000;

/// Changed rows reported from each end of a sampled diff.
pub const DEFAULT_SAMPLE_EDGE_ROWS: usize = 5;

/// Randomly chosen changed rows reported in a sampled diff.
pub const DEFAULT_SAMPLE_RANDOM_ROWS: usize = 5;

// =============================================================================
// Transactions
// =============================================================================

/// Idle time after which a pending transaction expires (5 minutes).
pub const DEFAULT_TRANSACTION_TTL: Duration = Duration::from_secs(5 * 60);

/// Maximum operations queued in one transaction.
pub const DEFAULT_MAX_QUEUED_OPS: usize = 100;

/// Interval of the background expiry sweep.
pub const DEFAULT_REAPER_INTERVAL: Duration = Duration::from_secs(30);

// =============================================================================
// Retry
// =============================================================================

/// Attempts per executor call, including the first.
pub const DEFAULT_RETRY_MAX_ATTEMPTS: u32 = 3;

/// Backoff before the first retry.
pub const DEFAULT_RETRY_INITIAL_BACKOFF: Duration = Duration::from_millis(100);

/// Upper bound on any single backoff.
pub const DEFAULT_RETRY_MAX_BACKOFF: Duration = Duration::from_secs(5);

/// Backoff growth factor.
pub const DEFAULT_RETRY_MULTIPLIER: f64 = 2.0;

// =============================================================================
// Conflicts and History
// =============================================================================

/// Ledger writes remembered per document.
pub const DEFAULT_LEDGER_CAPACITY: usize = 1_000;

/// History entries retained per document.
pub const DEFAULT_MAX_HISTORY_ENTRIES: usize = 500;

/// Name of the configuration file inside the data directory.
pub const CONFIG_FILE_NAME: &str = "sheetguard.toml";
