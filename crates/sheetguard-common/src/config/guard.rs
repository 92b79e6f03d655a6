//! Safety-layer configuration structures.
//!
//! Every section defaults sensibly, so a TOML file only needs to name the
//! values it changes.

use serde::{Deserialize, Serialize};
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::constants::*;
use crate::error::{GuardError, GuardResult};

/// Top-level configuration.
///
/// # Example
///
/// ```rust
/// use sheetguard_common::config::GuardConfig;
///
/// let config = GuardConfig::default();
/// assert_eq!(config.diff.full_max_cells, 100);
/// assert!(config.validate().is_ok());
/// ```
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct GuardConfig {
    /// Directory for persisted state; `None` keeps everything in memory.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub data_dir: Option<PathBuf>,

    /// Version fence configuration.
    pub fence: FenceConfig,

    /// Effect scope guard configuration.
    pub scope: ScopeConfig,

    /// Snapshot manager configuration.
    pub snapshot: SnapshotConfig,

    /// Diff engine configuration.
    pub diff: DiffConfig,

    /// Transaction coordinator configuration.
    pub transaction: TransactionConfig,

    /// Executor retry configuration.
    pub retry: RetryConfig,

    /// Conflict detector configuration.
    pub conflict: ConflictConfig,

    /// History log configuration.
    pub history: HistoryConfig,
}

impl Default for GuardConfig {
    fn default() -> Self {
        Self {
            data_dir: None,
            fence: FenceConfig::default(),
            scope: ScopeConfig::default(),
            snapshot: SnapshotConfig::default(),
            diff: DiffConfig::default(),
            transaction: TransactionConfig::default(),
            retry: RetryConfig::default(),
            conflict: ConflictConfig::default(),
            history: HistoryConfig::default(),
        }
    }
}

impl GuardConfig {
    /// Creates a new default configuration.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Creates a configuration for tests: no persistence and no retry sleeps.
    #[must_use]
    pub fn for_testing() -> Self {
        Self {
            data_dir: None,
            retry: RetryConfig {
                initial_backoff: Duration::from_millis(1),
                max_backoff: Duration::from_millis(4),
                ..Default::default()
            },
            transaction: TransactionConfig {
                reaper_interval: None,
                ..Default::default()
            },
            ..Default::default()
        }
    }

    /// Loads configuration from a TOML file.
    pub fn from_file(path: &Path) -> GuardResult<Self> {
        let content = std::fs::read_to_string(path).map_err(|e| GuardError::InvalidConfig {
            message: format!("cannot read {}: {}", path.display(), e),
        })?;
        Self::from_toml(&content)
    }

    /// Parses configuration from TOML text and validates it.
    pub fn from_toml(content: &str) -> GuardResult<Self> {
        let config: Self = toml::from_str(content).map_err(|e| GuardError::InvalidConfig {
            message: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Saves configuration to a file.
    pub fn save(&self, path: &Path) -> GuardResult<()> {
        let content = self.to_toml()?;

        if let Some(parent) = path.parent() {
            std::fs::create_dir_all(parent).map_err(|e| GuardError::storage(e.to_string()))?;
        }

        std::fs::write(path, content).map_err(|e| GuardError::storage(e.to_string()))?;
        Ok(())
    }

    /// Converts configuration to a TOML string.
    pub fn to_toml(&self) -> GuardResult<String> {
        toml::to_string_pretty(self).map_err(|e| GuardError::InvalidConfig {
            message: e.to_string(),
        })
    }

    /// Validates the configuration and returns an error if invalid.
    pub fn validate(&self) -> GuardResult<()> {
        let invalid = |message: &str| {
            Err(GuardError::InvalidConfig {
                message: message.to_string(),
            })
        };

        if self.scope.max_cells_affected == 0 {
            return invalid("scope.max_cells_affected must be positive");
        }
        if self.scope.default_sheet_rows == 0 || self.scope.default_sheet_columns == 0 {
            return invalid("scope.default_sheet_rows and default_sheet_columns must be positive");
        }
        if self.diff.full_max_cells > self.diff.sample_max_cells {
            return invalid("diff.full_max_cells must not exceed diff.sample_max_cells");
        }
        if self.snapshot.max_per_document == 0 {
            return invalid("snapshot.max_per_document must be at least 1");
        }
        if self.transaction.ttl.is_zero() {
            return invalid("transaction.ttl must be positive");
        }
        if self.transaction.max_queued_ops == 0 {
            return invalid("transaction.max_queued_ops must be at least 1");
        }
        if self.retry.max_attempts == 0 {
            return invalid("retry.max_attempts must be at least 1");
        }
        if self.retry.multiplier < 1.0 {
            return invalid("retry.multiplier must be at least 1.0");
        }
        if self.retry.initial_backoff > self.retry.max_backoff {
            return invalid("retry.initial_backoff must not exceed retry.max_backoff");
        }

        Ok(())
    }

    /// Creates a builder for configuration.
    #[must_use]
    pub fn builder() -> GuardConfigBuilder {
        GuardConfigBuilder::new()
    }
}

/// Version fence configuration.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(default)]
pub struct FenceConfig {
    /// Reject mutations that do not carry any expected-state field.
    /// Default: false
    pub require_expected_state: bool,
}

/// Effect scope guard configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ScopeConfig {
    /// Ceiling on cells affected when the caller does not supply one.
    /// Default: 10000
    pub max_cells_affected: u64,

    /// Require an explicit range unless the caller says otherwise.
    /// Default: false
    pub require_explicit_range: bool,

    /// Rows assumed for a sheet with no shape hint.
    /// Default: 1000
    pub default_sheet_rows: u32,

    /// Columns assumed for a sheet with no shape hint.
    /// Default: 26
    pub default_sheet_columns: u32,
}

impl Default for ScopeConfig {
    fn default() -> Self {
        Self {
            max_cells_affected: DEFAULT_MAX_CELLS_AFFECTED,
            require_explicit_range: false,
            default_sheet_rows: DEFAULT_SHEET_ROWS,
            default_sheet_columns: DEFAULT_SHEET_COLUMNS,
        }
    }
}

/// Snapshot manager configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct SnapshotConfig {
    /// Estimated cell count above which a snapshot is taken automatically.
    /// Default: 1000
    pub auto_threshold_cells: u64,

    /// Snapshots retained per document.
    /// Default: 20
    pub max_per_document: usize,

    /// Maximum snapshot age.
    /// Default: 7 days
    #[serde(with = "humantime_serde")]
    pub max_age: Duration,
}

impl Default for SnapshotConfig {
    fn default() -> Self {
        Self {
            auto_threshold_cells: DEFAULT_AUTO_SNAPSHOT_THRESHOLD,
            max_per_document: DEFAULT_MAX_SNAPSHOTS_PER_DOCUMENT,
            max_age: DEFAULT_SNAPSHOT_MAX_AGE,
        }
    }
}

/// Diff engine configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct DiffConfig {
    /// Largest affected-cell count that gets a full diff.
    /// Default: 100
    pub full_max_cells: u64,

    /// Largest affected-cell count that gets a sampled diff.
    /// Default: 5000
    pub sample_max_cells: u64,

    /// Changed rows reported from each end of a sampled diff.
    /// Default: 5
    pub sample_edge_rows: usize,

    /// Random changed rows reported in a sampled diff.
    /// Default: 5
    pub sample_random_rows: usize,
}

impl Default for DiffConfig {
    fn default() -> Self {
        Self {
            full_max_cells: DEFAULT_FULL_DIFF_MAX_CELLS,
            sample_max_cells: DEFAULT_SAMPLE_DIFF_MAX_CELLS,
            sample_edge_rows: DEFAULT_SAMPLE_EDGE_ROWS,
            sample_random_rows: DEFAULT_SAMPLE_RANDOM_ROWS,
        }
    }
}

/// Transaction coordinator configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct TransactionConfig {
    /// Idle time after which a pending transaction expires.
    /// Default: 5m
    #[serde(with = "humantime_serde")]
    pub ttl: Duration,

    /// Maximum operations queued per transaction.
    /// Default: 100
    pub max_queued_ops: usize,

    /// Interval of the background expiry sweep; `None` disables it.
    /// Default: 30s
    #[serde(with = "humantime_serde", skip_serializing_if = "Option::is_none")]
    pub reaper_interval: Option<Duration>,
}

impl Default for TransactionConfig {
    fn default() -> Self {
        Self {
            ttl: DEFAULT_TRANSACTION_TTL,
            max_queued_ops: DEFAULT_MAX_QUEUED_OPS,
            reaper_interval: Some(DEFAULT_REAPER_INTERVAL),
        }
    }
}

/// Retry configuration for transient executor failures.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(default)]
pub struct RetryConfig {
    /// Attempts per call, including the first.
    /// Default: 3
    pub max_attempts: u32,

    /// Backoff before the first retry.
    /// Default: 100ms
    #[serde(with = "humantime_serde")]
    pub initial_backoff: Duration,

    /// Upper bound on any single backoff.
    /// Default: 5s
    #[serde(with = "humantime_serde")]
    pub max_backoff: Duration,

    /// Backoff growth factor.
    /// Default: 2.0
    pub multiplier: f64,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            max_attempts: DEFAULT_RETRY_MAX_ATTEMPTS,
            initial_backoff: DEFAULT_RETRY_INITIAL_BACKOFF,
            max_backoff: DEFAULT_RETRY_MAX_BACKOFF,
            multiplier: DEFAULT_RETRY_MULTIPLIER,
        }
    }
}

/// Conflict detector configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct ConflictConfig {
    /// Writes remembered per document in the ledger.
    /// Default: 1000
    pub ledger_capacity: usize,
}

impl Default for ConflictConfig {
    fn default() -> Self {
        Self {
            ledger_capacity: DEFAULT_LEDGER_CAPACITY,
        }
    }
}

/// History log configuration.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct HistoryConfig {
    /// Entries retained per document; the oldest are dropped first.
    /// Default: 500
    pub max_entries_per_document: usize,
}

impl Default for HistoryConfig {
    fn default() -> Self {
        Self {
            max_entries_per_document: DEFAULT_MAX_HISTORY_ENTRIES,
        }
    }
}

/// Builder for [`GuardConfig`].
#[derive(Debug, Default)]
pub struct GuardConfigBuilder {
    config: GuardConfig,
}

impl GuardConfigBuilder {
    /// Creates a new builder.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    /// Sets the data directory.
    #[must_use]
    pub fn data_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.config.data_dir = Some(dir.into());
        self
    }

    /// Requires an expected state on every mutation.
    #[must_use]
    pub fn require_expected_state(mut self, required: bool) -> Self {
        self.config.fence.require_expected_state = required;
        self
    }

    /// Sets the default cell ceiling.
    #[must_use]
    pub fn max_cells_affected(mut self, max: u64) -> Self {
        self.config.scope.max_cells_affected = max;
        self
    }

    /// Requires explicit ranges by default.
    #[must_use]
    pub fn require_explicit_range(mut self, required: bool) -> Self {
        self.config.scope.require_explicit_range = required;
        self
    }

    /// Sets the auto-snapshot threshold.
    #[must_use]
    pub fn auto_snapshot_threshold(mut self, cells: u64) -> Self {
        self.config.snapshot.auto_threshold_cells = cells;
        self
    }

    /// Sets snapshot retention.
    #[must_use]
    pub fn snapshot_retention(mut self, max_per_document: usize, max_age: Duration) -> Self {
        self.config.snapshot.max_per_document = max_per_document;
        self.config.snapshot.max_age = max_age;
        self
    }

    /// Sets the diff tier thresholds.
    #[must_use]
    pub fn diff_thresholds(mut self, full_max: u64, sample_max: u64) -> Self {
        self.config.diff.full_max_cells = full_max;
        self.config.diff.sample_max_cells = sample_max;
        self
    }

    /// Sets the transaction TTL.
    #[must_use]
    pub fn transaction_ttl(mut self, ttl: Duration) -> Self {
        self.config.transaction.ttl = ttl;
        self
    }

    /// Sets the maximum queued operations per transaction.
    #[must_use]
    pub fn max_queued_ops(mut self, max: usize) -> Self {
        self.config.transaction.max_queued_ops = max;
        self
    }

    /// Sets or disables the background expiry sweep.
    #[must_use]
    pub fn reaper_interval(mut self, interval: Option<Duration>) -> Self {
        self.config.transaction.reaper_interval = interval;
        self
    }

    /// Sets the retry policy.
    #[must_use]
    pub fn retry(mut self, retry: RetryConfig) -> Self {
        self.config.retry = retry;
        self
    }

    /// Sets the history cap.
    #[must_use]
    pub fn max_history_entries(mut self, max: usize) -> Self {
        self.config.history.max_entries_per_document = max;
        self
    }

    /// Builds the configuration.
    #[must_use]
    pub fn build(self) -> GuardConfig {
        self.config
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    #[test]
    fn test_default_config() {
        let config = GuardConfig::default();
        assert_eq!(config.scope.default_sheet_rows, 1000);
        assert_eq!(config.scope.default_sheet_columns, 26);
        assert_eq!(config.diff.sample_max_cells, 5000);
        assert_eq!(config.transaction.ttl, Duration::from_secs(300));
        assert!(!config.fence.require_expected_state);
        assert!(config.validate().is_ok());
    }

    #[test]
    fn test_builder() {
        let config = GuardConfig::builder()
            .max_cells_affected(100)
            .require_explicit_range(true)
            .transaction_ttl(Duration::from_secs(10))
            .reaper_interval(None)
            .build();

        assert_eq!(config.scope.max_cells_affected, 100);
        assert!(config.scope.require_explicit_range);
        assert_eq!(config.transaction.ttl, Duration::from_secs(10));
        assert_eq!(config.transaction.reaper_interval, None);
    }

    #[test]
    fn test_partial_toml_uses_defaults() {
        let config = GuardConfig::from_toml(
            r#"
            [transaction]
            ttl = "90s"

            [diff]
            full_max_cells = 50
            "#,
        )
        .unwrap();
        assert_eq!(config.transaction.ttl, Duration::from_secs(90));
        assert_eq!(config.diff.full_max_cells, 50);
        assert_eq!(config.diff.sample_max_cells, 5000);
        assert_eq!(config.snapshot, SnapshotConfig::default());
    }

    #[test]
    fn test_validate_rejects_inverted_thresholds() {
        let config = GuardConfig::builder().diff_thresholds(500, 100).build();
        let err = config.validate().unwrap_err();
        assert!(err.to_string().contains("full_max_cells"));

        let err = GuardConfig::from_toml("[retry]\nmax_attempts = 0\n").unwrap_err();
        assert!(matches!(err, GuardError::InvalidConfig { .. }));
    }

    #[test]
    fn test_save_and_load() {
        let temp_dir = TempDir::new().unwrap();
        let path = temp_dir.path().join("nested").join("sheetguard.toml");

        let config = GuardConfig::builder()
            .data_dir("/var/lib/sheetguard")
            .max_queued_ops(7)
            .snapshot_retention(3, Duration::from_secs(3600))
            .build();
        config.save(&path).unwrap();

        let loaded = GuardConfig::from_file(&path).unwrap();
        assert_eq!(loaded, config);
        assert!(config.to_toml().unwrap().contains("max_age = \"1h\""));
    }

    #[test]
    fn test_missing_file() {
        let err = GuardConfig::from_file(Path::new("/nonexistent/sheetguard.toml")).unwrap_err();
        assert_eq!(err.code(), crate::error::ErrorCode::InvalidConfig);
    }
}
