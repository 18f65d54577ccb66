//! Run manifest persistence
//!
//! The manifest is the auditable record of one run: every selected table with
//! its outcome, row count, file and a reason for any non-success, plus run-level
//! totals and the merge summary. It is saved after every table, so an interrupted
//! run still leaves an accurate manifest behind, and loaded again to resume.
//!
//! Writes are atomic: the JSON goes to a temp file in the same directory, is
//! synced, and then renamed over the target.

use crate::config::{DateRange, EntityFilter};
use crate::governor::QuerySignature;
use crate::pagination::PageSummary;
use crate::{Category, ErrorKind, FetchResult, Outcome};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::io::Write;
use std::path::Path;
use tracing::{debug, info, warn};

/// Current manifest schema version
pub const SCHEMA_VERSION: &str = "1.0.0";

/// Maximum allowed manifest file size (16 MB) to prevent memory exhaustion
pub const MAX_MANIFEST_FILE_SIZE: u64 = 16 * 1024 * 1024;

/// Outcome record of one table
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableEntry {
    /// Catalog short name
    pub table: String,
    /// Remote table name
    pub table_name: String,
    /// Catalog category
    pub category: Category,
    /// Terminal outcome
    pub outcome: Outcome,
    /// Rows persisted
    pub row_count: u64,
    /// Size of the output file
    pub bytes: u64,
    /// Time spent fetching
    pub elapsed_ms: u64,
    /// Output file relative to the output root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Pages retrieved, in offset order
    #[serde(default)]
    pub pages: Vec<PageSummary>,
    /// Row count reported by the service before paging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_rows: Option<u64>,
    /// Human-readable reason for a non-success outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<String>,
    /// Error classification for a non-success outcome
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error_kind: Option<ErrorKind>,
    /// Offset of the page that failed
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_offset: Option<u64>,
    /// Run whose output this entry was carried over from
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub resumed_from: Option<String>,
}

impl TableEntry {
    /// Entry for a fetch result whose rows were written to `file`
    pub fn from_result(result: &FetchResult, file: Option<String>, bytes: u64) -> Self {
        let error = result.error();
        Self {
            table: result.table().to_string(),
            table_name: result.table_name().to_string(),
            category: result.category(),
            outcome: result.outcome(),
            row_count: result.row_count(),
            bytes,
            elapsed_ms: result.elapsed().as_millis() as u64,
            file,
            pages: result.pages().to_vec(),
            expected_rows: None,
            reason: error.map(|e| e.message.clone()),
            error_kind: error.map(|e| e.kind),
            failed_at_offset: error.and_then(|e| e.failed_at_offset),
            resumed_from: None,
        }
    }

    /// Attach the pre-count
    pub fn with_expected_rows(mut self, expected: Option<u64>) -> Self {
        self.expected_rows = expected;
        self
    }

    /// Copy of a prior run's successful entry, marked as carried over
    pub fn carried_over(&self, prior_run_id: &str) -> Self {
        Self {
            resumed_from: Some(
                self.resumed_from
                    .clone()
                    .unwrap_or_else(|| prior_run_id.to_string()),
            ),
            elapsed_ms: 0,
            ..self.clone()
        }
    }
}

/// Table left out of the merge, with the reason
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MergeExclusion {
    /// Catalog short name
    pub table: String,
    /// Why it was excluded
    pub reason: String,
}

/// Result of the merge stage
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct MergeSummary {
    /// Merge name
    pub name: String,
    /// Merged file relative to the output root
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub file: Option<String>,
    /// Table chosen as the left side of every join
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub base_table: Option<String>,
    /// Tables merged, in join order
    pub tables: Vec<String>,
    /// Tables excluded, with reasons
    pub excluded: Vec<MergeExclusion>,
    /// Rows in the merged file
    pub row_count: u64,
    /// Columns in the merged file
    pub column_count: u64,
    /// Size of the merged file
    pub bytes: u64,
    /// Why the merge produced no file
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}

/// A query signature armed during the run, for cooldown seeding on resume
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct IssuedQuery {
    /// Signature
    #[serde(flatten)]
    pub signature: QuerySignature,
    /// Wall-clock time the signature was armed
    pub at: DateTime<Utc>,
}

/// Persisted summary of one run
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RunManifest {
    schema_version: String,
    /// Run identifier (`YYYYMMDD_HHMMSS`)
    pub run_id: String,
    /// Account the session belonged to
    pub account: String,
    /// Run start
    pub start_time: DateTime<Utc>,
    /// Run end, set on finalize
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub end_time: Option<DateTime<Utc>>,
    /// Query date range
    pub date_range: DateRange,
    /// Entity selection
    pub entity_filter: EntityFilter,
    /// Per-table entries
    pub tables: Vec<TableEntry>,
    /// Sum of entry row counts
    pub total_rows: u64,
    /// Sum of entry file sizes
    pub total_bytes: u64,
    /// The run was cancelled before all tables finished
    #[serde(default)]
    pub cancelled: bool,
    /// The run aborted on an authentication failure
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub aborted: Option<String>,
    /// Selected tables never started
    #[serde(default)]
    pub not_attempted: Vec<String>,
    /// Merge stage summary
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub merge: Option<MergeSummary>,
    /// Signatures still cooling down at the last save
    #[serde(default)]
    pub issued_queries: Vec<IssuedQuery>,
}

impl RunManifest {
    /// Start a manifest for a new run
    pub fn new(
        run_id: impl Into<String>,
        account: impl Into<String>,
        start_time: DateTime<Utc>,
        date_range: DateRange,
        entity_filter: EntityFilter,
    ) -> Self {
        Self {
            schema_version: SCHEMA_VERSION.to_string(),
            run_id: run_id.into(),
            account: account.into(),
            start_time,
            end_time: None,
            date_range,
            entity_filter,
            tables: Vec::new(),
            total_rows: 0,
            total_bytes: 0,
            cancelled: false,
            aborted: None,
            not_attempted: Vec::new(),
            merge: None,
            issued_queries: Vec::new(),
        }
    }

    /// Schema version
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Record a table entry, superseding any earlier entry for the same table
    pub fn record(&mut self, entry: TableEntry) {
        match self.tables.iter_mut().find(|e| e.table == entry.table) {
            Some(existing) => *existing = entry,
            None => self.tables.push(entry),
        }
        self.recompute_totals();
    }

    /// Entry for a table
    pub fn entry(&self, table: &str) -> Option<&TableEntry> {
        self.tables.iter().find(|e| e.table == table)
    }

    /// Count of entries with `outcome`
    pub fn count(&self, outcome: Outcome) -> usize {
        self.tables.iter().filter(|e| e.outcome == outcome).count()
    }

    /// Reorder entries to follow `order` (short names); unknown tables go last
    pub fn sort_entries(&mut self, order: &[&str]) {
        self.tables.sort_by_key(|e| {
            order
                .iter()
                .position(|name| *name == e.table)
                .unwrap_or(usize::MAX)
        });
    }

    /// Stamp the end time and recompute totals
    pub fn finalize(&mut self, end_time: DateTime<Utc>) {
        self.end_time = Some(end_time);
        self.recompute_totals();
    }

    fn recompute_totals(&mut self) {
        self.total_rows = self.tables.iter().map(|e| e.row_count).sum();
        self.total_bytes = self.tables.iter().map(|e| e.bytes).sum();
    }

    /// Save atomically to `path`
    pub fn save(&self, path: &Path) -> Result<(), ManifestError> {
        debug!(path = %path.display(), tables = self.tables.len(), "Saving manifest");

        let parent_dir = match path.parent() {
            Some(parent) if !parent.as_os_str().is_empty() => parent,
            _ => Path::new("."),
        };
        std::fs::create_dir_all(parent_dir).map_err(|e| ManifestError::IoError(e.to_string()))?;

        let json = serde_json::to_string_pretty(self)
            .map_err(|e| ManifestError::SerializationError(e.to_string()))?;

        let mut temp_file = tempfile::NamedTempFile::new_in(parent_dir)
            .map_err(|e| ManifestError::IoError(format!("Failed to create temp file: {e}")))?;

        temp_file
            .write_all(json.as_bytes())
            .map_err(|e| ManifestError::IoError(format!("Failed to write to temp file: {e}")))?;

        // Flush buffer to OS and sync to disk before the rename
        temp_file
            .flush()
            .map_err(|e| ManifestError::IoError(format!("Failed to flush temp file: {e}")))?;
        temp_file
            .as_file()
            .sync_all()
            .map_err(|e| ManifestError::IoError(format!("Failed to sync temp file: {e}")))?;

        temp_file
            .persist(path)
            .map_err(|e| ManifestError::IoError(format!("Failed to persist temp file: {e}")))?;

        // Fsync parent directory so the rename is durable
        if let Ok(dir) = std::fs::File::open(parent_dir) {
            let _ = dir.sync_all();
        }

        info!(
            path = %path.display(),
            tables = self.tables.len(),
            total_rows = self.total_rows,
            "Manifest saved"
        );
        Ok(())
    }

    /// Load a manifest, rejecting oversized files and unknown schema versions
    pub fn load(path: &Path) -> Result<Self, ManifestError> {
        debug!(path = %path.display(), "Loading manifest");

        let metadata = std::fs::metadata(path).map_err(|e| {
            if e.kind() == std::io::ErrorKind::NotFound {
                ManifestError::NotFound(path.display().to_string())
            } else {
                ManifestError::IoError(e.to_string())
            }
        })?;
        if metadata.len() > MAX_MANIFEST_FILE_SIZE {
            return Err(ManifestError::TooLarge {
                size: metadata.len(),
                max: MAX_MANIFEST_FILE_SIZE,
            });
        }

        let contents =
            std::fs::read_to_string(path).map_err(|e| ManifestError::IoError(e.to_string()))?;
        let manifest: RunManifest = serde_json::from_str(&contents).map_err(|e| {
            warn!(error = %e, "Failed to deserialize manifest");
            ManifestError::DeserializationError(e.to_string())
        })?;

        if manifest.schema_version != SCHEMA_VERSION {
            warn!(
                found_version = %manifest.schema_version,
                expected_version = SCHEMA_VERSION,
                "Manifest schema version mismatch"
            );
            return Err(ManifestError::SchemaVersionMismatch {
                expected: SCHEMA_VERSION.to_string(),
                found: manifest.schema_version,
            });
        }

        info!(
            run_id = %manifest.run_id,
            tables = manifest.tables.len(),
            "Manifest loaded"
        );
        Ok(manifest)
    }
}

/// Manifest errors
#[derive(Debug, thiserror::Error)]
pub enum ManifestError {
    /// Manifest file does not exist
    #[error("manifest not found: {0}")]
    NotFound(String),

    /// Schema version mismatch
    #[error("schema version mismatch: expected {expected}, found {found}")]
    SchemaVersionMismatch {
        /// Expected schema version
        expected: String,
        /// Found schema version
        found: String,
    },

    /// Manifest file too large
    #[error("manifest file too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    IoError(String),

    /// Serialization error
    #[error("serialization error: {0}")]
    SerializationError(String),

    /// Deserialization error
    #[error("deserialization error: {0}")]
    DeserializationError(String),
}
