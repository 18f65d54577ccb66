//! Deterministic output file layout
//!
//! ```text
//! <root>/<category>/<short_name>_<run_id>.csv
//! <root>/manifest_<run_id>.json
//! <root>/<merge_name>_<run_id>.csv
//! ```
//!
//! # Usage Example
//!
//! ```rust
//! use csmar_bulk_downloader::output::OutputLayout;
//! use csmar_bulk_downloader::Category;
//! use std::path::PathBuf;
//!
//! let layout = OutputLayout::new("output");
//! let path = layout.table_file(Category::FinancialStatements, "balance_sheet", "20240101_120000");
//! assert_eq!(
//!     path,
//!     PathBuf::from("output/financial_statements/balance_sheet_20240101_120000.csv")
//! );
//! ```

use crate::Category;
use chrono::{DateTime, Utc};
use std::path::{Path, PathBuf};

/// Timestamp format of run identifiers
pub const RUN_ID_FORMAT: &str = "%Y%m%d_%H%M%S";

/// Longest accepted file stem
const MAX_STEM_LEN: usize = 128;

/// Output layout rooted at one directory
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OutputLayout {
    root: PathBuf,
}

impl OutputLayout {
    /// Create a layout rooted at `root`
    pub fn new(root: impl Into<PathBuf>) -> Self {
        Self { root: root.into() }
    }

    /// Root directory
    pub fn root(&self) -> &Path {
        &self.root
    }

    /// Per-table CSV file
    pub fn table_file(&self, category: Category, short_name: &str, run_id: &str) -> PathBuf {
        self.root
            .join(category.as_str())
            .join(format!("{short_name}_{run_id}.csv"))
    }

    /// Run manifest file
    pub fn manifest_file(&self, run_id: &str) -> PathBuf {
        self.root.join(format!("manifest_{run_id}.json"))
    }

    /// Merged dataset file
    pub fn merged_file(&self, merge_name: &str, run_id: &str) -> PathBuf {
        self.root.join(format!("{merge_name}_{run_id}.csv"))
    }

    /// `path` relative to the root, for recording in the manifest
    pub fn relative(&self, path: &Path) -> String {
        path.strip_prefix(&self.root)
            .unwrap_or(path)
            .to_string_lossy()
            .replace('\\', "/")
    }

    /// Resolve a manifest-relative path against the root
    pub fn resolve(&self, relative: &str) -> PathBuf {
        self.root.join(relative)
    }
}

/// Run identifier for a start time
pub fn run_id_from(time: DateTime<Utc>) -> String {
    time.format(RUN_ID_FORMAT).to_string()
}

/// Check that `stem` is safe to embed in a file name
///
/// Accepts ASCII letters, digits, `_` and `-` only.
pub fn check_file_stem(stem: &str) -> Result<(), String> {
    if stem.is_empty() {
        return Err("name must not be empty".to_string());
    }
    if stem.len() > MAX_STEM_LEN {
        return Err(format!("name '{stem}' is longer than {MAX_STEM_LEN} characters"));
    }
    if !stem
        .chars()
        .all(|c| c.is_ascii_alphanumeric() || c == '_' || c == '-')
    {
        return Err(format!(
            "name '{stem}' may only contain letters, digits, '_' and '-'"
        ));
    }
    Ok(())
}
