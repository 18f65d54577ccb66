//! Table catalog: the declarative list of tables a run downloads
//!
//! The catalog is data. A default catalog is embedded in the binary; a user
//! catalog with the same JSON shape can be loaded from disk. Every entry is
//! validated on load, independently of any fetch logic.

use crate::config::{CategorySelection, DateRange, EntityFilter};
use crate::Category;
use once_cell::sync::Lazy;
use serde::{Deserialize, Serialize};
use std::collections::HashSet;
use std::path::Path;

pub mod validate;

/// Embedded catalog data
const CATALOG_JSON: &str = include_str!("tables.json");

/// Global embedded catalog (loaded once)
static CATALOG: Lazy<Result<TableCatalog, CatalogError>> =
    Lazy::new(|| TableCatalog::from_json(CATALOG_JSON));

/// Maximum allowed catalog file size (4 MB)
pub const MAX_CATALOG_FILE_SIZE: u64 = 4 * 1024 * 1024;

/// Filter template used when a table does not declare one
pub const DEFAULT_FILTER_TEMPLATE: &str = "{entity}";

/// Placeholders a filter template may reference
const PLACEHOLDERS: [&str; 3] = ["entity", "start_date", "end_date"];

/// Entity identifier columns, in lookup priority order (case-insensitive)
const ENTITY_FIELD_CANDIDATES: [&str; 4] = ["stkcd", "symbol", "stkcode", "stockcode"];

/// Entity column used when no candidate is present
const FALLBACK_ENTITY_FIELD: &str = "Stkcd";

fn default_filter_template() -> String {
    DEFAULT_FILTER_TEMPLATE.to_string()
}

/// Declaration of one remote table to download
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct TableSpec {
    /// Output category
    pub category: Category,
    /// Remote table name
    pub table_name: String,
    /// Filename key, unique in the catalog
    pub short_name: String,
    /// Human-readable description
    #[serde(default)]
    pub display_name: String,
    /// Columns to request, in output order
    pub columns: Vec<String>,
    /// Predicate template; may reference `{entity}`, `{start_date}` and `{end_date}`
    #[serde(default = "default_filter_template")]
    pub filter_template: String,
    /// Whether the date range applies to this table
    #[serde(default)]
    pub time_varying: bool,
    /// Known row count, used as the pagination bound
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub expected_rows: Option<u64>,
    /// Column holding the entity identifier
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub entity_field: Option<String>,
    /// Column used as the date join key when merging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub date_field: Option<String>,
}

impl TableSpec {
    /// Column holding the entity identifier
    ///
    /// An explicit `entity_field` wins; otherwise the first of Stkcd, Symbol,
    /// StkCode and StockCode present in `columns` (case-insensitive), falling back
    /// to `Stkcd`.
    pub fn entity_column(&self) -> &str {
        if let Some(field) = &self.entity_field {
            return field;
        }
        ENTITY_FIELD_CANDIDATES
            .iter()
            .find_map(|candidate| {
                self.columns
                    .iter()
                    .find(|c| c.eq_ignore_ascii_case(candidate))
            })
            .map(String::as_str)
            .unwrap_or(FALLBACK_ENTITY_FIELD)
    }

    /// Column used as the date join key, if declared
    pub fn date_column(&self) -> Option<&str> {
        self.date_field.as_deref()
    }

    /// Render the filter template into a condition for the service
    pub fn condition(&self, entity: &EntityFilter, range: &DateRange) -> String {
        self.filter_template
            .replace("{entity}", &entity.condition(self.entity_column()))
            .replace("{start_date}", &range.start_str())
            .replace("{end_date}", &range.end_str())
    }

    /// Validate the declaration
    pub fn validate(&self) -> Result<(), String> {
        if self.table_name.trim().is_empty() {
            return Err("table_name must not be empty".to_string());
        }
        crate::output::path::check_file_stem(&self.short_name)?;
        if self.columns.is_empty() {
            return Err("columns must not be empty".to_string());
        }

        let mut seen = HashSet::new();
        for column in &self.columns {
            if column.trim().is_empty() {
                return Err("column names must not be empty".to_string());
            }
            if !seen.insert(column.as_str()) {
                return Err(format!("duplicate column '{column}'"));
            }
        }

        if let Some(field) = &self.entity_field {
            if !self.columns.contains(field) {
                return Err(format!("entity_field '{field}' is not a listed column"));
            }
        }
        if let Some(field) = &self.date_field {
            if !self.columns.contains(field) {
                return Err(format!("date_field '{field}' is not a listed column"));
            }
        }

        check_template(&self.filter_template)
    }
}

/// Reject unknown or unbalanced placeholders
fn check_template(template: &str) -> Result<(), String> {
    let mut rest = template;
    while let Some(open) = rest.find('{') {
        let after = &rest[open + 1..];
        let close = after
            .find('}')
            .ok_or_else(|| format!("unterminated placeholder in filter template '{template}'"))?;
        let name = &after[..close];
        if !PLACEHOLDERS.contains(&name) {
            return Err(format!("unknown placeholder '{{{name}}}' in filter template"));
        }
        rest = &after[close + 1..];
    }
    if rest.contains('}') {
        return Err(format!("unbalanced '}}' in filter template '{template}'"));
    }
    Ok(())
}

#[derive(Debug, Deserialize)]
struct RawCatalog {
    schema_version: String,
    #[serde(default)]
    last_updated: String,
    tables: Vec<TableSpec>,
}

/// Ordered, validated collection of [`TableSpec`]s
#[derive(Debug, Clone)]
pub struct TableCatalog {
    schema_version: String,
    last_updated: String,
    tables: Vec<TableSpec>,
}

impl TableCatalog {
    /// Load the embedded catalog
    ///
    /// The embedded JSON is parsed once and cached; callers get an owned copy.
    pub fn load_embedded() -> Result<Self, CatalogError> {
        CATALOG.as_ref().cloned().map_err(Clone::clone)
    }

    /// Load a catalog file
    pub fn from_path(path: &Path) -> Result<Self, CatalogError> {
        let metadata = std::fs::metadata(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        if metadata.len() > MAX_CATALOG_FILE_SIZE {
            return Err(CatalogError::TooLarge {
                size: metadata.len(),
                max: MAX_CATALOG_FILE_SIZE,
            });
        }
        let json = std::fs::read_to_string(path)
            .map_err(|e| CatalogError::Io(format!("{}: {e}", path.display())))?;
        Self::from_json(&json)
    }

    /// Parse and validate a catalog from JSON
    pub fn from_json(json: &str) -> Result<Self, CatalogError> {
        let raw: RawCatalog = serde_json::from_str(json)
            .map_err(|e| CatalogError::Parse(format!("Failed to parse catalog: {e}")))?;
        let mut catalog = Self::from_specs(raw.tables)?;
        catalog.schema_version = raw.schema_version;
        catalog.last_updated = raw.last_updated;
        Ok(catalog)
    }

    /// Build a catalog from specs, validating each and enforcing unique short names
    pub fn from_specs(tables: Vec<TableSpec>) -> Result<Self, CatalogError> {
        let mut short_names = HashSet::new();
        for spec in &tables {
            spec.validate().map_err(|reason| CatalogError::InvalidTable {
                table: spec.short_name.clone(),
                reason,
            })?;
            if !short_names.insert(spec.short_name.as_str()) {
                return Err(CatalogError::DuplicateShortName(spec.short_name.clone()));
            }
        }
        Ok(Self {
            schema_version: "1.0.0".to_string(),
            last_updated: String::new(),
            tables,
        })
    }

    /// Catalog schema version
    pub fn schema_version(&self) -> &str {
        &self.schema_version
    }

    /// Date the catalog was last revised, if recorded
    pub fn last_updated(&self) -> &str {
        &self.last_updated
    }

    /// All tables in catalog order
    pub fn tables(&self) -> &[TableSpec] {
        &self.tables
    }

    /// Number of tables
    pub fn len(&self) -> usize {
        self.tables.len()
    }

    /// Whether the catalog has no tables
    pub fn is_empty(&self) -> bool {
        self.tables.is_empty()
    }

    /// Look up a table by short name
    pub fn get(&self, short_name: &str) -> Option<&TableSpec> {
        self.tables.iter().find(|t| t.short_name == short_name)
    }

    /// Tables allowed by the category selection, in catalog order
    pub fn select(&self, selection: &CategorySelection) -> Vec<&TableSpec> {
        self.tables
            .iter()
            .filter(|t| selection.allows(t.category))
            .collect()
    }

    /// Categories present in the catalog, in first-appearance order
    pub fn categories(&self) -> Vec<Category> {
        let mut out = Vec::new();
        for table in &self.tables {
            if !out.contains(&table.category) {
                out.push(table.category);
            }
        }
        out
    }
}

/// Catalog errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum CatalogError {
    /// Catalog JSON could not be parsed
    #[error("parse error: {0}")]
    Parse(String),

    /// A table declaration is invalid
    #[error("invalid table '{table}': {reason}")]
    InvalidTable {
        /// Short name of the offending table
        table: String,
        /// What is wrong with it
        reason: String,
    },

    /// Two tables share a short name
    #[error("duplicate short name: {0}")]
    DuplicateShortName(String),

    /// Referenced table does not exist
    #[error("table not found: {0}")]
    NotFound(String),

    /// Catalog file too large
    #[error("catalog file too large: {size} bytes (max: {max} bytes)")]
    TooLarge {
        /// Actual file size
        size: u64,
        /// Maximum allowed size
        max: u64,
    },

    /// IO error
    #[error("IO error: {0}")]
    Io(String),
}
