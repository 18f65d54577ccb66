//! Column validation against the remote field listing
//!
//! Before a run fetches anything, each selected table's catalog columns can be
//! compared with the fields the service reports for it. A table with missing
//! columns is reported and skipped; it never fails the run.

use crate::catalog::TableSpec;
use crate::client::{QueryClient, QueryError, Session};
use serde::Serialize;
use tracing::{debug, warn};

/// Result of checking one table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "status", content = "detail", rename_all = "snake_case")]
pub enum ColumnStatus {
    /// Every catalog column is available
    Ok,
    /// Catalog columns absent from the remote table, in catalog order
    MissingColumns(Vec<String>),
    /// The field listing could not be retrieved
    Error(String),
}

/// Column check for one catalog table
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ColumnCheck {
    /// Catalog short name
    pub table: String,
    /// Remote table name
    pub table_name: String,
    /// Number of fields the service reported
    pub available: usize,
    /// Outcome of the check
    #[serde(flatten)]
    pub status: ColumnStatus,
}

impl ColumnCheck {
    /// Whether the table can be fetched as declared
    pub fn is_ok(&self) -> bool {
        self.status == ColumnStatus::Ok
    }

    /// Reason a table failed the check, for the manifest
    pub fn reason(&self) -> Option<String> {
        match &self.status {
            ColumnStatus::Ok => None,
            ColumnStatus::MissingColumns(missing) => {
                Some(format!("missing columns: {}", missing.join(", ")))
            }
            ColumnStatus::Error(message) => Some(format!("field listing failed: {message}")),
        }
    }
}

/// Counts over a set of checks
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct ValidationSummary {
    /// Tables checked
    pub total: usize,
    /// Tables with every column available
    pub ok: usize,
    /// Tables with missing columns
    pub missing: usize,
    /// Tables whose listing failed
    pub errors: usize,
}

impl ValidationSummary {
    /// Summarize `checks`
    pub fn from_checks(checks: &[ColumnCheck]) -> Self {
        let mut summary = Self {
            total: checks.len(),
            ..Self::default()
        };
        for check in checks {
            match check.status {
                ColumnStatus::Ok => summary.ok += 1,
                ColumnStatus::MissingColumns(_) => summary.missing += 1,
                ColumnStatus::Error(_) => summary.errors += 1,
            }
        }
        summary
    }

    /// Whether every table passed
    pub fn all_ok(&self) -> bool {
        self.ok == self.total
    }
}

/// Compare each table's catalog columns with the fields the service reports
///
/// Only an authentication failure is returned as an error; any other listing
/// failure is recorded against its table.
pub async fn check_columns(
    client: &dyn QueryClient,
    session: &Session,
    specs: &[&TableSpec],
) -> Result<Vec<ColumnCheck>, QueryError> {
    let mut checks = Vec::with_capacity(specs.len());

    for spec in specs {
        let (available, status) = match client.list_fields(session, &spec.table_name).await {
            Ok(fields) => {
                let missing: Vec<String> = spec
                    .columns
                    .iter()
                    .filter(|column| !fields.contains(column))
                    .cloned()
                    .collect();
                let status = if missing.is_empty() {
                    ColumnStatus::Ok
                } else {
                    warn!(
                        table = %spec.short_name,
                        missing = %missing.join(","),
                        "Catalog columns missing from remote table"
                    );
                    ColumnStatus::MissingColumns(missing)
                };
                (fields.len(), status)
            }
            Err(error @ QueryError::Authentication(_)) => return Err(error),
            Err(error) => {
                warn!(table = %spec.short_name, error = %error, "Field listing failed");
                (0, ColumnStatus::Error(error.to_string()))
            }
        };

        debug!(table = %spec.short_name, available, "Columns checked");
        checks.push(ColumnCheck {
            table: spec.short_name.clone(),
            table_name: spec.table_name.clone(),
            available,
            status,
        });
    }

    Ok(checks)
}
