//! # CSMAR Bulk Downloader Library
//!
//! Acquires large relational datasets from the CSMAR query service, a paginated and
//! rate-limited financial-data API, and persists them as categorized, timestamped
//! CSV files together with a JSON manifest describing the run.
//!
//! ## Features
//!
//! - **Declarative Catalog**: Tables to download are data ([`catalog::TableCatalog`]),
//!   embedded by default and loadable from a JSON file
//! - **Offset Pagination**: Every table is fetched in contiguous pages bounded by the
//!   service's per-query row cap
//! - **Rate Governance**: Identical queries are never resubmitted inside the service's
//!   cooldown window; blocked pages are deferred while other tables make progress
//! - **Partial-Failure Bookkeeping**: One table's failure never affects another table's
//!   outcome, and the manifest records a reason for every non-success
//! - **Resume**: Tables that succeeded in a prior run can be skipped
//! - **Merge**: Selected tables are left-joined into a single wide file
//!
//! ## Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use csmar_bulk_downloader::catalog::TableCatalog;
//! use csmar_bulk_downloader::client::{Credentials, HttpQueryClient};
//! use csmar_bulk_downloader::config::{DateRange, RunConfig};
//! use csmar_bulk_downloader::downloader::DownloadOrchestrator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let catalog = TableCatalog::load_embedded()?;
//! let config = RunConfig::new("output", DateRange::parse("2010-01-01", "2024-12-31")?);
//! let client = Arc::new(HttpQueryClient::new("http://127.0.0.1:8765")?);
//!
//! let orchestrator = DownloadOrchestrator::new(client, catalog, config);
//! let credentials = Credentials::new("user@example.com", "secret", "1");
//! let report = orchestrator.run(&credentials).await?;
//! println!("manifest written to {}", report.manifest_path.display());
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! - [`catalog`] - Table catalog (TableSpec registry) and column validation
//! - [`client`] - Query client adapter over the remote service
//! - [`governor`] - Cooldown tracking, query spacing, backoff and the deferred queue
//! - [`pagination`] - Offset/limit pagination engine
//! - [`downloader`] - Run orchestration and per-table state machine
//! - [`merge`] - Left-join of per-table outputs into one wide dataset
//! - [`manifest`] - Run manifest persistence
//! - [`output`] - CSV writers/readers and output file layout

#![warn(missing_docs)]
#![warn(clippy::all)]

use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

/// Cooperative cancellation shared between the CLI and the orchestrator
pub mod cancel;

/// Table catalog
pub mod catalog;

/// CLI command implementations
pub mod cli;

/// Query client adapter
pub mod client;

/// Run configuration and query policy
pub mod config;

/// Download orchestration
pub mod downloader;

/// Rate governor
pub mod governor;

/// Run-level session lock
pub mod lock;

/// Run manifest
pub mod manifest;

/// Merge stage
pub mod merge;

/// Observability metrics
pub mod metrics;

/// Output writers and file layout
pub mod output;

/// Pagination engine
pub mod pagination;

pub use catalog::{TableCatalog, TableSpec};
pub use client::{QueryClient, QueryError};
pub use downloader::DownloadOrchestrator;

/// Raw cell value as returned by the query service (string, number or null)
pub type Value = serde_json::Value;

/// One row: column name to raw value
pub type Record = HashMap<String, Value>;

/// Catalog category; each category gets its own output directory
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Category {
    /// Listed firm profiles, status changes and staff
    BasicInfo,
    /// Balance sheet, income and cash flow statements
    FinancialStatements,
    /// Solvency, profitability and growth ratios
    FinancialIndicators,
    /// Boards, shareholders, executives and subsidiaries
    CorporateGovernance,
    /// Dividend distribution records
    DividendDistribution,
    /// Trading summaries and returns
    StockTrading,
    /// Market, industry and area classifications
    Classification,
}

impl Category {
    /// Every category, in catalog order
    pub const ALL: [Category; 7] = [
        Category::BasicInfo,
        Category::FinancialStatements,
        Category::FinancialIndicators,
        Category::CorporateGovernance,
        Category::DividendDistribution,
        Category::StockTrading,
        Category::Classification,
    ];

    /// Snake-case name used on disk and on the command line
    pub fn as_str(&self) -> &'static str {
        match self {
            Category::BasicInfo => "basic_info",
            Category::FinancialStatements => "financial_statements",
            Category::FinancialIndicators => "financial_indicators",
            Category::CorporateGovernance => "corporate_governance",
            Category::DividendDistribution => "dividend_distribution",
            Category::StockTrading => "stock_trading",
            Category::Classification => "classification",
        }
    }
}

impl std::fmt::Display for Category {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Category {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Category::ALL
            .iter()
            .find(|c| c.as_str() == s)
            .copied()
            .ok_or_else(|| format!("Invalid category: {s}"))
    }
}

/// Terminal outcome of one table within a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Outcome {
    /// Full extent retrieved and persisted
    Success,
    /// Some pages retrieved and persisted before a failure
    PartialSuccess,
    /// Nothing usable retrieved or persistence failed
    Failure,
}

impl std::fmt::Display for Outcome {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let s = match self {
            Outcome::Success => "success",
            Outcome::PartialSuccess => "partial_success",
            Outcome::Failure => "failure",
        };
        f.write_str(s)
    }
}

/// Error classification recorded in the manifest
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    /// Session missing or expired
    Authentication,
    /// Cooldown violation reported by the service
    RateLimit,
    /// Any other service-side rejection
    RemoteQuery,
    /// Writing output failed
    LocalIo,
    /// Catalog columns missing from the remote table
    Validation,
    /// Run cancelled before the table finished
    Cancelled,
}

impl ErrorKind {
    /// Snake-case label used in metrics and logs
    pub fn as_str(&self) -> &'static str {
        match self {
            ErrorKind::Authentication => "authentication",
            ErrorKind::RateLimit => "rate_limit",
            ErrorKind::RemoteQuery => "remote_query",
            ErrorKind::LocalIo => "local_io",
            ErrorKind::Validation => "validation",
            ErrorKind::Cancelled => "cancelled",
        }
    }
}

/// Error details attached to a non-success [`FetchResult`]
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorDescriptor {
    /// Error classification
    pub kind: ErrorKind,
    /// Human-readable reason
    pub message: String,
    /// Offset of the page that failed, if the failure happened while paging
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub failed_at_offset: Option<u64>,
}

impl ErrorDescriptor {
    /// Create a descriptor without an offset
    pub fn new(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
            failed_at_offset: None,
        }
    }

    /// Attach the offset of the failing page
    pub fn at_offset(mut self, offset: u64) -> Self {
        self.failed_at_offset = Some(offset);
        self
    }
}

/// Result of fetching one table
///
/// Produced once per table per run and never mutated; a later attempt or a failed
/// persistence step produces a new value that supersedes it.
#[derive(Debug, Clone)]
pub struct FetchResult {
    table: String,
    table_name: String,
    category: Category,
    rows: Vec<Record>,
    pages: Vec<pagination::PageSummary>,
    elapsed: Duration,
    outcome: Outcome,
    error: Option<ErrorDescriptor>,
}

impl FetchResult {
    /// Build a result from the rows and pages retrieved.
    ///
    /// The outcome is derived: no error is Success; an error with at least one
    /// retrieved page is PartialSuccess; an error with no page is Failure.
    pub fn new(
        spec: &TableSpec,
        rows: Vec<Record>,
        pages: Vec<pagination::PageSummary>,
        elapsed: Duration,
        error: Option<ErrorDescriptor>,
    ) -> Self {
        let outcome = match (&error, pages.iter().any(|p| p.returned > 0)) {
            (None, _) => Outcome::Success,
            (Some(_), true) => Outcome::PartialSuccess,
            (Some(_), false) => Outcome::Failure,
        };
        Self {
            table: spec.short_name.clone(),
            table_name: spec.table_name.clone(),
            category: spec.category,
            rows,
            pages,
            elapsed,
            outcome,
            error,
        }
    }

    /// A failure that happened before any page was requested
    pub fn failure(spec: &TableSpec, elapsed: Duration, error: ErrorDescriptor) -> Self {
        Self::new(spec, Vec::new(), Vec::new(), elapsed, Some(error))
    }

    /// Supersede this result with a Failure, keeping its pages for the audit trail
    pub fn superseded_by_failure(self, error: ErrorDescriptor) -> Self {
        Self {
            outcome: Outcome::Failure,
            error: Some(error),
            ..self
        }
    }

    /// Catalog short name
    pub fn table(&self) -> &str {
        &self.table
    }

    /// Remote table name
    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    /// Catalog category
    pub fn category(&self) -> Category {
        self.category
    }

    /// Retrieved rows, in service order
    pub fn rows(&self) -> &[Record] {
        &self.rows
    }

    /// Number of retrieved rows
    pub fn row_count(&self) -> u64 {
        self.rows.len() as u64
    }

    /// Pages retrieved, in offset order
    pub fn pages(&self) -> &[pagination::PageSummary] {
        &self.pages
    }

    /// Time spent fetching (excludes time waiting in the deferred queue)
    pub fn elapsed(&self) -> Duration {
        self.elapsed
    }

    /// Terminal outcome
    pub fn outcome(&self) -> Outcome {
        self.outcome
    }

    /// Error details for non-success outcomes
    pub fn error(&self) -> Option<&ErrorDescriptor> {
        self.error.as_ref()
    }
}
