//! Run orchestration and the per-table state machine
//!
//! This module drives a complete acquisition run over one authenticated
//! session, with partial-failure bookkeeping, cooldown-aware deferral and
//! resume support.
//!
//! # Overview
//!
//! A run proceeds in stages:
//!
//! 1. **Lock**: One run per account at a time ([`crate::lock::RunLock`])
//! 2. **Resume**: Successful tables of a prior run are carried over and its
//!    cooldowns re-armed
//! 3. **Validation**: Catalog columns are checked against the remote table
//! 4. **Fetch**: Each table is paged through [`crate::pagination::Paginator`];
//!    a page blocked by cooldown sends its table to the deferred queue while
//!    the next table starts
//! 5. **Drain**: Deferred tables resume from their stored offset once their
//!    cooldown has expired
//! 6. **Merge**: Optionally, selected tables are left-joined into one file
//! 7. **Manifest**: Saved after every table and finalized at the end
//!
//! # Quick Start
//!
//! ```no_run
//! use std::sync::Arc;
//! use csmar_bulk_downloader::catalog::TableCatalog;
//! use csmar_bulk_downloader::client::{Credentials, HttpQueryClient};
//! use csmar_bulk_downloader::config::{DateRange, MergeConfig, RunConfig};
//! use csmar_bulk_downloader::downloader::DownloadOrchestrator;
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = RunConfig::new("./output", DateRange::default()).with_merge(MergeConfig {
//!     name: "classifications".to_string(),
//!     tables: Vec::new(),
//! });
//! let client = Arc::new(HttpQueryClient::new("http://127.0.0.1:8765")?);
//! let orchestrator = DownloadOrchestrator::new(client, TableCatalog::load_embedded()?, config);
//!
//! let report = orchestrator
//!     .run(&Credentials::new("user@example.com", "secret", "1"))
//!     .await?;
//! println!("{} rows", report.manifest.total_rows);
//! # Ok(())
//! # }
//! ```
//!
//! # Error Handling
//!
//! Table-level failures never surface as `Err`: they are recorded in the
//! manifest with an [`crate::ErrorKind`] and a reason. `DownloadOrchestrator::run`
//! returns [`DownloadError`] only for run-level problems:
//! - Invalid configuration
//! - Another run holding the account lock
//! - Authentication failure (the manifest is still saved, marked aborted)
//! - Output root or manifest not writable

pub mod job;
pub mod orchestrator;
pub mod progress;

pub use job::{InvalidTransition, TableJob, TableState};
pub use orchestrator::{DownloadOrchestrator, RunReport};
pub use progress::{BarProgress, NoProgress, ProgressObserver};

use crate::catalog::CatalogError;
use crate::lock::LockError;
use crate::manifest::ManifestError;

/// Run-level download errors
#[derive(Debug, thiserror::Error)]
pub enum DownloadError {
    /// Invalid run configuration
    #[error("invalid configuration: {0}")]
    Config(String),

    /// Login rejected or session expired; the run was aborted
    #[error("{0}")]
    Authentication(String),

    /// Login failed for a reason other than credentials
    #[error("connection error: {0}")]
    Connection(String),

    /// Another run holds the account lock
    #[error("lock error: {0}")]
    Lock(#[from] LockError),

    /// Manifest could not be loaded or saved
    #[error("manifest error: {0}")]
    Manifest(#[from] ManifestError),

    /// Catalog error
    #[error("catalog error: {0}")]
    Catalog(#[from] CatalogError),

    /// Output root not usable
    #[error("IO error: {0}")]
    Io(String),

    /// Internal state machine violation
    #[error("state error: {0}")]
    State(#[from] InvalidTransition),
}
