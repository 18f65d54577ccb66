//! CLI error types and conversions

use crate::catalog::CatalogError;
use crate::client::QueryError;
use crate::downloader::DownloadError;
use crate::manifest::ManifestError;

/// CLI errors
#[derive(Debug, thiserror::Error)]
pub enum CliError {
    /// Catalog error
    #[error("catalog error: {0}")]
    CatalogError(#[from] CatalogError),

    /// Download error
    #[error("download error: {0}")]
    DownloadError(#[from] DownloadError),

    /// Query error
    #[error("query error: {0}")]
    QueryError(#[from] QueryError),

    /// Manifest error
    #[error("manifest error: {0}")]
    ManifestError(#[from] ManifestError),

    /// Invalid argument
    #[error("invalid argument: {0}")]
    InvalidArgument(String),

    /// Configuration error
    #[error("configuration error: {0}")]
    ConfigurationError(String),

    /// Validation found problems
    #[error("validation failed: {0}")]
    ValidationFailed(String),
}
