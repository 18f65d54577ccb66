//! CLI command implementations

pub mod catalog;
pub mod download;
pub mod error;
pub mod explore;
pub mod validate;

pub use catalog::CatalogCommand;
pub use download::{Cli, Commands, DownloadArgs};
pub use error::CliError;
pub use explore::ExploreCommand;
pub use validate::ValidateCommand;

use crate::catalog::TableCatalog;
use crate::client::{Credentials, HttpQueryClient, QueryClient};
use std::sync::Arc;

/// Environment variable holding the account name
pub const USERNAME_ENV: &str = "CSMAR_USERNAME";

/// Environment variable holding the password
pub const PASSWORD_ENV: &str = "CSMAR_PASSWORD";

/// Environment variable holding the service language code
pub const LANGUAGE_ENV: &str = "CSMAR_LANGUAGE";

/// Output format for command summaries
#[derive(Debug, Clone, Copy, PartialEq, Eq, clap::ValueEnum)]
pub enum OutputFormat {
    /// Human-readable output
    Human,
    /// JSON output
    Json,
}

/// Read credentials from `CSMAR_USERNAME`, `CSMAR_PASSWORD` and `CSMAR_LANGUAGE`
pub fn credentials_from_env() -> Result<Credentials, CliError> {
    credentials_from(|key| std::env::var(key).ok())
}

/// Build credentials from a variable lookup
pub fn credentials_from(lookup: impl Fn(&str) -> Option<String>) -> Result<Credentials, CliError> {
    let required = |key: &str| {
        lookup(key)
            .filter(|v| !v.trim().is_empty())
            .ok_or_else(|| CliError::ConfigurationError(format!("{key} is not set")))
    };
    let username = required(USERNAME_ENV)?;
    let password = required(PASSWORD_ENV)?;
    let language = lookup(LANGUAGE_ENV)
        .filter(|v| !v.trim().is_empty())
        .unwrap_or_else(|| "1".to_string());
    Ok(Credentials::new(username, password, language))
}

/// The catalog named by `--catalog`, or the embedded one
pub fn load_catalog(cli: &Cli) -> Result<TableCatalog, CliError> {
    let catalog = match &cli.catalog {
        Some(path) => TableCatalog::from_path(path)?,
        None => TableCatalog::load_embedded()?,
    };
    Ok(catalog)
}

/// HTTP client for `--gateway-url`
pub fn connect(cli: &Cli) -> Result<Arc<dyn QueryClient>, CliError> {
    let client = HttpQueryClient::new(&cli.gateway_url)?;
    Ok(Arc::new(client))
}
