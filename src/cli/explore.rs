//! CLI command for browsing the remote service's catalog

use super::{connect, credentials_from_env, Cli, CliError, OutputFormat};
use crate::client::{search_tables, TableInfo, TableMatch};
use clap::Args;
use serde::Serialize;
use tracing::info;

/// Explore subcommand
#[derive(Debug, Args)]
pub struct ExploreCommand {
    #[command(subcommand)]
    target: ExploreTarget,

    /// Output format
    #[arg(long, global = true, default_value = "human")]
    format: OutputFormat,
}

/// What to list
#[derive(Debug, clap::Subcommand)]
enum ExploreTarget {
    /// List databases visible to the account
    Databases,
    /// List tables of a database
    Tables {
        /// Database name
        database: String,
    },
    /// List fields of a table
    Fields {
        /// Remote table name
        table: String,
    },
    /// Search table names and descriptions across all databases
    Search {
        /// Keyword (case-insensitive)
        keyword: String,
    },
}

impl ExploreCommand {
    /// Execute the explore command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        let credentials = credentials_from_env()?;
        let client = connect(cli)?;
        let session = client.login(&credentials).await?;
        info!(
            account = %session.account(),
            at = %session.established_at().format("%H:%M:%S"),
            "Logged in"
        );

        match &self.target {
            ExploreTarget::Databases => {
                let names = client.list_databases(&session).await?;
                self.print_names("databases", &names)
            }
            ExploreTarget::Fields { table } => {
                let names = client.list_fields(&session, table).await?;
                self.print_names("fields", &names)
            }
            ExploreTarget::Tables { database } => {
                let tables = client.list_tables(&session, database).await?;
                self.print(tables.as_slice(), |tables| {
                    println!("Found {} tables in {database}:\n", tables.len());
                    for table in tables {
                        println!("  {}", describe(table));
                    }
                })
            }
            ExploreTarget::Search { keyword } => {
                let matches = search_tables(client.as_ref(), &session, keyword).await?;
                self.print(matches.as_slice(), |matches: &[TableMatch]| {
                    if matches.is_empty() {
                        println!("No tables found matching '{keyword}'");
                        return;
                    }
                    println!("Found {} tables matching '{keyword}':\n", matches.len());
                    for found in matches {
                        println!("  [{}] {}", found.database, describe(&found.table));
                    }
                })
            }
        }
    }

    fn print_names(&self, label: &str, names: &[String]) -> Result<(), CliError> {
        self.print(names, |names| {
            println!("Found {} {label}:\n", names.len());
            for name in names {
                println!("  {name}");
            }
        })
    }

    fn print<T: Serialize + ?Sized>(
        &self,
        value: &T,
        human: impl FnOnce(&T),
    ) -> Result<(), CliError> {
        match self.format {
            OutputFormat::Json => {
                let text = serde_json::to_string_pretty(value)
                    .map_err(|e| CliError::InvalidArgument(format!("Failed to serialize: {e}")))?;
                println!("{text}");
            }
            OutputFormat::Human => human(value),
        }
        Ok(())
    }
}

fn describe(table: &TableInfo) -> String {
    match &table.description {
        Some(description) => format!("{} - {description}", table.name),
        None => table.name.clone(),
    }
}
