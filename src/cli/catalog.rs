//! CLI command for inspecting the table catalog

use super::{load_catalog, Cli, CliError, OutputFormat};
use crate::catalog::{TableCatalog, TableSpec};
use crate::Category;
use clap::Args;

/// Catalog subcommand
#[derive(Debug, Args)]
pub struct CatalogCommand {
    #[command(subcommand)]
    action: CatalogAction,
}

/// Catalog actions
#[derive(Debug, clap::Subcommand)]
enum CatalogAction {
    /// List catalog tables
    List {
        /// Only list tables of this category
        #[arg(long)]
        category: Option<Category>,

        /// Output format
        #[arg(long, default_value = "human")]
        format: OutputFormat,
    },
}

impl CatalogCommand {
    /// Execute the catalog command
    pub fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        match &self.action {
            CatalogAction::List { category, format } => {
                let catalog = load_catalog(cli)?;
                let tables: Vec<&TableSpec> = catalog
                    .tables()
                    .iter()
                    .filter(|t| category.map_or(true, |c| t.category == c))
                    .collect();
                match format {
                    OutputFormat::Json => print_json(&catalog, &tables),
                    OutputFormat::Human => {
                        print_human(&catalog, &tables);
                        Ok(())
                    }
                }
            }
        }
    }
}

fn print_json(catalog: &TableCatalog, tables: &[&TableSpec]) -> Result<(), CliError> {
    let output = serde_json::json!({
        "schema_version": catalog.schema_version(),
        "last_updated": catalog.last_updated(),
        "tables": tables,
    });
    let text = serde_json::to_string_pretty(&output)
        .map_err(|e| CliError::InvalidArgument(format!("Failed to serialize catalog: {e}")))?;
    println!("{text}");
    Ok(())
}

fn print_human(catalog: &TableCatalog, tables: &[&TableSpec]) {
    println!(
        "Catalog {} (updated {}): {} tables\n",
        catalog.schema_version(),
        catalog.last_updated(),
        tables.len()
    );

    let mut current: Option<Category> = None;
    for table in tables {
        if current != Some(table.category) {
            println!("{}:", table.category.as_str().to_uppercase());
            current = Some(table.category);
        }
        println!(
            "  {:<28} {:<22} {:>3} cols  {}{}",
            table.short_name,
            table.table_name,
            table.columns.len(),
            if table.time_varying { "dated " } else { "" },
            table.display_name
        );
    }
}
