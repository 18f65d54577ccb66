//! Validation subcommand

use super::{connect, credentials_from_env, load_catalog, Cli, CliError};
use crate::catalog::validate::{check_columns, ColumnStatus, ValidationSummary};
use crate::catalog::TableSpec;
use crate::manifest::RunManifest;
use crate::output::{read_table, OutputLayout};
use clap::Parser;

/// Validate command for checking the catalog and run manifests
#[derive(Parser, Debug)]
pub struct ValidateCommand {
    /// What to validate
    #[command(subcommand)]
    pub target: ValidateTarget,
}

/// Target type for validation
#[derive(clap::Subcommand, Debug)]
pub enum ValidateTarget {
    /// Validate the table catalog
    Catalog {
        /// Also check every table's columns against the remote field listing
        #[arg(long)]
        online: bool,
    },
    /// Check a run manifest against the files it references
    Manifest {
        /// Run identifier (YYYYMMDD_HHMMSS)
        run_id: String,
    },
}

impl ValidateCommand {
    /// Execute the validation command
    pub async fn execute(&self, cli: &Cli) -> Result<(), CliError> {
        match &self.target {
            ValidateTarget::Catalog { online } => self.validate_catalog(cli, *online).await,
            ValidateTarget::Manifest { run_id } => self.validate_manifest(cli, run_id),
        }
    }

    async fn validate_catalog(&self, cli: &Cli, online: bool) -> Result<(), CliError> {
        // Loading validates every entry
        let catalog = load_catalog(cli)?;
        println!(
            "Catalog {} is valid: {} tables in {} categories",
            catalog.schema_version(),
            catalog.len(),
            catalog.categories().len()
        );

        if !online {
            return Ok(());
        }

        let credentials = credentials_from_env()?;
        let client = connect(cli)?;
        let session = client.login(&credentials).await?;

        let specs: Vec<&TableSpec> = catalog.tables().iter().collect();
        let checks = check_columns(client.as_ref(), &session, &specs).await?;

        println!("\nColumn access:");
        for check in &checks {
            let status = match &check.status {
                ColumnStatus::Ok => "ok".to_string(),
                ColumnStatus::MissingColumns(missing) => format!("missing {}", missing.join(", ")),
                ColumnStatus::Error(message) => format!("error: {message}"),
            };
            println!("  {:<28} {:<22} {status}", check.table, check.table_name);
        }

        let summary = ValidationSummary::from_checks(&checks);
        println!("\nSummary:");
        println!("  OK: {}/{}", summary.ok, summary.total);
        if summary.missing > 0 {
            println!("  Missing columns: {}", summary.missing);
        }
        if summary.errors > 0 {
            println!("  Errors: {}", summary.errors);
        }

        if summary.all_ok() {
            Ok(())
        } else {
            Err(CliError::ValidationFailed(format!(
                "{} of {} tables are not fully accessible",
                summary.total - summary.ok,
                summary.total
            )))
        }
    }

    fn validate_manifest(&self, cli: &Cli, run_id: &str) -> Result<(), CliError> {
        crate::output::path::check_file_stem(run_id).map_err(CliError::InvalidArgument)?;

        let layout = OutputLayout::new(&cli.output_dir);
        let manifest = RunManifest::load(&layout.manifest_file(run_id))?;
        println!(
            "Manifest {} ({} tables, {} rows)",
            manifest.run_id,
            manifest.tables.len(),
            manifest.total_rows
        );

        let mut problems = 0;
        for entry in &manifest.tables {
            let Some(file) = &entry.file else {
                continue;
            };
            let path = layout.resolve(file);
            match read_table(&path) {
                Ok(table) if table.rows.len() as u64 == entry.row_count => {
                    println!("  - {} ({} rows)", entry.table, entry.row_count);
                }
                Ok(table) => {
                    println!(
                        "  - {} (row count mismatch: manifest {}, file {})",
                        entry.table,
                        entry.row_count,
                        table.rows.len()
                    );
                    problems += 1;
                }
                Err(e) => {
                    println!("  - {} (cannot read {}: {e})", entry.table, path.display());
                    problems += 1;
                }
            }
        }

        if problems > 0 {
            return Err(CliError::ValidationFailed(format!(
                "{problems} table file(s) do not match the manifest"
            )));
        }
        println!("\nAll table files match the manifest");
        Ok(())
    }
}
