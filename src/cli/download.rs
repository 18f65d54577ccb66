//! Download command implementation

use crate::cancel::CancelToken;
use crate::config::{
    CategorySelection, DateRange, EntityFilter, MergeConfig, QueryPolicy, RunConfig,
    DEFAULT_END_DATE, DEFAULT_START_DATE,
};
use crate::downloader::{BarProgress, DownloadOrchestrator, RunReport};
use crate::{Category, Outcome};
use clap::{Parser, Subcommand};
use std::net::SocketAddr;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tracing::{error, info};

use super::{connect, credentials_from_env, load_catalog, CliError, OutputFormat};

/// Default query gateway address
pub const DEFAULT_GATEWAY_URL: &str = "http://127.0.0.1:8765";

/// CSMAR bulk downloader CLI
#[derive(Parser, Debug)]
#[command(name = "csmar-dl")]
#[command(
    about = "Download CSMAR tables into categorized CSV files with a run manifest",
    long_about = None
)]
#[command(version)]
pub struct Cli {
    /// Command to execute
    #[command(subcommand)]
    pub command: Commands,

    /// Base URL of the CSMAR query gateway
    #[arg(long, global = true, env = "CSMAR_GATEWAY_URL", default_value = DEFAULT_GATEWAY_URL)]
    pub gateway_url: String,

    /// Root output directory
    #[arg(long, global = true, default_value = "output")]
    pub output_dir: PathBuf,

    /// Table catalog JSON file (default: embedded catalog)
    #[arg(long, global = true)]
    pub catalog: Option<PathBuf>,

    /// Directory holding the per-account run lock
    #[arg(long, global = true)]
    pub lock_dir: Option<PathBuf>,

    /// Serve Prometheus metrics on this address (e.g. 127.0.0.1:9100)
    #[arg(long, global = true)]
    pub metrics_addr: Option<SocketAddr>,
}

/// CLI commands
#[derive(Subcommand, Debug)]
pub enum Commands {
    /// Download every selected catalog table
    Download(DownloadArgs),

    /// Validate the catalog, optionally against the remote field listings
    Validate(super::ValidateCommand),

    /// Inspect the table catalog
    Catalog(super::CatalogCommand),

    /// Browse databases, tables and fields on the remote service
    Explore(super::ExploreCommand),
}

/// Download command arguments
#[derive(Parser, Debug)]
pub struct DownloadArgs {
    /// First date for time-varying tables (YYYY-MM-DD)
    #[arg(long, env = "CSMAR_START_DATE", default_value = DEFAULT_START_DATE)]
    pub start_date: String,

    /// Last date for time-varying tables (YYYY-MM-DD)
    #[arg(long, env = "CSMAR_END_DATE", default_value = DEFAULT_END_DATE)]
    pub end_date: String,

    /// Entity code prefix to include (repeatable; default 0, 3 and 6)
    #[arg(long = "entity-prefix", conflicts_with = "entity_codes")]
    pub entity_prefixes: Vec<String>,

    /// Explicit entity code to include (repeatable)
    #[arg(long = "entity-code")]
    pub entity_codes: Vec<String>,

    /// Download all entities, with no entity predicate
    #[arg(long, conflicts_with_all = ["entity_prefixes", "entity_codes"])]
    pub all_entities: bool,

    /// Only download these categories (repeatable)
    #[arg(long = "include-category")]
    pub include_categories: Vec<Category>,

    /// Skip these categories (repeatable)
    #[arg(long = "exclude-category")]
    pub exclude_categories: Vec<Category>,

    /// Merge downloaded tables into `<name>_<run_id>.csv`
    #[arg(long)]
    pub merge_name: Option<String>,

    /// Table to merge (repeatable; default every classification table)
    #[arg(long = "merge-table", requires = "merge_name")]
    pub merge_tables: Vec<String>,

    /// Skip tables that succeeded in this prior run
    #[arg(long)]
    pub resume: Option<String>,

    /// Maximum rows per query
    #[arg(long, default_value_t = crate::config::DEFAULT_PAGE_CAP)]
    pub page_cap: u64,

    /// Seconds before an identical query may be reissued
    #[arg(long, default_value_t = crate::config::DEFAULT_COOLDOWN.as_secs())]
    pub cooldown_secs: u64,

    /// Minimum seconds between any two queries
    #[arg(long, default_value_t = crate::config::DEFAULT_MIN_SPACING.as_secs())]
    pub min_spacing_secs: u64,

    /// Attempts per page for transient failures (range: 1-10)
    #[arg(
        long,
        default_value_t = crate::config::DEFAULT_MAX_ATTEMPTS,
        value_parser = clap::value_parser!(u32).range(1..=10)
    )]
    pub max_attempts: u32,

    /// Skip the row count issued before paging
    #[arg(long)]
    pub no_count: bool,

    /// Skip the column check against remote field listings
    #[arg(long)]
    pub no_validate: bool,

    /// Summary format
    #[arg(long, default_value = "human")]
    pub format: OutputFormat,
}

impl DownloadArgs {
    /// Build the run configuration
    pub fn run_config(&self, cli: &Cli) -> Result<RunConfig, CliError> {
        let date_range = DateRange::parse(&self.start_date, &self.end_date)
            .map_err(CliError::InvalidArgument)?;

        let entity_filter = if self.all_entities {
            EntityFilter::All
        } else if !self.entity_codes.is_empty() {
            EntityFilter::Codes(self.entity_codes.clone())
        } else if !self.entity_prefixes.is_empty() {
            EntityFilter::Prefixes(self.entity_prefixes.clone())
        } else {
            EntityFilter::default()
        };

        let policy = QueryPolicy {
            page_cap: self.page_cap,
            cooldown: Duration::from_secs(self.cooldown_secs),
            min_spacing: Duration::from_secs(self.min_spacing_secs),
            max_attempts: self.max_attempts,
            ..QueryPolicy::default()
        };

        let mut config = RunConfig::new(cli.output_dir.clone(), date_range)
            .with_entity_filter(entity_filter)
            .with_categories(CategorySelection {
                include: self.include_categories.clone(),
                exclude: self.exclude_categories.clone(),
            })
            .with_policy(policy)
            .with_count_first(!self.no_count)
            .with_column_validation(!self.no_validate);

        if let Some(name) = &self.merge_name {
            config = config.with_merge(MergeConfig {
                name: name.clone(),
                tables: self.merge_tables.clone(),
            });
        }
        if let Some(run_id) = &self.resume {
            config = config.with_resume(run_id.clone());
        }
        if let Some(dir) = &cli.lock_dir {
            config = config.with_lock_dir(dir.clone());
        }

        config.validate().map_err(CliError::ConfigurationError)?;
        Ok(config)
    }

    /// Execute the download
    pub async fn execute(&self, cli: &Cli, cancel: CancelToken) -> Result<(), CliError> {
        let config = self.run_config(cli)?;
        let catalog = load_catalog(cli)?;
        if let Some(merge) = &config.merge {
            if let Some(unknown) = merge.tables.iter().find(|t| catalog.get(t).is_none()) {
                return Err(CliError::InvalidArgument(format!(
                    "Unknown merge table: {unknown}"
                )));
            }
        }

        let credentials = credentials_from_env()?;
        let client = connect(cli)?;

        info!(
            tables = catalog.select(&config.categories).len(),
            output = %config.output_root.display(),
            "Starting download"
        );

        let progress = Arc::new(BarProgress::new());
        let orchestrator = DownloadOrchestrator::new(client, catalog, config)
            .with_cancel(cancel)
            .with_progress(progress.clone());

        let result = orchestrator.run(&credentials).await;
        progress.bar().finish_and_clear();

        match result {
            Ok(report) => {
                match self.format {
                    OutputFormat::Json => output_json(&report)?,
                    OutputFormat::Human => output_human(&report),
                }
                Ok(())
            }
            Err(e) => {
                eprintln!("\nDownload failed!");
                eprintln!("Error: {e}");
                error!("Download failed: {}", e);
                Err(CliError::DownloadError(e))
            }
        }
    }
}

/// Print the run summary as JSON
fn output_json(report: &RunReport) -> Result<(), CliError> {
    let manifest = &report.manifest;
    let output = serde_json::json!({
        "run_id": report.run_id,
        "manifest": report.manifest_path.display().to_string(),
        "complete": report.is_complete(),
        "cancelled": manifest.cancelled,
        "tables": manifest.tables.len(),
        "success": manifest.count(Outcome::Success),
        "partial_success": manifest.count(Outcome::PartialSuccess),
        "failure": manifest.count(Outcome::Failure),
        "not_attempted": manifest.not_attempted,
        "total_rows": manifest.total_rows,
        "total_bytes": manifest.total_bytes,
        "merge": manifest.merge,
    });
    let text = serde_json::to_string(&output)
        .map_err(|e| CliError::InvalidArgument(format!("Failed to render summary: {e}")))?;
    println!("{text}");
    Ok(())
}

/// Print the run summary for humans
fn output_human(report: &RunReport) {
    let manifest = &report.manifest;
    println!("\nRun {} finished", report.run_id);
    println!("Manifest: {}", report.manifest_path.display());
    println!(
        "Tables: {} success, {} partial, {} failed",
        manifest.count(Outcome::Success),
        manifest.count(Outcome::PartialSuccess),
        manifest.count(Outcome::Failure)
    );
    println!("Rows: {}", manifest.total_rows);

    for entry in manifest.tables.iter().filter(|e| e.outcome != Outcome::Success) {
        println!(
            "  {} ({}): {}",
            entry.table,
            entry.outcome,
            entry.reason.as_deref().unwrap_or("no reason recorded")
        );
    }
    if !manifest.not_attempted.is_empty() {
        println!("Not attempted: {}", manifest.not_attempted.join(", "));
    }
    if manifest.cancelled {
        println!("Run was cancelled; resume with --resume {}", report.run_id);
    }

    if let Some(merge) = &manifest.merge {
        match &merge.file {
            Some(file) => println!(
                "Merged: {file} ({} rows, {} columns, base {})",
                merge.row_count,
                merge.column_count,
                merge.base_table.as_deref().unwrap_or("-")
            ),
            None => println!(
                "Merge '{}' produced no file: {}",
                merge.name,
                merge.error.as_deref().unwrap_or("unknown error")
            ),
        }
        for excluded in &merge.excluded {
            println!("  excluded {}: {}", excluded.table, excluded.reason);
        }
    }
}
