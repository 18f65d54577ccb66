//! Run progress reporting.
//!
//! The orchestrator reports table-level events through [`ProgressObserver`];
//! the CLI renders them with an indicatif bar. Every method has a no-op
//! default so observers implement only what they show.

use crate::catalog::TableSpec;
use crate::manifest::{RunManifest, TableEntry};
use indicatif::{ProgressBar, ProgressStyle};
use std::time::Duration;

/// Receiver of table-level run events
pub trait ProgressObserver: Send + Sync {
    /// The run selected `tables` tables
    fn run_started(&self, _run_id: &str, _tables: usize) {}

    /// A table began (or resumed) fetching
    fn table_started(&self, _spec: &TableSpec) {}

    /// A table's next page is cooling down for `wait`
    fn table_deferred(&self, _spec: &TableSpec, _wait: Duration) {}

    /// A table reached its terminal outcome
    fn table_finished(&self, _entry: &TableEntry) {}

    /// The run finished and the manifest was written
    fn run_finished(&self, _manifest: &RunManifest) {}
}

/// Observer that ignores every event
#[derive(Debug, Clone, Copy, Default)]
pub struct NoProgress;

impl ProgressObserver for NoProgress {}

/// Terminal progress bar with one tick per finished table
#[derive(Debug, Clone)]
pub struct BarProgress {
    bar: ProgressBar,
}

impl BarProgress {
    /// Empty bar, sized to the table count on `run_started`
    pub fn new() -> Self {
        let bar = ProgressBar::new(0);
        let style = ProgressStyle::default_bar()
            .template(
                "{spinner:.green} [{elapsed_precise}] [{bar:40.cyan/blue}] {pos}/{len} tables ({percent}%) {msg}",
            )
            .unwrap_or_else(|_| ProgressStyle::default_bar())
            .progress_chars("#>-");
        bar.set_style(style);
        Self { bar }
    }

    /// Underlying bar, for printing without tearing it
    pub fn bar(&self) -> &ProgressBar {
        &self.bar
    }
}

impl Default for BarProgress {
    fn default() -> Self {
        Self::new()
    }
}

impl ProgressObserver for BarProgress {
    fn run_started(&self, run_id: &str, tables: usize) {
        self.bar.set_length(tables as u64);
        self.bar.set_message(format!("run {run_id}"));
        self.bar.enable_steady_tick(Duration::from_millis(200));
    }

    fn table_started(&self, spec: &TableSpec) {
        self.bar.set_message(spec.short_name.clone());
    }

    fn table_deferred(&self, spec: &TableSpec, wait: Duration) {
        self.bar.set_message(format!(
            "{} deferred for {}",
            spec.short_name,
            format_wait(wait)
        ));
    }

    fn table_finished(&self, entry: &TableEntry) {
        self.bar.inc(1);
        self.bar.println(format!(
            "{:<16} {:<34} {:>10} rows",
            entry.outcome.to_string(),
            entry.table,
            entry.row_count
        ));
    }

    fn run_finished(&self, manifest: &RunManifest) {
        self.bar.finish_with_message(format!(
            "{} rows in {} tables",
            manifest.total_rows,
            manifest.tables.len()
        ));
    }
}

/// Human-readable wait, minute resolution above a minute
pub fn format_wait(wait: Duration) -> String {
    let secs = wait.as_secs();
    if secs >= 60 {
        format!("{}m{:02}s", secs / 60, secs % 60)
    } else {
        format!("{secs}s")
    }
}
