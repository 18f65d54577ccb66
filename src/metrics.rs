//! Observability metrics for bulk downloads
//!
//! Counters and histograms covering queries against the remote service,
//! deferrals, retries and per-table outcomes.
//!
//! ## Architecture
//!
//! - Uses `metrics` crate for low-overhead metric collection
//! - Optional Prometheus exporter for a scraping endpoint (`--metrics-addr`)
//! - Without an installed recorder every call is a no-op

use crate::Outcome;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use metrics_exporter_prometheus::PrometheusBuilder;
use once_cell::sync::OnceCell;
use std::net::SocketAddr;
use std::time::{Duration, Instant};
use tracing::{debug, info, warn};

/// Set once the exporter is installed
static METRICS_INITIALIZED: OnceCell<SocketAddr> = OnceCell::new();

/// Metrics initialization errors
#[derive(Debug, thiserror::Error)]
pub enum MetricsError {
    /// Exporter could not be installed
    #[error("failed to install Prometheus exporter: {0}")]
    Install(String),
}

/// Initialize the Prometheus exporter
///
/// Must be called from within a tokio runtime. Idempotent: later calls return
/// without reinstalling.
pub fn init_metrics(addr: SocketAddr) -> Result<(), MetricsError> {
    if let Some(existing) = METRICS_INITIALIZED.get() {
        debug!(addr = %existing, "Metrics already initialized, skipping");
        return Ok(());
    }

    info!(addr = %addr, "Initializing metrics exporter");

    PrometheusBuilder::new()
        .with_http_listener(addr)
        .install()
        .map_err(|e| MetricsError::Install(e.to_string()))?;

    describe_counter!(
        "queries_total",
        Unit::Count,
        "Queries issued to the remote service"
    );
    describe_counter!(
        "query_errors_total",
        Unit::Count,
        "Queries that returned an error, by kind"
    );
    describe_counter!(
        "pages_deferred_total",
        Unit::Count,
        "Pages deferred because their signature was inside the cooldown window"
    );
    describe_counter!(
        "query_retries_total",
        Unit::Count,
        "Backoff retries of transient query failures"
    );
    describe_counter!(
        "tables_completed_total",
        Unit::Count,
        "Tables reaching a terminal outcome"
    );
    describe_counter!(
        "rows_downloaded_total",
        Unit::Count,
        "Rows retrieved from the remote service"
    );
    describe_histogram!(
        "query_duration_seconds",
        Unit::Seconds,
        "Duration of a single query"
    );

    let _ = METRICS_INITIALIZED.set(addr);
    info!(addr = %addr, "Metrics exporter listening");
    Ok(())
}

/// Whether the exporter is installed
pub fn is_initialized() -> bool {
    METRICS_INITIALIZED.get().is_some()
}

/// Timing of one query
pub struct QueryMetrics {
    table: String,
    start_time: Instant,
}

impl QueryMetrics {
    /// Start timing a query against `table`
    pub fn start(table: &str) -> Self {
        Self {
            table: table.to_string(),
            start_time: Instant::now(),
        }
    }

    /// Record a query that returned `rows` rows
    pub fn record_success(&self, rows: u64) {
        let duration = self.start_time.elapsed();
        counter!("queries_total", "table" => self.table.clone(), "status" => "ok").increment(1);
        counter!("rows_downloaded_total", "table" => self.table.clone()).increment(rows);
        histogram!("query_duration_seconds", "table" => self.table.clone())
            .record(duration.as_secs_f64());
    }

    /// Record a query that failed with an error of `kind`
    pub fn record_error(&self, kind: &'static str) {
        let duration = self.start_time.elapsed();
        counter!("queries_total", "table" => self.table.clone(), "status" => "error").increment(1);
        counter!("query_errors_total", "table" => self.table.clone(), "kind" => kind).increment(1);
        histogram!("query_duration_seconds", "table" => self.table.clone())
            .record(duration.as_secs_f64());
    }
}

/// Record a page deferred by the governor
pub fn record_deferred(table: &str) {
    counter!("pages_deferred_total", "table" => table.to_string()).increment(1);
}

/// Record a backoff retry
pub fn record_retry(table: &str, attempt: u32, backoff: Duration) {
    counter!(
        "query_retries_total",
        "table" => table.to_string(),
        "attempt" => attempt.to_string(),
    )
    .increment(1);

    debug!(
        table = %table,
        attempt = attempt,
        backoff_ms = backoff.as_millis() as u64,
        "Retry backoff recorded"
    );
}

/// Record a table reaching its terminal outcome
pub fn record_table_outcome(table: &str, outcome: Outcome) {
    counter!("tables_completed_total", "outcome" => outcome.to_string()).increment(1);
    if outcome != Outcome::Success {
        warn!(table = %table, outcome = %outcome, "Table completed without full success");
    }
}
