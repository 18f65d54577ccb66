//! Run configuration and query policy
//!
//! Every limit the remote service imposes is a policy parameter here, with the
//! observed values as defaults.

use crate::Category;
use chrono::NaiveDate;
use serde::{Deserialize, Serialize};
use std::path::PathBuf;
use std::time::Duration;

/// Maximum rows the service returns for a single query.
/// 200,000 is the observed per-query record cap.
pub const DEFAULT_PAGE_CAP: u64 = 200_000;

/// Window during which an identical query signature must not be resubmitted.
pub const DEFAULT_COOLDOWN: Duration = Duration::from_secs(30 * 60);

/// Minimum spacing between two consecutive queries of any signature.
pub const DEFAULT_MIN_SPACING: Duration = Duration::from_secs(3);

/// Attempts per page for transient failures (first try included).
pub const DEFAULT_MAX_ATTEMPTS: u32 = 3;

/// Initial backoff delay in milliseconds.
pub const INITIAL_BACKOFF_MS: u64 = 1000; // 1 second

/// Maximum backoff delay in milliseconds.
pub const MAX_BACKOFF_MS: u64 = 30000; // 30 seconds

/// Upper bound on pages fetched for one table in one run.
/// 10,000 pages at the default cap is two billion rows, far beyond any catalog table.
pub const MAX_PAGES_PER_TABLE: u64 = 10_000;

/// Default first date of the query range
pub const DEFAULT_START_DATE: &str = "2010-01-01";

/// Default last date of the query range
pub const DEFAULT_END_DATE: &str = "2024-12-31";

/// Stock code prefixes of A-share listed firms (Shenzhen main board, ChiNext, Shanghai)
pub const DEFAULT_ENTITY_PREFIXES: [&str; 3] = ["0", "3", "6"];

/// Date format used for query ranges
pub const DATE_FORMAT: &str = "%Y-%m-%d";

/// Rate and pagination policy for queries against the remote service
#[derive(Debug, Clone, PartialEq)]
pub struct QueryPolicy {
    /// Rows requested per page
    pub page_cap: u64,
    /// Identical-signature cooldown window
    pub cooldown: Duration,
    /// Spacing enforced between consecutive queries
    pub min_spacing: Duration,
    /// Attempts per page for retryable errors
    pub max_attempts: u32,
    /// First backoff delay
    pub initial_backoff: Duration,
    /// Backoff ceiling
    pub max_backoff: Duration,
    /// Iteration guard for pagination
    pub max_pages: u64,
}

impl Default for QueryPolicy {
    fn default() -> Self {
        Self {
            page_cap: DEFAULT_PAGE_CAP,
            cooldown: DEFAULT_COOLDOWN,
            min_spacing: DEFAULT_MIN_SPACING,
            max_attempts: DEFAULT_MAX_ATTEMPTS,
            initial_backoff: Duration::from_millis(INITIAL_BACKOFF_MS),
            max_backoff: Duration::from_millis(MAX_BACKOFF_MS),
            max_pages: MAX_PAGES_PER_TABLE,
        }
    }
}

impl QueryPolicy {
    /// Exponential backoff delay before retry number `retry_count` (0-based)
    pub fn backoff(&self, retry_count: u32) -> Duration {
        let initial = self.initial_backoff.as_millis() as u64;
        let delay_ms = initial.saturating_mul(2u64.saturating_pow(retry_count));
        Duration::from_millis(delay_ms).min(self.max_backoff)
    }

    /// Validate policy parameters
    pub fn validate(&self) -> Result<(), String> {
        if self.page_cap == 0 {
            return Err("page cap must be greater than zero".to_string());
        }
        if self.max_attempts == 0 {
            return Err("max attempts must be at least 1".to_string());
        }
        if self.max_pages == 0 {
            return Err("max pages must be greater than zero".to_string());
        }
        if self.initial_backoff > self.max_backoff {
            return Err(format!(
                "initial backoff {:?} exceeds max backoff {:?}",
                self.initial_backoff, self.max_backoff
            ));
        }
        Ok(())
    }
}

/// Which entities (listed firms) a query selects
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "mode", content = "values", rename_all = "snake_case")]
pub enum EntityFilter {
    /// No entity restriction
    All,
    /// Codes starting with any of the prefixes
    Prefixes(Vec<String>),
    /// Explicit code list
    Codes(Vec<String>),
}

impl Default for EntityFilter {
    fn default() -> Self {
        EntityFilter::Prefixes(DEFAULT_ENTITY_PREFIXES.iter().map(|p| p.to_string()).collect())
    }
}

impl EntityFilter {
    /// Render the filter as a predicate on `field` in the service's filter language
    ///
    /// # Examples
    /// ```
    /// use csmar_bulk_downloader::config::EntityFilter;
    ///
    /// let filter = EntityFilter::Prefixes(vec!["0".into(), "6".into()]);
    /// assert_eq!(filter.condition("Stkcd"), "(Stkcd like '0%' or Stkcd like '6%')");
    /// ```
    pub fn condition(&self, field: &str) -> String {
        match self {
            EntityFilter::All => "1=1".to_string(),
            EntityFilter::Prefixes(prefixes) => {
                let clauses: Vec<String> = prefixes
                    .iter()
                    .map(|p| format!("{field} like '{p}%'"))
                    .collect();
                format!("({})", clauses.join(" or "))
            }
            EntityFilter::Codes(codes) => {
                let quoted: Vec<String> = codes.iter().map(|c| format!("'{c}'")).collect();
                format!("{field} in ({})", quoted.join(","))
            }
        }
    }

    /// Validate that lists are non-empty and values are plain alphanumerics
    pub fn validate(&self) -> Result<(), String> {
        let values = match self {
            EntityFilter::All => return Ok(()),
            EntityFilter::Prefixes(v) | EntityFilter::Codes(v) => v,
        };
        if values.is_empty() {
            return Err("entity filter list must not be empty".to_string());
        }
        for value in values {
            if value.is_empty() || !value.chars().all(|c| c.is_ascii_alphanumeric()) {
                return Err(format!("Invalid entity code or prefix: '{value}'"));
            }
        }
        Ok(())
    }
}

impl std::fmt::Display for EntityFilter {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            EntityFilter::All => write!(f, "all"),
            EntityFilter::Prefixes(p) => write!(f, "prefixes [{}]", p.join(", ")),
            EntityFilter::Codes(c) => write!(f, "{} codes", c.len()),
        }
    }
}

/// Inclusive date range of a run
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct DateRange {
    /// First date
    pub start: NaiveDate,
    /// Last date
    pub end: NaiveDate,
}

impl DateRange {
    /// Create a range, rejecting `start > end`
    pub fn new(start: NaiveDate, end: NaiveDate) -> Result<Self, String> {
        if start > end {
            return Err(format!("start date {start} is after end date {end}"));
        }
        Ok(Self { start, end })
    }

    /// Parse a range from `YYYY-MM-DD` strings
    pub fn parse(start: &str, end: &str) -> Result<Self, String> {
        let start = NaiveDate::parse_from_str(start, DATE_FORMAT)
            .map_err(|e| format!("Invalid start date '{start}': {e}"))?;
        let end = NaiveDate::parse_from_str(end, DATE_FORMAT)
            .map_err(|e| format!("Invalid end date '{end}': {e}"))?;
        Self::new(start, end)
    }

    /// Start date formatted for the service
    pub fn start_str(&self) -> String {
        self.start.format(DATE_FORMAT).to_string()
    }

    /// End date formatted for the service
    pub fn end_str(&self) -> String {
        self.end.format(DATE_FORMAT).to_string()
    }
}

impl Default for DateRange {
    fn default() -> Self {
        // Both constants are valid dates
        Self::parse(DEFAULT_START_DATE, DEFAULT_END_DATE).unwrap_or(Self {
            start: NaiveDate::MIN,
            end: NaiveDate::MAX,
        })
    }
}

/// Category include/exclude lists
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CategorySelection {
    /// Only these categories (empty means all)
    pub include: Vec<Category>,
    /// Never these categories
    pub exclude: Vec<Category>,
}

impl CategorySelection {
    /// Whether tables of `category` are part of the run
    pub fn allows(&self, category: Category) -> bool {
        (self.include.is_empty() || self.include.contains(&category))
            && !self.exclude.contains(&category)
    }
}

/// Merge stage configuration
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MergeConfig {
    /// Output file stem (`<name>_<run_id>.csv`)
    pub name: String,
    /// Short names of tables to merge, in priority order.
    /// Empty selects every classification table in the run.
    pub tables: Vec<String>,
}

/// Configuration of one download run
#[derive(Debug, Clone)]
pub struct RunConfig {
    /// Root output directory
    pub output_root: PathBuf,
    /// Date range for time-varying tables
    pub date_range: DateRange,
    /// Entity selection
    pub entity_filter: EntityFilter,
    /// Category include/exclude
    pub categories: CategorySelection,
    /// Optional merge stage
    pub merge: Option<MergeConfig>,
    /// Prior run whose successful tables are skipped
    pub resume_run_id: Option<String>,
    /// Query policy
    pub policy: QueryPolicy,
    /// Issue a row count before paging
    pub count_first: bool,
    /// Check catalog columns against the remote table before fetching
    pub validate_columns: bool,
    /// Directory holding the per-account session lock
    pub lock_dir: PathBuf,
}

impl RunConfig {
    /// Create a configuration with default policy and filters
    pub fn new(output_root: impl Into<PathBuf>, date_range: DateRange) -> Self {
        Self {
            output_root: output_root.into(),
            date_range,
            entity_filter: EntityFilter::default(),
            categories: CategorySelection::default(),
            merge: None,
            resume_run_id: None,
            policy: QueryPolicy::default(),
            count_first: true,
            validate_columns: true,
            lock_dir: default_lock_dir(),
        }
    }

    /// Set the entity filter
    pub fn with_entity_filter(mut self, filter: EntityFilter) -> Self {
        self.entity_filter = filter;
        self
    }

    /// Set the category selection
    pub fn with_categories(mut self, categories: CategorySelection) -> Self {
        self.categories = categories;
        self
    }

    /// Enable the merge stage
    pub fn with_merge(mut self, merge: MergeConfig) -> Self {
        self.merge = Some(merge);
        self
    }

    /// Resume from a prior run
    pub fn with_resume(mut self, run_id: impl Into<String>) -> Self {
        self.resume_run_id = Some(run_id.into());
        self
    }

    /// Set the query policy
    pub fn with_policy(mut self, policy: QueryPolicy) -> Self {
        self.policy = policy;
        self
    }

    /// Toggle the pre-count query
    pub fn with_count_first(mut self, enabled: bool) -> Self {
        self.count_first = enabled;
        self
    }

    /// Toggle column validation
    pub fn with_column_validation(mut self, enabled: bool) -> Self {
        self.validate_columns = enabled;
        self
    }

    /// Set the lock directory
    pub fn with_lock_dir(mut self, dir: impl Into<PathBuf>) -> Self {
        self.lock_dir = dir.into();
        self
    }

    /// Validate the configuration
    pub fn validate(&self) -> Result<(), String> {
        self.policy.validate()?;
        self.entity_filter.validate()?;
        if let Some(merge) = &self.merge {
            crate::output::path::check_file_stem(&merge.name)?;
        }
        if let Some(run_id) = &self.resume_run_id {
            crate::output::path::check_file_stem(run_id)?;
        }
        Ok(())
    }
}

/// Default lock directory under the system temp dir
pub fn default_lock_dir() -> PathBuf {
    std::env::temp_dir().join("csmar-bulk-downloader")
}
