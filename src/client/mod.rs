//! Query client adapter over the remote query service
//!
//! The service exposes login, catalog discovery (databases, tables, fields), a
//! row count and a single bounded query primitive. Everything above this module
//! talks to the service only through [`QueryClient`].

use crate::catalog::TableSpec;
use crate::config::{DateRange, RunConfig};
use crate::governor::QuerySignature;
use crate::{ErrorKind, Record};
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

pub mod http;

pub use http::HttpQueryClient;

/// Message fragments that mark a remote failure as transient
const TRANSIENT_MARKERS: [&str; 3] = ["timeout", "temporarily", "connection reset"];

/// Query client errors
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum QueryError {
    /// Session missing, expired or rejected
    #[error("authentication failed: {0}")]
    Authentication(String),

    /// Identical query resubmitted inside the cooldown window
    #[error("rate limited: identical query inside cooldown window")]
    RateLimited,

    /// Any other service-side failure
    #[error("remote query failed: {message}")]
    RemoteQuery {
        /// Service or transport message
        message: String,
        /// Whether a retry of the same query may succeed
        retryable: bool,
    },
}

impl QueryError {
    /// Remote failure, retryable when the message names a transient condition
    pub fn remote(message: impl Into<String>) -> Self {
        let message = message.into();
        let lowered = message.to_lowercase();
        let retryable = TRANSIENT_MARKERS.iter().any(|m| lowered.contains(m));
        QueryError::RemoteQuery { message, retryable }
    }

    /// Remote failure that is always retryable (timeouts, 5xx)
    pub fn transient(message: impl Into<String>) -> Self {
        QueryError::RemoteQuery {
            message: message.into(),
            retryable: true,
        }
    }

    /// Whether backoff and retry may succeed
    pub fn is_retryable(&self) -> bool {
        matches!(self, QueryError::RemoteQuery { retryable: true, .. })
    }

    /// Manifest classification of the error
    pub fn kind(&self) -> ErrorKind {
        match self {
            QueryError::Authentication(_) => ErrorKind::Authentication,
            QueryError::RateLimited => ErrorKind::RateLimit,
            QueryError::RemoteQuery { .. } => ErrorKind::RemoteQuery,
        }
    }
}

/// Result type for query client operations
pub type QueryResult<T> = Result<T, QueryError>;

/// Account credentials
#[derive(Clone)]
pub struct Credentials {
    /// Account name or email
    pub username: String,
    /// Account password
    pub password: String,
    /// Service language code ("0" Chinese, "1" English)
    pub language: String,
}

impl Credentials {
    /// Create credentials
    pub fn new(
        username: impl Into<String>,
        password: impl Into<String>,
        language: impl Into<String>,
    ) -> Self {
        Self {
            username: username.into(),
            password: password.into(),
            language: language.into(),
        }
    }
}

impl std::fmt::Debug for Credentials {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Credentials")
            .field("username", &self.username)
            .field("password", &"<redacted>")
            .field("language", &self.language)
            .finish()
    }
}

/// Authenticated session handle, held by the orchestrator for a whole run
#[derive(Clone)]
pub struct Session {
    account: String,
    token: String,
    established_at: DateTime<Utc>,
}

impl Session {
    /// Wrap a token issued for `account`
    pub fn new(account: impl Into<String>, token: impl Into<String>) -> Self {
        Self {
            account: account.into(),
            token: token.into(),
            established_at: Utc::now(),
        }
    }

    /// Account the session belongs to
    pub fn account(&self) -> &str {
        &self.account
    }

    /// Bearer token
    pub fn token(&self) -> &str {
        &self.token
    }

    /// Login time
    pub fn established_at(&self) -> DateTime<Utc> {
        self.established_at
    }
}

impl std::fmt::Debug for Session {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Session")
            .field("account", &self.account)
            .field("established_at", &self.established_at)
            .finish_non_exhaustive()
    }
}

/// One bounded slice of a table: `[offset, offset + limit)`
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct QueryWindow {
    offset: u64,
    limit: u64,
}

impl QueryWindow {
    /// Create a window, rejecting `limit == 0` and `limit > page_cap`
    pub fn new(offset: u64, limit: u64, page_cap: u64) -> Result<Self, String> {
        if limit == 0 {
            return Err("query window limit must be greater than zero".to_string());
        }
        if limit > page_cap {
            return Err(format!(
                "query window limit {limit} exceeds page cap {page_cap}"
            ));
        }
        if offset.checked_add(limit).is_none() {
            return Err(format!("query window at offset {offset} overflows"));
        }
        Ok(Self { offset, limit })
    }

    /// First row of the window
    pub fn offset(&self) -> u64 {
        self.offset
    }

    /// Rows requested
    pub fn limit(&self) -> u64 {
        self.limit
    }
}

/// Everything but the window of a query against one table
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct QueryRequest {
    /// Remote table name
    pub table: String,
    /// Requested columns, in output order
    pub columns: Vec<String>,
    /// Predicate in the service's filter language
    pub condition: String,
    /// Date range, for time-varying tables only
    pub date_range: Option<DateRange>,
}

impl QueryRequest {
    /// Build the request for a catalog table under a run configuration
    pub fn for_table(spec: &TableSpec, config: &RunConfig) -> Self {
        Self {
            table: spec.table_name.clone(),
            columns: spec.columns.clone(),
            condition: spec.condition(&config.entity_filter, &config.date_range),
            date_range: spec.time_varying.then_some(config.date_range),
        }
    }

    /// Rate-budget identity of this request over `window`
    pub fn signature(&self, window: QueryWindow) -> QuerySignature {
        QuerySignature::new(&self.table, &self.condition, window.offset(), window.limit())
    }
}

/// Table listed by the service's catalog discovery
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableInfo {
    /// Remote table name
    pub name: String,
    /// Service description, when provided
    #[serde(default)]
    pub description: Option<String>,
}

impl TableInfo {
    /// Case-insensitive keyword match against name and description
    pub fn matches(&self, keyword: &str) -> bool {
        let keyword = keyword.to_lowercase();
        self.name.to_lowercase().contains(&keyword)
            || self
                .description
                .as_deref()
                .is_some_and(|d| d.to_lowercase().contains(&keyword))
    }
}

/// Table found by [`search_tables`]
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct TableMatch {
    /// Database holding the table
    pub database: String,
    /// Matching table
    #[serde(flatten)]
    pub table: TableInfo,
}

/// Search every visible database for tables whose name or description contains `keyword`
///
/// Databases whose table listing fails are skipped. Authentication errors abort the search.
pub async fn search_tables(
    client: &dyn QueryClient,
    session: &Session,
    keyword: &str,
) -> QueryResult<Vec<TableMatch>> {
    let databases = client.list_databases(session).await?;
    let mut matches = Vec::new();

    for database in databases {
        let tables = match client.list_tables(session, &database).await {
            Ok(tables) => tables,
            Err(err @ QueryError::Authentication(_)) => return Err(err),
            Err(err) => {
                warn!(database = %database, error = %err, "Skipping database");
                continue;
            }
        };
        matches.extend(
            tables
                .into_iter()
                .filter(|table| table.matches(keyword))
                .map(|table| TableMatch {
                    database: database.clone(),
                    table,
                }),
        );
    }

    debug!(keyword, found = matches.len(), "Table search finished");
    Ok(matches)
}

/// Adapter over the remote query service
///
/// Implementations must not retry on their own; retries and pacing belong to
/// the rate governor so that every attempt is accounted for.
#[async_trait]
pub trait QueryClient: Send + Sync {
    /// Authenticate and return a session handle
    async fn login(&self, credentials: &Credentials) -> QueryResult<Session>;

    /// List databases visible to the account
    async fn list_databases(&self, session: &Session) -> QueryResult<Vec<String>>;

    /// List tables of a database
    async fn list_tables(&self, session: &Session, database: &str)
        -> QueryResult<Vec<TableInfo>>;

    /// List field (column) names of a table
    async fn list_fields(&self, session: &Session, table: &str) -> QueryResult<Vec<String>>;

    /// Count rows matching the request
    async fn query_count(&self, session: &Session, request: &QueryRequest) -> QueryResult<u64>;

    /// Fetch one page of rows, in service order
    async fn fetch(
        &self,
        session: &Session,
        request: &QueryRequest,
        window: QueryWindow,
    ) -> QueryResult<Vec<Record>>;
}
