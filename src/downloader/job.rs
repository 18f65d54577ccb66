//! Per-table job and its state machine

use crate::catalog::TableSpec;
use crate::client::QueryRequest;
use crate::config::RunConfig;
use crate::pagination::PaginationState;
use crate::Outcome;
use serde::{Deserialize, Serialize};

/// Lifecycle state of one table within a run
///
/// ```text
/// Pending -> Fetching -> Done
///               |  ^
///               v  |
///            Deferred -> Done
/// ```
///
/// `Pending -> Done` covers tables settled without paging (validation
/// failure, zero pre-count).
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Default)]
pub enum TableState {
    /// Not started yet
    #[default]
    Pending,
    /// Pages are being requested
    Fetching,
    /// Waiting in the deferred queue for a cooldown to expire
    Deferred,
    /// Terminal
    Done(Outcome),
}

impl TableState {
    /// Whether `next` is a legal successor
    pub fn can_transition_to(&self, next: TableState) -> bool {
        matches!(
            (self, next),
            (TableState::Pending, TableState::Fetching)
                | (TableState::Pending, TableState::Done(_))
                | (TableState::Fetching, TableState::Deferred)
                | (TableState::Fetching, TableState::Done(_))
                | (TableState::Deferred, TableState::Fetching)
                | (TableState::Deferred, TableState::Done(_))
        )
    }
}

impl std::fmt::Display for TableState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            TableState::Pending => f.write_str("pending"),
            TableState::Fetching => f.write_str("fetching"),
            TableState::Deferred => f.write_str("deferred"),
            TableState::Done(outcome) => write!(f, "done({outcome})"),
        }
    }
}

/// Illegal state change
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("table '{table}': invalid transition {from} -> {to}")]
pub struct InvalidTransition {
    /// Catalog short name
    pub table: String,
    /// Current state
    pub from: TableState,
    /// Rejected state
    pub to: TableState,
}

/// Work item for one catalog table
#[derive(Debug)]
pub struct TableJob {
    /// Catalog entry
    pub spec: TableSpec,
    /// Query issued for every page
    pub request: QueryRequest,
    /// Pre-count reported by the service, if one was issued
    pub expected_rows: Option<u64>,
    /// Whether the pre-count step has run
    pub counted: bool,
    /// Rows and pages retrieved so far
    pub progress: PaginationState,
    state: TableState,
}

impl TableJob {
    /// Create a pending job for `spec` under `config`
    pub fn new(spec: &TableSpec, config: &RunConfig) -> Self {
        Self {
            request: QueryRequest::for_table(spec, config),
            spec: spec.clone(),
            expected_rows: None,
            counted: false,
            progress: PaginationState::new(),
            state: TableState::Pending,
        }
    }

    /// Current state
    pub fn state(&self) -> TableState {
        self.state
    }

    /// Move to `next`, rejecting illegal transitions
    pub fn transition(&mut self, next: TableState) -> Result<(), InvalidTransition> {
        if !self.state.can_transition_to(next) {
            return Err(InvalidTransition {
                table: self.spec.short_name.clone(),
                from: self.state,
                to: next,
            });
        }
        self.state = next;
        Ok(())
    }

    /// Pagination bound: the catalog's known row count, else the pre-count
    pub fn bound(&self) -> Option<u64> {
        self.spec.expected_rows.or(self.expected_rows)
    }
}
