//! Offset/limit pagination engine
//!
//! Fetches one table in contiguous, non-overlapping windows starting at offset 0.
//! Each page requests `min(page_cap, remaining bound)` rows; pagination stops on a
//! short page (end of data) or when the known row bound is reached. Rows are kept
//! in service order; nothing is sorted locally.
//!
//! Includes safety mechanisms:
//! - Maximum page count per table to prevent infinite loops
//! - Oversized pages are truncated to the requested limit
//! - Pages blocked by cooldown stop pagination with a resumable [`StopReason::Deferred`]

use crate::client::{QueryClient, QueryError, QueryRequest, QueryWindow, Session};
use crate::governor::{Admission, QuerySignature, RateGovernor};
use crate::metrics::{self, QueryMetrics};
use crate::Record;
use serde::{Deserialize, Serialize};
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, warn};

/// One retrieved page
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSummary {
    /// Window offset
    pub offset: u64,
    /// Rows requested
    pub requested: u64,
    /// Rows returned
    pub returned: u64,
}

/// Why a pagination run stopped
#[derive(Debug, Clone, PartialEq)]
pub enum StopReason {
    /// A page returned fewer rows than requested
    Exhausted,
    /// The known row bound was reached
    BoundReached,
    /// The next page is cooling down; resume from `offset` at `ready_at`
    Deferred {
        /// Offset of the blocked page
        offset: u64,
        /// When the page may be requested again
        ready_at: Instant,
    },
    /// The page at `offset` failed after retries
    Failed {
        /// Offset of the failed page
        offset: u64,
        /// Last error
        error: QueryError,
    },
}

/// Accumulated progress of one table, kept across deferrals
#[derive(Debug, Default)]
pub struct PaginationState {
    /// Offset of the next page
    pub next_offset: u64,
    /// Rows retrieved so far, in service order
    pub rows: Vec<Record>,
    /// Pages retrieved so far, in offset order
    pub pages: Vec<PageSummary>,
    /// Time spent inside pagination runs
    pub elapsed: Duration,
}

impl PaginationState {
    /// Fresh state starting at offset 0
    pub fn new() -> Self {
        Self::default()
    }
}

/// Drives the query client page by page under the rate governor
pub struct Paginator<'a> {
    client: &'a dyn QueryClient,
    session: &'a Session,
    governor: &'a mut RateGovernor,
}

impl<'a> Paginator<'a> {
    /// Create a paginator over one session
    pub fn new(
        client: &'a dyn QueryClient,
        session: &'a Session,
        governor: &'a mut RateGovernor,
    ) -> Self {
        Self {
            client,
            session,
            governor,
        }
    }

    /// Fetch pages of `request` into `state` until a stop condition
    ///
    /// `bound` is the known row count, if any. Returns `Err` only for
    /// authentication failures, which abort the whole run; every other failure
    /// is reported as [`StopReason::Failed`] with the rows retrieved so far kept
    /// in `state`.
    pub async fn run(
        &mut self,
        request: &QueryRequest,
        bound: Option<u64>,
        state: &mut PaginationState,
    ) -> Result<StopReason, QueryError> {
        let started = Instant::now();
        let result = self.run_inner(request, bound, state).await;
        state.elapsed += started.elapsed();
        result
    }

    async fn run_inner(
        &mut self,
        request: &QueryRequest,
        bound: Option<u64>,
        state: &mut PaginationState,
    ) -> Result<StopReason, QueryError> {
        let page_cap = self.governor.policy().page_cap;
        let max_pages = self.governor.policy().max_pages;

        loop {
            let offset = state.next_offset;

            if let Some(bound) = bound {
                if offset >= bound {
                    debug!(table = %request.table, rows = state.rows.len(), "Row bound reached");
                    return Ok(StopReason::BoundReached);
                }
            }

            // Safety check: prevent infinite loops
            if state.pages.len() as u64 >= max_pages {
                return Ok(StopReason::Failed {
                    offset,
                    error: QueryError::RemoteQuery {
                        message: format!(
                            "max pages ({max_pages}) exceeded for table {} - possible infinite loop",
                            request.table
                        ),
                        retryable: false,
                    },
                });
            }

            let limit = bound.map_or(page_cap, |b| (b - offset).min(page_cap));
            let window = match QueryWindow::new(offset, limit, page_cap) {
                Ok(window) => window,
                Err(message) => {
                    return Ok(StopReason::Failed {
                        offset,
                        error: QueryError::RemoteQuery {
                            message,
                            retryable: false,
                        },
                    })
                }
            };
            let signature = request.signature(window);

            if let Admission::Deferred { ready_at } = self.governor.admit(&signature) {
                debug!(table = %request.table, offset, "Page deferred: signature cooling down");
                metrics::record_deferred(&request.table);
                return Ok(StopReason::Deferred { offset, ready_at });
            }

            debug!(
                table = %request.table,
                page = state.pages.len() + 1,
                offset,
                limit,
                "Fetching page"
            );

            match self.fetch_with_retry(request, window, &signature).await {
                Ok(mut page) => {
                    if page.len() as u64 > limit {
                        warn!(
                            table = %request.table,
                            offset,
                            limit,
                            returned = page.len(),
                            "Service returned more rows than requested; truncating"
                        );
                        page.truncate(limit as usize);
                    }
                    let returned = page.len() as u64;
                    state.pages.push(PageSummary {
                        offset,
                        requested: limit,
                        returned,
                    });
                    state.rows.extend(page);
                    state.next_offset = offset + returned;

                    debug!(
                        table = %request.table,
                        offset,
                        returned,
                        total = state.rows.len(),
                        "Received page"
                    );

                    if returned < limit {
                        return Ok(StopReason::Exhausted);
                    }
                }
                Err(QueryError::RateLimited) => {
                    let ready_at = self.governor.record_rate_limited(&signature);
                    warn!(
                        table = %request.table,
                        offset,
                        "Service reported rate limit; deferring page"
                    );
                    metrics::record_deferred(&request.table);
                    return Ok(StopReason::Deferred { offset, ready_at });
                }
                Err(error @ QueryError::Authentication(_)) => return Err(error),
                Err(error) => return Ok(StopReason::Failed { offset, error }),
            }
        }
    }

    /// Issue one page, pacing before every attempt and backing off on transient errors
    async fn fetch_with_retry(
        &mut self,
        request: &QueryRequest,
        window: QueryWindow,
        signature: &QuerySignature,
    ) -> Result<Vec<Record>, QueryError> {
        let max_attempts = self.governor.policy().max_attempts;
        let mut retry_count = 0u32;

        loop {
            self.governor.pace().await;
            let query_metrics = QueryMetrics::start(&request.table);

            match self.client.fetch(self.session, request, window).await {
                Ok(rows) => {
                    query_metrics.record_success(rows.len() as u64);
                    self.governor.record_attempt(signature);
                    return Ok(rows);
                }
                Err(error) => {
                    query_metrics.record_error(error.kind().as_str());

                    if !error.is_retryable() || retry_count + 1 >= max_attempts {
                        return Err(error);
                    }

                    let backoff = self.governor.backoff_delay(retry_count);
                    retry_count += 1;
                    warn!(
                        table = %request.table,
                        offset = window.offset(),
                        attempt = retry_count,
                        max_attempts,
                        backoff_ms = backoff.as_millis() as u64,
                        error = %error,
                        "Transient query failure, retrying"
                    );
                    metrics::record_retry(&request.table, retry_count, backoff);
                    tokio::time::sleep(backoff).await;
                }
            }
        }
    }
}
