//! Run orchestrator
//!
//! Owns the session, the rate governor and the manifest for one run. Tables are
//! processed sequentially in catalog order; the only concurrency is the
//! deferred queue, which lets later tables proceed while an earlier table's
//! next page cools down.

use super::job::{TableJob, TableState};
use super::progress::{NoProgress, ProgressObserver};
use super::DownloadError;
use crate::cancel::CancelToken;
use crate::catalog::validate::{check_columns, ColumnCheck, ColumnStatus};
use crate::catalog::{TableCatalog, TableSpec};
use crate::client::{Credentials, QueryClient, QueryError, Session};
use crate::config::{MergeConfig, RunConfig};
use crate::governor::{DeferredQueue, RateGovernor};
use crate::lock::RunLock;
use crate::manifest::{IssuedQuery, MergeExclusion, MergeSummary, RunManifest, TableEntry};
use crate::merge::{merge, MergeError, MergeInput};
use crate::metrics;
use crate::output::path::{check_file_stem, run_id_from};
use crate::output::{write_table, OutputLayout};
use crate::pagination::{Paginator, StopReason};
use crate::{Category, ErrorDescriptor, ErrorKind, FetchResult, Outcome};
use chrono::Utc;
use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use tokio::time::Instant;
use tracing::{debug, error, info, info_span, warn, Instrument};

/// Reason recorded for tables finalized by a cancel while they waited on a cooldown
const CANCELLED_WHILE_DEFERRED: &str = "cancelled while deferred";

/// Outcome of a completed run
#[derive(Debug, Clone)]
pub struct RunReport {
    /// Run identifier
    pub run_id: String,
    /// Where the manifest was written
    pub manifest_path: PathBuf,
    /// Final manifest
    pub manifest: RunManifest,
}

impl RunReport {
    /// Every selected table succeeded and the run was not cancelled
    pub fn is_complete(&self) -> bool {
        !self.manifest.cancelled
            && self.manifest.not_attempted.is_empty()
            && self
                .manifest
                .tables
                .iter()
                .all(|e| e.outcome == Outcome::Success)
    }
}

/// Where a drive of one job stopped
enum Step {
    Finished(FetchResult),
    Deferred(Instant),
}

/// Mutable state of one run
struct RunContext<'a> {
    session: &'a Session,
    layout: OutputLayout,
    run_id: String,
    manifest: RunManifest,
    manifest_path: PathBuf,
    governor: RateGovernor,
    deferred: DeferredQueue<TableJob>,
}

/// Drives a complete acquisition run
pub struct DownloadOrchestrator {
    client: Arc<dyn QueryClient>,
    catalog: TableCatalog,
    config: RunConfig,
    cancel: CancelToken,
    progress: Arc<dyn ProgressObserver>,
    run_id: Option<String>,
}

impl DownloadOrchestrator {
    /// Create an orchestrator
    pub fn new(client: Arc<dyn QueryClient>, catalog: TableCatalog, config: RunConfig) -> Self {
        Self {
            client,
            catalog,
            config,
            cancel: CancelToken::new(),
            progress: Arc::new(NoProgress),
            run_id: None,
        }
    }

    /// Use `cancel` to stop the run cooperatively
    pub fn with_cancel(mut self, cancel: CancelToken) -> Self {
        self.cancel = cancel;
        self
    }

    /// Report progress to `progress`
    pub fn with_progress(mut self, progress: Arc<dyn ProgressObserver>) -> Self {
        self.progress = progress;
        self
    }

    /// Use a fixed run identifier instead of the start timestamp
    pub fn with_run_id(mut self, run_id: impl Into<String>) -> Self {
        self.run_id = Some(run_id.into());
        self
    }

    /// Run configuration
    pub fn config(&self) -> &RunConfig {
        &self.config
    }

    /// Take the account lock, log in and run
    pub async fn run(&self, credentials: &Credentials) -> Result<RunReport, DownloadError> {
        self.config.validate().map_err(DownloadError::Config)?;
        let _lock = RunLock::try_acquire(&self.config.lock_dir, &credentials.username)?;

        info!(account = %credentials.username, "Logging in");
        let session = match self.client.login(credentials).await {
            Ok(session) => session,
            Err(err @ QueryError::Authentication(_)) => {
                return Err(DownloadError::Authentication(err.to_string()))
            }
            Err(err) => return Err(DownloadError::Connection(err.to_string())),
        };

        self.execute(&session).await
    }

    /// Take the account lock and run over an existing session
    pub async fn run_with_session(&self, session: &Session) -> Result<RunReport, DownloadError> {
        self.config.validate().map_err(DownloadError::Config)?;
        let _lock = RunLock::try_acquire(&self.config.lock_dir, session.account())?;
        self.execute(session).await
    }

    async fn execute(&self, session: &Session) -> Result<RunReport, DownloadError> {
        let start_time = Utc::now();
        let run_id = self
            .run_id
            .clone()
            .unwrap_or_else(|| run_id_from(start_time));
        check_file_stem(&run_id).map_err(DownloadError::Config)?;

        let layout = OutputLayout::new(&self.config.output_root);
        std::fs::create_dir_all(layout.root()).map_err(|e| {
            DownloadError::Io(format!(
                "Failed to create output directory {}: {e}",
                layout.root().display()
            ))
        })?;

        let selected = self.catalog.select(&self.config.categories);
        let order: Vec<&str> = selected.iter().map(|s| s.short_name.as_str()).collect();

        let mut ctx = RunContext {
            session,
            manifest_path: layout.manifest_file(&run_id),
            manifest: RunManifest::new(
                run_id.clone(),
                session.account(),
                start_time,
                self.config.date_range,
                self.config.entity_filter.clone(),
            ),
            layout,
            run_id,
            governor: RateGovernor::new(self.config.policy.clone()),
            deferred: DeferredQueue::new(),
        };

        info!(
            run_id = %ctx.run_id,
            account = %session.account(),
            tables = selected.len(),
            start = %self.config.date_range.start_str(),
            end = %self.config.date_range.end_str(),
            entities = %self.config.entity_filter,
            "Starting run"
        );
        self.progress.run_started(&ctx.run_id, selected.len());

        let pending = match &self.config.resume_run_id {
            Some(prior_id) => self.carry_over(&mut ctx, prior_id, &selected)?,
            None => selected.clone(),
        };
        self.save_manifest(&mut ctx)?;

        let checks = if self.config.validate_columns && !pending.is_empty() {
            match check_columns(self.client.as_ref(), session, &pending).await {
                Ok(checks) => checks
                    .into_iter()
                    .map(|c| (c.table.clone(), c))
                    .collect::<HashMap<_, _>>(),
                Err(err) => {
                    ctx.manifest
                        .not_attempted
                        .extend(pending.iter().map(|s| s.short_name.clone()));
                    return Err(self.abort(&mut ctx, &order, err.to_string()));
                }
            }
        } else {
            HashMap::new()
        };

        let fetched = match self.fetch_all(&mut ctx, &pending, &checks).await {
            Ok(()) => self.drain_deferred(&mut ctx).await,
            Err(err) => Err(err),
        };
        if let Err(err) = fetched {
            return Err(match err {
                DownloadError::Authentication(message) => self.abort(&mut ctx, &order, message),
                other => other,
            });
        }

        ctx.manifest.cancelled = self.cancel.is_cancelled();

        if let Some(merge_config) = &self.config.merge {
            let summary = if ctx.manifest.cancelled {
                MergeSummary {
                    name: merge_config.name.clone(),
                    error: Some("run cancelled before merge".to_string()),
                    ..MergeSummary::default()
                }
            } else {
                self.run_merge(&ctx, merge_config, &selected)
            };
            ctx.manifest.merge = Some(summary);
        }

        ctx.manifest.sort_entries(&order);
        ctx.manifest.finalize(Utc::now());
        self.save_manifest(&mut ctx)?;
        self.progress.run_finished(&ctx.manifest);

        info!(
            run_id = %ctx.run_id,
            success = ctx.manifest.count(Outcome::Success),
            partial = ctx.manifest.count(Outcome::PartialSuccess),
            failure = ctx.manifest.count(Outcome::Failure),
            not_attempted = ctx.manifest.not_attempted.len(),
            total_rows = ctx.manifest.total_rows,
            cancelled = ctx.manifest.cancelled,
            "Run complete"
        );

        Ok(RunReport {
            run_id: ctx.run_id,
            manifest_path: ctx.manifest_path,
            manifest: ctx.manifest,
        })
    }

    /// Record a prior run's successful tables and seed its cooldowns
    ///
    /// Returns the tables still to fetch.
    fn carry_over<'s>(
        &self,
        ctx: &mut RunContext<'_>,
        prior_id: &str,
        selected: &[&'s TableSpec],
    ) -> Result<Vec<&'s TableSpec>, DownloadError> {
        let prior = RunManifest::load(&ctx.layout.manifest_file(prior_id))?;

        let seeded = prior
            .issued_queries
            .iter()
            .filter(|q| ctx.governor.seed(q.signature.clone(), q.at))
            .count();

        let mut pending = Vec::new();
        for spec in selected {
            let reusable = prior.entry(&spec.short_name).filter(|entry| {
                entry.outcome == Outcome::Success
                    && entry
                        .file
                        .as_deref()
                        .is_some_and(|file| ctx.layout.resolve(file).is_file())
            });
            match reusable {
                Some(entry) => {
                    let carried = entry.carried_over(&prior.run_id);
                    info!(
                        table = %spec.short_name,
                        from = ?carried.resumed_from,
                        "Carried over from prior run"
                    );
                    self.progress.table_finished(&carried);
                    ctx.manifest.record(carried);
                }
                None => pending.push(*spec),
            }
        }

        info!(
            prior_run = %prior.run_id,
            carried = selected.len() - pending.len(),
            pending = pending.len(),
            cooldowns = seeded,
            "Resuming"
        );
        Ok(pending)
    }

    async fn fetch_all(
        &self,
        ctx: &mut RunContext<'_>,
        pending: &[&TableSpec],
        checks: &HashMap<String, ColumnCheck>,
    ) -> Result<(), DownloadError> {
        let mut queue = pending.iter();

        loop {
            if self.cancel.is_cancelled() {
                if !queue.as_slice().is_empty() {
                    warn!("Cancellation requested; remaining tables not attempted");
                }
                ctx.manifest
                    .not_attempted
                    .extend(queue.map(|s| s.short_name.clone()));
                break;
            }

            // Deferred tables whose cooldown has elapsed go before the next new table
            let now = Instant::now();
            while ctx.deferred.next_ready_at().is_some_and(|at| at <= now) {
                let Some((_, job)) = ctx.deferred.pop_next() else {
                    break;
                };
                if let Err(err) = self.advance(ctx, job).await {
                    return Err(self.unstarted(ctx, queue, err));
                }
            }

            let Some(spec) = queue.next() else {
                break;
            };
            let mut job = TableJob::new(spec, &self.config);

            if let Some(check) = checks.get(&spec.short_name) {
                match &check.status {
                    ColumnStatus::Ok => {}
                    ColumnStatus::MissingColumns(_) => {
                        let reason = check.reason().unwrap_or_default();
                        warn!(table = %spec.short_name, reason = %reason, "Skipping table");
                        let result = FetchResult::failure(
                            spec,
                            Duration::ZERO,
                            ErrorDescriptor::new(ErrorKind::Validation, reason),
                        );
                        self.finish(ctx, &mut job, result)?;
                        continue;
                    }
                    ColumnStatus::Error(message) => {
                        warn!(
                            table = %spec.short_name,
                            error = %message,
                            "Columns unverified; fetching anyway"
                        );
                    }
                }
            }

            if let Err(err) = self.advance(ctx, job).await {
                return Err(self.unstarted(ctx, queue, err));
            }
        }

        Ok(())
    }

    /// On an authentication failure, list the tables that never started
    fn unstarted(
        &self,
        ctx: &mut RunContext<'_>,
        rest: std::slice::Iter<'_, &TableSpec>,
        err: DownloadError,
    ) -> DownloadError {
        if matches!(err, DownloadError::Authentication(_)) {
            ctx.manifest
                .not_attempted
                .extend(rest.map(|s| s.short_name.clone()));
        }
        err
    }

    /// Wait out each deferred table's cooldown and resume it
    async fn drain_deferred(&self, ctx: &mut RunContext<'_>) -> Result<(), DownloadError> {
        while let Some((ready_at, mut job)) = ctx.deferred.pop_next() {
            if !self.cancel.is_cancelled() {
                let wait = ready_at.saturating_duration_since(Instant::now());
                if !wait.is_zero() {
                    info!(
                        table = %job.spec.short_name,
                        wait_secs = wait.as_secs(),
                        remaining = ctx.deferred.len() + 1,
                        "Waiting for cooldown"
                    );
                }
                tokio::select! {
                    _ = tokio::time::sleep_until(ready_at) => {}
                    _ = self.cancel.cancelled() => {
                        warn!("Cancellation requested while waiting on deferred tables");
                    }
                }
            }

            if self.cancel.is_cancelled() {
                let offset = job.progress.next_offset;
                let result = take_result(
                    &mut job,
                    Some(
                        ErrorDescriptor::new(ErrorKind::Cancelled, CANCELLED_WHILE_DEFERRED)
                            .at_offset(offset),
                    ),
                );
                self.finish(ctx, &mut job, result)?;
                continue;
            }

            self.advance(ctx, job).await?;
        }
        Ok(())
    }

    /// Drive `job` to its next stop and settle or defer it
    ///
    /// On an authentication failure the job is settled as a Failure (keeping any
    /// rows it has) before the error is returned.
    async fn advance(
        &self,
        ctx: &mut RunContext<'_>,
        mut job: TableJob,
    ) -> Result<(), DownloadError> {
        match self.drive(ctx, &mut job).await {
            Ok(Step::Finished(result)) => self.finish(ctx, &mut job, result),
            Ok(Step::Deferred(ready_at)) => {
                ctx.deferred.push(ready_at, job);
                self.save_manifest(ctx)
            }
            Err(DownloadError::Authentication(message)) => {
                let offset = job.progress.next_offset;
                let descriptor = ErrorDescriptor::new(ErrorKind::Authentication, message.clone())
                    .at_offset(offset);
                let result = take_result(&mut job, Some(descriptor));
                self.finish(ctx, &mut job, result)?;
                Err(DownloadError::Authentication(message))
            }
            Err(other) => Err(other),
        }
    }

    async fn drive(
        &self,
        ctx: &mut RunContext<'_>,
        job: &mut TableJob,
    ) -> Result<Step, DownloadError> {
        let span = info_span!(
            "table",
            table = %job.spec.short_name,
            remote = %job.spec.table_name,
            category = %job.spec.category
        );
        async {
            job.transition(TableState::Fetching)?;
            self.progress.table_started(&job.spec);

            if self.config.count_first && !job.counted && job.spec.expected_rows.is_none() {
                job.counted = true;
                ctx.governor.pace().await;
                let started = Instant::now();
                let count = self.client.query_count(ctx.session, &job.request).await;
                job.progress.elapsed += started.elapsed();
                match count {
                    Ok(count) => {
                        info!(expected_rows = count, "Pre-count");
                        job.expected_rows = Some(count);
                    }
                    Err(err @ QueryError::Authentication(_)) => {
                        return Err(DownloadError::Authentication(err.to_string()))
                    }
                    Err(err) => warn!(error = %err, "Pre-count failed; paging until a short page"),
                }
            }

            if job.bound() == Some(0) {
                info!("No rows to fetch");
                return Ok(Step::Finished(take_result(job, None)));
            }

            info!(
                offset = job.progress.next_offset,
                bound = ?job.bound(),
                "Fetching table"
            );
            let bound = job.bound();
            let stop = Paginator::new(self.client.as_ref(), ctx.session, &mut ctx.governor)
                .run(&job.request, bound, &mut job.progress)
                .await
                .map_err(|err| DownloadError::Authentication(err.to_string()))?;

            match stop {
                StopReason::Exhausted | StopReason::BoundReached => {
                    Ok(Step::Finished(take_result(job, None)))
                }
                StopReason::Deferred { offset, ready_at } => {
                    job.transition(TableState::Deferred)?;
                    let wait = ready_at.saturating_duration_since(Instant::now());
                    info!(
                        offset,
                        rows = job.progress.rows.len(),
                        wait_secs = wait.as_secs(),
                        "Table deferred"
                    );
                    self.progress.table_deferred(&job.spec, wait);
                    Ok(Step::Deferred(ready_at))
                }
                StopReason::Failed { offset, error } => {
                    warn!(
                        offset,
                        rows = job.progress.rows.len(),
                        error = %error,
                        "Table failed"
                    );
                    let descriptor =
                        ErrorDescriptor::new(error.kind(), error.to_string()).at_offset(offset);
                    Ok(Step::Finished(take_result(job, Some(descriptor))))
                }
            }
        }
        .instrument(span)
        .await
    }

    /// Persist a terminal result and record it in the manifest
    fn finish(
        &self,
        ctx: &mut RunContext<'_>,
        job: &mut TableJob,
        result: FetchResult,
    ) -> Result<(), DownloadError> {
        let entry = persist(ctx, &job.spec, result).with_expected_rows(job.expected_rows);
        job.transition(TableState::Done(entry.outcome))?;

        metrics::record_table_outcome(&entry.table, entry.outcome);
        match entry.outcome {
            Outcome::Success => info!(
                table = %entry.table,
                rows = entry.row_count,
                bytes = entry.bytes,
                elapsed_ms = entry.elapsed_ms,
                "Table complete"
            ),
            outcome => warn!(
                table = %entry.table,
                outcome = %outcome,
                rows = entry.row_count,
                reason = entry.reason.as_deref().unwrap_or_default(),
                "Table incomplete"
            ),
        }

        self.progress.table_finished(&entry);
        ctx.manifest.record(entry);
        self.save_manifest(ctx)
    }

    /// Settle deferred tables, finalize the manifest of an aborted run and build the error
    fn abort(&self, ctx: &mut RunContext<'_>, order: &[&str], message: String) -> DownloadError {
        error!(run_id = %ctx.run_id, reason = %message, "Run aborted");

        for mut job in ctx.deferred.drain() {
            let offset = job.progress.next_offset;
            let descriptor = ErrorDescriptor::new(ErrorKind::Authentication, message.clone())
                .at_offset(offset);
            let result = take_result(&mut job, Some(descriptor));
            if let Err(err) = self.finish(ctx, &mut job, result) {
                error!(
                    table = %job.spec.short_name,
                    error = %err,
                    "Failed to record abandoned table"
                );
            }
        }

        ctx.manifest.aborted = Some(message.clone());
        ctx.manifest.cancelled = self.cancel.is_cancelled();
        ctx.manifest.sort_entries(order);
        ctx.manifest.finalize(Utc::now());
        if let Err(err) = self.save_manifest(ctx) {
            error!(error = %err, "Failed to save manifest of aborted run");
        }
        self.progress.run_finished(&ctx.manifest);
        DownloadError::Authentication(message)
    }

    fn save_manifest(&self, ctx: &mut RunContext<'_>) -> Result<(), DownloadError> {
        ctx.governor.prune_expired();
        debug!(tracked = ctx.governor.tracked(), "Cooldowns pruned");
        ctx.manifest.issued_queries = ctx
            .governor
            .snapshot()
            .into_iter()
            .map(|(signature, at)| IssuedQuery { signature, at })
            .collect();
        ctx.manifest.save(&ctx.manifest_path)?;
        Ok(())
    }

    fn run_merge(
        &self,
        ctx: &RunContext<'_>,
        merge_config: &MergeConfig,
        selected: &[&TableSpec],
    ) -> MergeSummary {
        let mut summary = MergeSummary {
            name: merge_config.name.clone(),
            ..MergeSummary::default()
        };

        let names: Vec<String> = if merge_config.tables.is_empty() {
            selected
                .iter()
                .filter(|s| s.category == Category::Classification)
                .map(|s| s.short_name.clone())
                .collect()
        } else {
            let mut seen = HashSet::new();
            merge_config
                .tables
                .iter()
                .filter(|name| seen.insert(name.as_str()))
                .cloned()
                .collect()
        };

        let mut inputs = Vec::new();
        for name in names {
            match self.merge_input(ctx, &name) {
                Ok(input) => inputs.push(input),
                Err(reason) => {
                    warn!(table = %name, reason = %reason, "Excluded from merge");
                    summary.excluded.push(MergeExclusion { table: name, reason });
                }
            }
        }

        let dataset = match merge(inputs) {
            Ok(dataset) => dataset,
            Err(err) => {
                warn!(merge = %merge_config.name, error = %err, "Merge produced no output");
                summary.error = Some(err.to_string());
                return summary;
            }
        };

        summary.base_table = Some(dataset.base_table.clone());
        summary.tables = dataset.tables.clone();
        summary.row_count = dataset.rows.len() as u64;
        summary.column_count = dataset.columns.len() as u64;

        let path = ctx.layout.merged_file(&merge_config.name, &ctx.run_id);
        match write_table(&path, &dataset.columns, &dataset.rows) {
            Ok(bytes) => {
                summary.file = Some(ctx.layout.relative(&path));
                summary.bytes = bytes;
                info!(
                    merge = %merge_config.name,
                    base = %dataset.base_table,
                    tables = dataset.tables.len(),
                    rows = summary.row_count,
                    columns = summary.column_count,
                    "Merged file written"
                );
            }
            Err(err) => {
                let _ = std::fs::remove_file(&path);
                let err = MergeError::Output(err);
                error!(merge = %merge_config.name, error = %err, "Merge failed");
                summary.error = Some(err.to_string());
            }
        }
        summary
    }

    /// Load one merge input, or the reason it is excluded
    fn merge_input(&self, ctx: &RunContext<'_>, name: &str) -> Result<MergeInput, String> {
        let spec = self
            .catalog
            .get(name)
            .ok_or_else(|| "not in catalog".to_string())?;
        let entry = ctx
            .manifest
            .entry(name)
            .ok_or_else(|| "not downloaded in this run".to_string())?;
        if entry.outcome == Outcome::Failure {
            return Err(format!(
                "download failed: {}",
                entry.reason.as_deref().unwrap_or("unknown error")
            ));
        }
        let file = entry
            .file
            .as_deref()
            .ok_or_else(|| "no output file".to_string())?;
        MergeInput::from_csv(spec, &ctx.layout.resolve(file)).map_err(|e| e.to_string())
    }
}

/// Move a job's accumulated rows and pages into a result
fn take_result(job: &mut TableJob, error: Option<ErrorDescriptor>) -> FetchResult {
    FetchResult::new(
        &job.spec,
        std::mem::take(&mut job.progress.rows),
        std::mem::take(&mut job.progress.pages),
        job.progress.elapsed,
        error,
    )
}

/// Write a result's rows to its table file and build the manifest entry
///
/// Failures write nothing. A write error supersedes the result with a
/// `LocalIo` failure and removes the partial file.
fn persist(ctx: &RunContext<'_>, spec: &TableSpec, result: FetchResult) -> TableEntry {
    if result.outcome() == Outcome::Failure {
        return TableEntry::from_result(&result, None, 0);
    }

    let path = ctx
        .layout
        .table_file(spec.category, &spec.short_name, &ctx.run_id);
    match write_table(&path, &spec.columns, result.rows()) {
        Ok(bytes) => TableEntry::from_result(&result, Some(ctx.layout.relative(&path)), bytes),
        Err(err) => {
            error!(
                table = %spec.short_name,
                path = %path.display(),
                error = %err,
                "Failed to write table"
            );
            let _ = std::fs::remove_file(&path);
            let failed = result.superseded_by_failure(ErrorDescriptor::new(
                ErrorKind::LocalIo,
                format!("failed to write {}: {err}", path.display()),
            ));
            TableEntry {
                row_count: 0,
                ..TableEntry::from_result(&failed, None, 0)
            }
        }
    }
}
