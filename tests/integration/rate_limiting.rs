//! Cooldown deferral, spacing and backoff under a full run

use crate::support::{
    credentials, orchestrator, rows, spec, test_config, test_policy, three_tables, Call,
    RecordingProgress, ScriptedClient, COLUMNS,
};
use csmar_bulk_downloader::client::{QueryError, QueryRequest, QueryWindow, Session};
use csmar_bulk_downloader::governor::RateGovernor;
use csmar_bulk_downloader::output::{read_table, OutputLayout};
use csmar_bulk_downloader::pagination::{PaginationState, Paginator, StopReason};
use csmar_bulk_downloader::{Category, Outcome, Value};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const RUN_ID: &str = "20240103_120000";

#[tokio::test(start_paused = true)]
async fn test_rate_limited_table_resumes_after_other_tables() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client.fail_at("T1", 2, QueryError::RateLimited));

    let started = Instant::now();
    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    // T1 parks at offset 2, T2 and T3 run, then T1 picks up where it stopped
    assert_eq!(client.fetch_order(), vec!["T1", "T2", "T3", "T1"]);
    assert_eq!(client.fetch_offsets("T1"), vec![0, 2, 2, 4]);
    assert!(started.elapsed() >= Duration::from_secs(60));

    let t1 = report.manifest.entry("t1").unwrap();
    assert_eq!(t1.outcome, Outcome::Success);
    assert_eq!(t1.row_count, 5);
    let offsets: Vec<u64> = t1.pages.iter().map(|p| p.offset).collect();
    assert_eq!(offsets, vec![0, 2, 4]);
    assert!(report.is_complete());

    // Rows keep service order across the deferral
    let path = OutputLayout::new(dir.path().join("output")).resolve(t1.file.as_deref().unwrap());
    let values: Vec<Value> = read_table(&path)
        .unwrap()
        .rows
        .into_iter()
        .map(|mut row| row.remove("Value").unwrap())
        .collect();
    let expected: Vec<Value> = (0..5).map(|i| Value::String(format!("t1-{i}"))).collect();
    assert_eq!(values, expected);
}

#[tokio::test(start_paused = true)]
async fn test_deferred_table_goes_before_next_new_table_once_ready() {
    let dir = TempDir::new().unwrap();
    let specs = vec![
        spec("t1", Category::BasicInfo, &COLUMNS),
        spec("t2", Category::BasicInfo, &COLUMNS),
        spec("t3", Category::BasicInfo, &COLUMNS),
    ];
    let client = Arc::new(
        ScriptedClient::new()
            .with_table("T1", &COLUMNS, rows("t1", 3))
            .with_table("T2", &COLUMNS, rows("t2", 3))
            .with_table("T3", &COLUMNS, rows("t3", 3))
            .fail_at("T1", 2, QueryError::RateLimited),
    );
    let mut config = test_config(dir.path(), 2);
    // Spacing long enough that T1's cooldown elapses while T2 is fetched
    config.policy.cooldown = Duration::from_secs(5);
    config.policy.min_spacing = Duration::from_secs(3);

    let report = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    assert_eq!(client.fetch_order(), vec!["T1", "T2", "T1", "T3"]);
    assert!(report.is_complete());
}

#[tokio::test(start_paused = true)]
async fn test_identical_signature_in_cooldown_never_reaches_client() {
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2);
    let table = spec("t1", Category::BasicInfo, &COLUMNS);
    let client = ScriptedClient::new().with_table("T1", &COLUMNS, rows("t1", 5));
    let session = Session::new("tester@example.com", "token");

    let request = QueryRequest::for_table(&table, &config);
    let mut governor = RateGovernor::new(config.policy.clone());
    governor.record_attempt(&request.signature(QueryWindow::new(0, 2, 2).unwrap()));

    let mut state = PaginationState::new();
    let stop = Paginator::new(&client, &session, &mut governor)
        .run(&request, Some(5), &mut state)
        .await
        .unwrap();

    match stop {
        StopReason::Deferred { offset, ready_at } => {
            assert_eq!(offset, 0);
            assert_eq!(ready_at - Instant::now(), Duration::from_secs(60));
        }
        other => panic!("expected deferral, got {other:?}"),
    }
    assert!(client.calls().is_empty());
    assert!(state.rows.is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_min_spacing_between_queries() {
    let dir = TempDir::new().unwrap();
    let specs = vec![spec("t1", Category::BasicInfo, &COLUMNS)];
    let client = Arc::new(ScriptedClient::new().with_table("T1", &COLUMNS, rows("t1", 5)));
    let mut config = test_config(dir.path(), 2).with_column_validation(false);
    config.policy.min_spacing = Duration::from_secs(3);

    let started = Instant::now();
    orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    // Count plus three pages: three gaps of at least 3s
    assert_eq!(client.calls().len(), 5);
    assert!(started.elapsed() >= Duration::from_secs(9));
}

#[tokio::test(start_paused = true)]
async fn test_transient_failures_retry_with_backoff() {
    let table = spec("t1", Category::BasicInfo, &COLUMNS);
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2);
    let client = ScriptedClient::new()
        .with_table("T1", &COLUMNS, rows("t1", 1))
        .fail_at("T1", 0, QueryError::transient("gateway timeout"))
        .fail_at("T1", 0, QueryError::transient("gateway timeout"));
    let session = Session::new("tester@example.com", "token");
    let request = QueryRequest::for_table(&table, &config);
    let mut governor = RateGovernor::new(test_policy(2));
    let mut state = PaginationState::new();

    let started = Instant::now();
    let stop = Paginator::new(&client, &session, &mut governor)
        .run(&request, None, &mut state)
        .await
        .unwrap();

    assert_eq!(stop, StopReason::Exhausted);
    assert_eq!(state.rows.len(), 1);
    assert_eq!(client.fetch_offsets("T1"), vec![0, 0, 0]);
    // 10ms then 20ms
    assert!(started.elapsed() >= Duration::from_millis(30));
}

#[tokio::test(start_paused = true)]
async fn test_retries_exhausted_fail_the_page() {
    let table = spec("t1", Category::BasicInfo, &COLUMNS);
    let dir = TempDir::new().unwrap();
    let config = test_config(dir.path(), 2);
    let mut client = ScriptedClient::new().with_table("T1", &COLUMNS, rows("t1", 4));
    for _ in 0..3 {
        client = client.fail_at("T1", 2, QueryError::transient("connection reset"));
    }
    let session = Session::new("tester@example.com", "token");
    let request = QueryRequest::for_table(&table, &config);
    let mut governor = RateGovernor::new(test_policy(2));
    let mut state = PaginationState::new();

    let stop = Paginator::new(&client, &session, &mut governor)
        .run(&request, None, &mut state)
        .await
        .unwrap();

    match stop {
        StopReason::Failed { offset, error } => {
            assert_eq!(offset, 2);
            assert!(error.is_retryable());
        }
        other => panic!("expected failure, got {other:?}"),
    }
    assert_eq!(client.fetch_offsets("T1"), vec![0, 2, 2, 2]);
    assert_eq!(state.rows.len(), 2);
    assert_eq!(state.next_offset, 2);
}

#[tokio::test(start_paused = true)]
async fn test_rate_limited_reply_is_not_retried_in_place() {
    let dir = TempDir::new().unwrap();
    let specs = vec![spec("t1", Category::BasicInfo, &COLUMNS)];
    let client = Arc::new(
        ScriptedClient::new()
            .with_table("T1", &COLUMNS, rows("t1", 1))
            .fail_at("T1", 0, QueryError::RateLimited),
    );

    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    // One rejected call, then one call after the cooldown
    let fetches = client
        .calls()
        .into_iter()
        .filter(|call| matches!(call, Call::Fetch { .. }))
        .count();
    assert_eq!(fetches, 2);
    assert_eq!(report.manifest.entry("t1").unwrap().outcome, Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_progress_events_follow_deferral() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client.fail_at("T1", 2, QueryError::RateLimited));
    let progress = Arc::new(RecordingProgress::default());

    orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .with_progress(progress.clone())
        .run(&credentials())
        .await
        .unwrap();

    assert_eq!(
        progress.events(),
        vec![
            format!("run {RUN_ID} 3"),
            "start t1".to_string(),
            "defer t1".to_string(),
            "start t2".to_string(),
            "finish t2 success".to_string(),
            "start t3".to_string(),
            "finish t3 success".to_string(),
            "start t1".to_string(),
            "finish t1 success".to_string(),
            "done 13".to_string(),
        ]
    );
}
