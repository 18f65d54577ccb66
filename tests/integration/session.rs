//! Session lifecycle: account lock, authentication failures and column checks

use crate::support::{
    credentials, orchestrator, rows, spec, test_config, three_tables, Call, ScriptedClient,
    COLUMNS,
};
use csmar_bulk_downloader::client::QueryError;
use csmar_bulk_downloader::downloader::DownloadError;
use csmar_bulk_downloader::lock::RunLock;
use csmar_bulk_downloader::manifest::RunManifest;
use csmar_bulk_downloader::output::OutputLayout;
use csmar_bulk_downloader::{Category, ErrorKind, Outcome};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;

const RUN_ID: &str = "20240107_101500";

#[tokio::test(start_paused = true)]
async fn test_second_run_for_same_account_is_rejected() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client);
    let config = test_config(dir.path(), 2);

    let _held = RunLock::try_acquire(&config.lock_dir, &credentials().username).unwrap();
    let result = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await;

    assert!(matches!(result, Err(DownloadError::Lock(_))));
    // Rejected before logging in
    assert!(client.calls().is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_lock_released_after_run() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client);
    let config = test_config(dir.path(), 2);
    let lock_dir = config.lock_dir.clone();

    orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    assert!(RunLock::try_acquire(&lock_dir, &credentials().username).is_ok());
}

#[tokio::test(start_paused = true)]
async fn test_rejected_login_is_fatal() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client.with_login_error(QueryError::Authentication(
        "invalid password".to_string(),
    )));

    let result = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await;

    match result {
        Err(DownloadError::Authentication(message)) => {
            assert!(message.contains("invalid password"))
        }
        other => panic!("expected authentication error, got {other:?}"),
    }
    let manifest = OutputLayout::new(dir.path().join("output")).manifest_file(RUN_ID);
    assert!(!manifest.exists());
}

#[tokio::test(start_paused = true)]
async fn test_unreachable_service_is_connection_error() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client.with_login_error(QueryError::transient("connection refused")));

    let result = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await;

    assert!(matches!(result, Err(DownloadError::Connection(_))));
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_aborts_and_records_unstarted_tables() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client.fail_at(
        "T2",
        2,
        QueryError::Authentication("session expired".to_string()),
    ));

    let result = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await;
    assert!(matches!(result, Err(DownloadError::Authentication(_))));

    let path = OutputLayout::new(dir.path().join("output")).manifest_file(RUN_ID);
    let manifest = RunManifest::load(&path).unwrap();
    assert!(manifest.aborted.as_deref().unwrap().contains("session expired"));
    assert_eq!(manifest.not_attempted, vec!["t3"]);
    assert!(manifest.end_time.is_some());

    assert_eq!(manifest.entry("t1").unwrap().outcome, Outcome::Success);
    let t2 = manifest.entry("t2").unwrap();
    // The first page made it; it is kept
    assert_eq!(t2.outcome, Outcome::PartialSuccess);
    assert_eq!(t2.row_count, 2);
    assert_eq!(t2.error_kind, Some(ErrorKind::Authentication));
    assert_eq!(t2.failed_at_offset, Some(2));

    assert!(client.fetch_offsets("T3").is_empty());
}

#[tokio::test(start_paused = true)]
async fn test_run_with_existing_session() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = three_tables();
    let client = Arc::new(client);
    let session = csmar_bulk_downloader::client::Session::new("tester@example.com", "token");

    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run_with_session(&session)
        .await
        .unwrap();

    assert!(report.is_complete());
    assert!(!client.calls().contains(&Call::Login));
}

#[tokio::test(start_paused = true)]
async fn test_missing_columns_fail_table_without_fetching() {
    let dir = TempDir::new().unwrap();
    let specs = vec![
        spec("t1", Category::BasicInfo, &COLUMNS),
        spec("t2", Category::BasicInfo, &["Stkcd", "Value", "Indnme"]),
    ];
    let client = Arc::new(
        ScriptedClient::new()
            .with_table("T1", &COLUMNS, rows("t1", 3))
            .with_table("T2", &COLUMNS, rows("t2", 3)),
    );

    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    let t2 = report.manifest.entry("t2").unwrap();
    assert_eq!(t2.outcome, Outcome::Failure);
    assert_eq!(t2.error_kind, Some(ErrorKind::Validation));
    assert_eq!(t2.reason.as_deref(), Some("missing columns: Indnme"));
    assert!(t2.file.is_none());

    let touched_t2 = client.calls().into_iter().any(|call| {
        matches!(call, Call::Count(ref t) | Call::Fetch { table: ref t, .. } if t == "T2")
    });
    assert!(!touched_t2);
    assert_eq!(report.manifest.entry("t1").unwrap().outcome, Outcome::Success);
}

#[tokio::test(start_paused = true)]
async fn test_unlistable_fields_still_fetch() {
    let dir = TempDir::new().unwrap();
    let specs = vec![spec("t1", Category::BasicInfo, &COLUMNS)];
    // Rows served but no field listing registered
    let client = Arc::new(ScriptedClient::new().with_synthetic("T1", 1));

    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    assert_eq!(report.manifest.entry("t1").unwrap().outcome, Outcome::Success);
    assert_eq!(client.fetch_offsets("T1"), vec![0]);
}

#[tokio::test(start_paused = true)]
async fn test_expired_session_on_resumed_deferral_keeps_next_table() {
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
            .fail_at("T1", 2, QueryError::RateLimited)
            .fail_at("T1", 2, QueryError::Authentication("expired".to_string())),
    );
    let mut config = test_config(dir.path(), 2);
    // T1's cooldown elapses while T2 is fetched, so T1 resumes before T3 starts
    config.policy.cooldown = Duration::from_secs(5);
    config.policy.min_spacing = Duration::from_secs(3);

    let result = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await;
    assert!(matches!(result, Err(DownloadError::Authentication(_))));

    let path = OutputLayout::new(dir.path().join("output")).manifest_file(RUN_ID);
    let manifest = RunManifest::load(&path).unwrap();
    let entries: Vec<(&str, Outcome)> = manifest
        .tables
        .iter()
        .map(|e| (e.table.as_str(), e.outcome))
        .collect();
    assert_eq!(
        entries,
        vec![("t1", Outcome::PartialSuccess), ("t2", Outcome::Success)]
    );
    assert_eq!(manifest.not_attempted, vec!["t3"]);
    assert_eq!(
        manifest.entry("t1").unwrap().error_kind,
        Some(ErrorKind::Authentication)
    );
    assert!(client.fetch_offsets("T3").is_empty());
}
