//! Cooperative cancellation between tables and during cooldown waits

use crate::support::{credentials, orchestrator, test_config, three_tables};
use csmar_bulk_downloader::cancel::CancelToken;
use csmar_bulk_downloader::client::QueryError;
use csmar_bulk_downloader::config::MergeConfig;
use csmar_bulk_downloader::manifest::RunManifest;
use csmar_bulk_downloader::{ErrorKind, Outcome};
use std::sync::Arc;
use std::time::Duration;
use tempfile::TempDir;
use tokio::time::Instant;

const RUN_ID: &str = "20240106_170000";

#[tokio::test(start_paused = true)]
async fn test_cancel_stops_before_next_table() {
    let dir = TempDir::new().unwrap();
    let cancel = CancelToken::new();
    let (specs, client) = three_tables();
    let client = Arc::new(client.cancel_on_fetch("T1", cancel.clone()));

    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_cancel(cancel)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    // The table in flight finishes; the rest never start
    let manifest = &report.manifest;
    assert!(manifest.cancelled);
    assert_eq!(manifest.tables.len(), 1);
    assert_eq!(manifest.entry("t1").unwrap().outcome, Outcome::Success);
    assert_eq!(manifest.not_attempted, vec!["t2", "t3"]);
    assert!(client.fetch_offsets("T2").is_empty());
    assert!(!report.is_complete());

    let saved = RunManifest::load(&report.manifest_path).unwrap();
    assert!(saved.cancelled);
    assert_eq!(saved.not_attempted, vec!["t2", "t3"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancel_while_deferred_keeps_partial_rows() {
    let dir = TempDir::new().unwrap();
    let cancel = CancelToken::new();
    let (specs, client) = three_tables();
    let client = Arc::new(
        client
            .fail_at("T1", 2, QueryError::RateLimited)
            .cancel_on_fetch("T2", cancel.clone()),
    );

    let started = Instant::now();
    let report = orchestrator(&client, specs, test_config(dir.path(), 2))
        .with_cancel(cancel)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    // No cooldown wait once cancelled
    assert!(started.elapsed() < Duration::from_secs(60));

    let manifest = &report.manifest;
    assert!(manifest.cancelled);
    assert_eq!(manifest.not_attempted, vec!["t3"]);

    let t1 = manifest.entry("t1").unwrap();
    assert_eq!(t1.outcome, Outcome::PartialSuccess);
    assert_eq!(t1.row_count, 2);
    assert_eq!(t1.error_kind, Some(ErrorKind::Cancelled));
    assert_eq!(t1.failed_at_offset, Some(2));
    assert_eq!(t1.reason.as_deref(), Some("cancelled while deferred"));
    assert!(t1.file.is_some());

    assert_eq!(manifest.entry("t2").unwrap().outcome, Outcome::Success);
    // Catalog order is kept even though t2 finished first
    let order: Vec<&str> = manifest.tables.iter().map(|e| e.table.as_str()).collect();
    assert_eq!(order, vec!["t1", "t2"]);
}

#[tokio::test(start_paused = true)]
async fn test_cancelled_run_skips_merge() {
    let dir = TempDir::new().unwrap();
    let cancel = CancelToken::new();
    let (specs, client) = three_tables();
    let client = Arc::new(client.cancel_on_fetch("T1", cancel.clone()));
    let config = test_config(dir.path(), 2).with_merge(MergeConfig {
        name: "merged".to_string(),
        tables: vec!["t1".to_string(), "t2".to_string()],
    });

    let report = orchestrator(&client, specs, config)
        .with_cancel(cancel)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    let merge = report.manifest.merge.as_ref().unwrap();
    assert!(merge.file.is_none());
    assert_eq!(merge.error.as_deref(), Some("run cancelled before merge"));
    assert!(!dir.path().join("output").join(format!("merged_{RUN_ID}.csv")).exists());
}
