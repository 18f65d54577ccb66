//! Merge stage over the tables of a run

use crate::support::{credentials, keyed_rows, orchestrator, spec, test_config, ScriptedClient};
use csmar_bulk_downloader::catalog::TableSpec;
use csmar_bulk_downloader::client::QueryError;
use csmar_bulk_downloader::config::MergeConfig;
use csmar_bulk_downloader::output::{read_table, OutputLayout};
use csmar_bulk_downloader::{Category, Value};
use std::sync::Arc;
use tempfile::TempDir;

const RUN_ID: &str = "20240108_140000";

fn industry_tables() -> (Vec<TableSpec>, ScriptedClient) {
    let specs = vec![
        spec("ind_a", Category::Classification, &["Stkcd", "IndA"]),
        spec("ind_b", Category::Classification, &["Stkcd", "IndB"]),
        spec("trades", Category::StockTrading, &["Stkcd", "Volume"]),
    ];
    let ind_a = keyed_rows("IndA", &["000001", "000002", "000003"]);
    let ind_b = keyed_rows("IndB", &["000002", "000003", "000004"]);
    let client = ScriptedClient::new()
        .with_table("IND_A", &["Stkcd", "IndA"], ind_a)
        .with_table("IND_B", &["Stkcd", "IndB"], ind_b)
        .with_table("TRADES", &["Stkcd", "Volume"], keyed_rows("Volume", &["000001"]));
    (specs, client)
}

fn merge_config(tables: &[&str]) -> MergeConfig {
    MergeConfig {
        name: "industry".to_string(),
        tables: tables.iter().map(|t| t.to_string()).collect(),
    }
}

#[tokio::test(start_paused = true)]
async fn test_merge_left_joins_on_entity() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = industry_tables();
    let client = Arc::new(client);
    let config = test_config(dir.path(), 10).with_merge(merge_config(&[]));

    let report = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    let summary = report.manifest.merge.as_ref().unwrap();
    // Empty list selects the classification tables only
    assert_eq!(summary.tables, vec!["ind_a", "ind_b"]);
    assert_eq!(summary.base_table.as_deref(), Some("ind_a"));
    assert_eq!(summary.row_count, 3);
    assert!(summary.excluded.is_empty());
    assert!(summary.error.is_none());

    let layout = OutputLayout::new(dir.path().join("output"));
    let merged = read_table(&layout.resolve(summary.file.as_deref().unwrap())).unwrap();
    assert_eq!(merged.columns, vec!["Stkcd", "IndA", "IndB"]);

    let keys: Vec<&Value> = merged.rows.iter().map(|row| &row["Stkcd"]).collect();
    assert_eq!(
        keys,
        vec![
            &Value::String("000001".to_string()),
            &Value::String("000002".to_string()),
            &Value::String("000003".to_string()),
        ]
    );
    // Entity missing from the right side gets nulls
    assert_eq!(merged.rows[0]["IndB"], Value::Null);
    assert_eq!(merged.rows[1]["IndB"], Value::String("IndB-000002".to_string()));
}

#[tokio::test(start_paused = true)]
async fn test_merge_excludes_failed_and_unknown_tables() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = industry_tables();
    let client = Arc::new(client.fail_at("IND_B", 0, QueryError::remote("table offline")));
    let config = test_config(dir.path(), 10)
        .with_merge(merge_config(&["ind_a", "ind_b", "no_such_table", "ind_a", "trades"]));

    let report = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    let summary = report.manifest.merge.as_ref().unwrap();
    assert_eq!(summary.tables, vec!["ind_a", "trades"]);
    assert_eq!(summary.row_count, 3);

    let reasons: Vec<(&str, &str)> = summary
        .excluded
        .iter()
        .map(|e| (e.table.as_str(), e.reason.as_str()))
        .collect();
    assert_eq!(reasons.len(), 2);
    assert_eq!(reasons[0].0, "ind_b");
    assert!(reasons[0].1.starts_with("download failed"));
    assert_eq!(reasons[1], ("no_such_table", "not in catalog"));
}

#[tokio::test(start_paused = true)]
async fn test_merge_with_no_usable_inputs_records_error() {
    let dir = TempDir::new().unwrap();
    let (specs, client) = industry_tables();
    let client = Arc::new(client);
    let config = test_config(dir.path(), 10).with_merge(merge_config(&["missing"]));

    let report = orchestrator(&client, specs, config)
        .with_run_id(RUN_ID)
        .run(&credentials())
        .await
        .unwrap();

    let summary = report.manifest.merge.as_ref().unwrap();
    assert!(summary.file.is_none());
    assert!(summary.error.is_some());
    assert!(!dir
        .path()
        .join("output")
        .join(format!("industry_{RUN_ID}.csv"))
        .exists());
}
