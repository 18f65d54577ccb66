//! Keyword search over the service's table listings

use crate::support::ScriptedClient;
use csmar_bulk_downloader::client::{search_tables, QueryError, Session};

fn session() -> Session {
    Session::new("tester@example.com", "token")
}

#[tokio::test]
async fn test_search_matches_names_and_descriptions() {
    let client = ScriptedClient::new()
        .with_database(
            "Financial Statements",
            &[
                ("FS_Combas", Some("Balance Sheet")),
                ("FS_Comins", Some("Income Statement")),
            ],
        )
        .with_database(
            "Stock Trading",
            &[("STK_MKT_Dalyr", None), ("TRD_Dalyr", Some("Daily Stock Returns"))],
        );

    let found = search_tables(&client, &session(), "DALYR").await.unwrap();
    let names: Vec<(&str, &str)> = found
        .iter()
        .map(|m| (m.database.as_str(), m.table.name.as_str()))
        .collect();
    assert_eq!(
        names,
        vec![("Stock Trading", "STK_MKT_Dalyr"), ("Stock Trading", "TRD_Dalyr")]
    );

    let found = search_tables(&client, &session(), "income").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].database, "Financial Statements");
    assert_eq!(found[0].table.description.as_deref(), Some("Income Statement"));
}

#[tokio::test]
async fn test_search_skips_databases_that_fail() {
    let client = ScriptedClient::new()
        .with_database_error("Restricted", QueryError::remote("permission denied"))
        .with_database("Corporate Governance", &[("CG_Ybasic", Some("Governance basics"))]);

    let found = search_tables(&client, &session(), "governance").await.unwrap();
    assert_eq!(found.len(), 1);
    assert_eq!(found[0].table.name, "CG_Ybasic");
}

#[tokio::test]
async fn test_search_with_no_match_is_empty() {
    let client = ScriptedClient::new().with_database("Stock Trading", &[("TRD_Dalyr", None)]);
    assert!(search_tables(&client, &session(), "bond")
        .await
        .unwrap()
        .is_empty());
}

#[tokio::test]
async fn test_search_stops_on_expired_session() {
    let client = ScriptedClient::new()
        .with_database_error("Stock Trading", QueryError::Authentication("expired".into()))
        .with_database("Corporate Governance", &[("CG_Ybasic", None)]);

    let result = search_tables(&client, &session(), "cg").await;
    assert!(matches!(result, Err(QueryError::Authentication(_))));
}
