use crate::support::{rows, spec, test_config, test_policy, ScriptedClient, COLUMNS};
use csmar_bulk_downloader::client::{QueryRequest, Session};
use csmar_bulk_downloader::config::DEFAULT_PAGE_CAP;
use csmar_bulk_downloader::governor::RateGovernor;
use csmar_bulk_downloader::pagination::{PageSummary, PaginationState, Paginator, StopReason};
use csmar_bulk_downloader::Category;
use std::path::Path;

fn request(page_cap: u64) -> QueryRequest {
    let config = test_config(Path::new("unused"), page_cap);
    QueryRequest::for_table(&spec("big", Category::StockTrading, &COLUMNS), &config)
}

fn session() -> Session {
    Session::new("tester@example.com", "token")
}

#[tokio::test(start_paused = true)]
async fn test_full_page_at_cap_is_followed_by_empty_page() {
    let client = ScriptedClient::new().with_synthetic("BIG", DEFAULT_PAGE_CAP);
    let mut governor = RateGovernor::new(test_policy(DEFAULT_PAGE_CAP));
    let mut state = PaginationState::new();

    let stop = Paginator::new(&client, &session(), &mut governor)
        .run(&request(DEFAULT_PAGE_CAP), None, &mut state)
        .await
        .unwrap();

    assert_eq!(stop, StopReason::Exhausted);
    assert_eq!(state.rows.len() as u64, DEFAULT_PAGE_CAP);
    assert_eq!(
        state.pages,
        vec![
            PageSummary {
                offset: 0,
                requested: DEFAULT_PAGE_CAP,
                returned: DEFAULT_PAGE_CAP,
            },
            PageSummary {
                offset: DEFAULT_PAGE_CAP,
                requested: DEFAULT_PAGE_CAP,
                returned: 0,
            },
        ]
    );
}

#[tokio::test(start_paused = true)]
async fn test_bound_shrinks_last_window() {
    let client = ScriptedClient::new().with_table("BIG", &COLUMNS, rows("big", 5));
    let mut governor = RateGovernor::new(test_policy(2));
    let mut state = PaginationState::new();

    let stop = Paginator::new(&client, &session(), &mut governor)
        .run(&request(2), Some(5), &mut state)
        .await
        .unwrap();

    assert_eq!(stop, StopReason::BoundReached);
    let windows: Vec<(u64, u64)> = state.pages.iter().map(|p| (p.offset, p.requested)).collect();
    assert_eq!(windows, vec![(0, 2), (2, 2), (4, 1)]);
    assert_eq!(state.next_offset, 5);
}

#[tokio::test(start_paused = true)]
async fn test_short_page_before_bound_stops() {
    // Count said 6 but only 3 rows come back
    let client = ScriptedClient::new().with_table("BIG", &COLUMNS, rows("big", 3));
    let mut governor = RateGovernor::new(test_policy(2));
    let mut state = PaginationState::new();

    let stop = Paginator::new(&client, &session(), &mut governor)
        .run(&request(2), Some(6), &mut state)
        .await
        .unwrap();

    assert_eq!(stop, StopReason::Exhausted);
    assert_eq!(state.rows.len(), 3);
    assert_eq!(client.fetch_offsets("BIG"), vec![0, 2]);
}

#[tokio::test(start_paused = true)]
async fn test_max_pages_guard() {
    let client = ScriptedClient::new().with_table("BIG", &COLUMNS, rows("big", 10));
    let mut policy = test_policy(2);
    policy.max_pages = 2;
    let mut governor = RateGovernor::new(policy);
    let mut state = PaginationState::new();

    let stop = Paginator::new(&client, &session(), &mut governor)
        .run(&request(2), None, &mut state)
        .await
        .unwrap();

    assert!(matches!(stop, StopReason::Failed { offset: 4, .. }));
    assert_eq!(state.rows.len(), 4);
}

#[tokio::test(start_paused = true)]
async fn test_resumes_from_saved_offset() {
    let client = ScriptedClient::new().with_table("BIG", &COLUMNS, rows("big", 5));
    let mut governor = RateGovernor::new(test_policy(2));
    let mut state = PaginationState {
        next_offset: 2,
        ..PaginationState::new()
    };

    Paginator::new(&client, &session(), &mut governor)
        .run(&request(2), Some(5), &mut state)
        .await
        .unwrap();

    assert_eq!(client.fetch_offsets("BIG"), vec![2, 4]);
    assert_eq!(state.rows.len(), 3);
}
