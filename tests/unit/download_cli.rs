use clap::Parser;
use csmar_bulk_downloader::cli::{Cli, Commands, DownloadArgs};
use csmar_bulk_downloader::config::{EntityFilter, DEFAULT_PAGE_CAP};
use csmar_bulk_downloader::Category;
use std::path::PathBuf;
use std::time::Duration;

fn parse(args: &[&str]) -> Cli {
    let mut argv = vec!["csmar-dl"];
    argv.extend_from_slice(args);
    Cli::try_parse_from(argv).unwrap()
}

fn download(cli: &Cli) -> &DownloadArgs {
    match &cli.command {
        Commands::Download(args) => args,
        other => panic!("expected download command, got {other:?}"),
    }
}

#[test]
fn test_download_defaults() {
    let cli = parse(&["download"]);
    let config = download(&cli).run_config(&cli).unwrap();

    assert_eq!(config.output_root, PathBuf::from("output"));
    assert_eq!(config.entity_filter, EntityFilter::default());
    assert_eq!(config.policy.page_cap, DEFAULT_PAGE_CAP);
    assert_eq!(config.policy.cooldown, Duration::from_secs(1800));
    assert_eq!(config.policy.min_spacing, Duration::from_secs(3));
    assert_eq!(config.policy.max_attempts, 3);
    assert!(config.count_first);
    assert!(config.validate_columns);
    assert!(config.merge.is_none());
    assert!(config.resume_run_id.is_none());
}

#[test]
fn test_download_all_options() {
    let cli = parse(&[
        "--output-dir",
        "/data/csmar",
        "--lock-dir",
        "/tmp/locks",
        "download",
        "--start-date",
        "2015-01-01",
        "--end-date",
        "2020-12-31",
        "--entity-code",
        "000001",
        "--entity-code",
        "600000",
        "--include-category",
        "classification",
        "--exclude-category",
        "stock_trading",
        "--merge-name",
        "industries",
        "--merge-table",
        "industry_csrc2012",
        "--resume",
        "20240101_120000",
        "--page-cap",
        "50000",
        "--cooldown-secs",
        "600",
        "--min-spacing-secs",
        "0",
        "--max-attempts",
        "5",
        "--no-count",
        "--no-validate",
    ]);
    let config = download(&cli).run_config(&cli).unwrap();

    assert_eq!(config.output_root, PathBuf::from("/data/csmar"));
    assert_eq!(config.lock_dir, PathBuf::from("/tmp/locks"));
    assert_eq!(config.date_range.start_str(), "2015-01-01");
    assert_eq!(config.date_range.end_str(), "2020-12-31");
    assert_eq!(
        config.entity_filter,
        EntityFilter::Codes(vec!["000001".to_string(), "600000".to_string()])
    );
    assert_eq!(config.categories.include, vec![Category::Classification]);
    assert_eq!(config.categories.exclude, vec![Category::StockTrading]);
    let merge = config.merge.unwrap();
    assert_eq!(merge.name, "industries");
    assert_eq!(merge.tables, vec!["industry_csrc2012"]);
    assert_eq!(config.resume_run_id.as_deref(), Some("20240101_120000"));
    assert_eq!(config.policy.page_cap, 50_000);
    assert_eq!(config.policy.cooldown, Duration::from_secs(600));
    assert_eq!(config.policy.min_spacing, Duration::ZERO);
    assert_eq!(config.policy.max_attempts, 5);
    assert!(!config.count_first);
    assert!(!config.validate_columns);
}

#[test]
fn test_all_entities() {
    let cli = parse(&["download", "--all-entities"]);
    assert_eq!(download(&cli).run_config(&cli).unwrap().entity_filter, EntityFilter::All);
}

#[test]
fn test_all_entities_conflicts_with_prefix() {
    let result = Cli::try_parse_from([
        "csmar-dl",
        "download",
        "--all-entities",
        "--entity-prefix",
        "6",
    ]);
    assert!(result.is_err());
}

#[test]
fn test_merge_table_requires_merge_name() {
    let result = Cli::try_parse_from(["csmar-dl", "download", "--merge-table", "area"]);
    assert!(result.is_err());
}

#[test]
fn test_unknown_category_rejected() {
    let result = Cli::try_parse_from(["csmar-dl", "download", "--include-category", "options"]);
    assert!(result.is_err());
}

#[test]
fn test_max_attempts_range() {
    assert!(Cli::try_parse_from(["csmar-dl", "download", "--max-attempts", "0"]).is_err());
    assert!(Cli::try_parse_from(["csmar-dl", "download", "--max-attempts", "11"]).is_err());
}

#[test]
fn test_zero_page_cap_rejected_by_config() {
    let cli = parse(&["download", "--page-cap", "0"]);
    assert!(download(&cli).run_config(&cli).is_err());
}

#[test]
fn test_reversed_date_range_rejected() {
    let cli = parse(&[
        "download",
        "--start-date",
        "2024-01-01",
        "--end-date",
        "2020-01-01",
    ]);
    assert!(download(&cli).run_config(&cli).is_err());
}

#[test]
fn test_unsafe_resume_id_rejected() {
    let cli = parse(&["download", "--resume", "../other"]);
    assert!(download(&cli).run_config(&cli).is_err());
}

#[test]
fn test_explore_and_validate_parse() {
    let parses = |args: &[&str]| {
        let mut argv = vec!["csmar-dl"];
        argv.extend_from_slice(args);
        Cli::try_parse_from(argv).is_ok()
    };
    assert!(parses(&["explore", "databases"]));
    assert!(parses(&["explore", "fields", "FS_Combas", "--format", "json"]));
    assert!(parses(&["explore", "search", "balance"]));
    assert!(!parses(&["explore", "search"]));
    assert!(parses(&["validate", "catalog", "--online"]));
    assert!(parses(&["validate", "manifest", "20240101_120000"]));
    assert!(parses(&["catalog", "list", "--category", "classification"]));
}
