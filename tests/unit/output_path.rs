use chrono::{TimeZone, Utc};
use csmar_bulk_downloader::output::path::{check_file_stem, run_id_from};
use csmar_bulk_downloader::output::OutputLayout;
use csmar_bulk_downloader::Category;
use std::path::PathBuf;

#[test]
fn test_table_file_per_category() {
    let layout = OutputLayout::new("data");
    for category in Category::ALL {
        let path = layout.table_file(category, "tbl", "20240101_000000");
        assert_eq!(
            path,
            PathBuf::from("data")
                .join(category.as_str())
                .join("tbl_20240101_000000.csv")
        );
    }
}

#[test]
fn test_manifest_and_merged_files_at_root() {
    let layout = OutputLayout::new("data");
    assert_eq!(
        layout.manifest_file("20240101_000000"),
        PathBuf::from("data/manifest_20240101_000000.json")
    );
    assert_eq!(
        layout.merged_file("industry", "20240101_000000"),
        PathBuf::from("data/industry_20240101_000000.csv")
    );
}

#[test]
fn test_relative_round_trip() {
    let layout = OutputLayout::new("/srv/csmar");
    let path = layout.table_file(Category::Classification, "area", "20240101_000000");
    let relative = layout.relative(&path);
    assert_eq!(relative, "classification/area_20240101_000000.csv");
    assert_eq!(layout.resolve(&relative), path);
}

#[test]
fn test_run_id_format() {
    let time = Utc.with_ymd_and_hms(2024, 3, 9, 7, 5, 2).unwrap();
    assert_eq!(run_id_from(time), "20240309_070502");
}

#[test]
fn test_file_stem_rules() {
    assert!(check_file_stem("industry_csrc2012").is_ok());
    assert!(check_file_stem("merged-2024").is_ok());
    assert!(check_file_stem("").is_err());
    assert!(check_file_stem("a/b").is_err());
    assert!(check_file_stem("..").is_err());
    assert!(check_file_stem("name with space").is_err());
    assert!(check_file_stem(&"x".repeat(129)).is_err());
}
