// Tests for run report generation

use chrono::Utc;
use harvest_core::harvest::{FailedUnit, HarvestSummary, NoData};
use harvest_core::report::{
    ReportFormat, generate_json_report, generate_report, generate_text_report, save_report,
};
use harvest_scanner::DedupPolicy;
use tempfile::TempDir;

fn summary() -> HarvestSummary {
    let now = Utc::now();
    HarvestSummary {
        run_id: "0b6d3c2e-8f4a-4f7e-9a51-3f0c1e2d4b5a".to_string(),
        roster: "roster_house_2022".to_string(),
        dedup_policy: DedupPolicy::Day,
        workers: 8,
        started_at: now,
        finished_at: now,
        elapsed_secs: 125.0,
        roster_entries: 3,
        snapshots_found: 12,
        completed: 9,
        checkpoint_hits: 2,
        already_recorded: 0,
        no_data: vec![NoData {
            candidate: "No Captures".to_string(),
            website_url: "nocaptures.com".to_string(),
            year: 2022,
            reason: "no captures in the archive for this year".to_string(),
        }],
        failed: vec![FailedUnit {
            candidate: "Jane Doe".to_string(),
            key: "janedoe2022.com@20220615120000".to_string(),
            error: "HTTP 404 for https://web.archive.org/web/20220615120000/http://janedoe2022.com/"
                .to_string(),
            attempts: 1,
        }],
        cancelled: 0,
        pages_fetched: 40,
        pages_skipped: 5,
        requests: 61,
        session_resets: 0,
        interrupted: false,
        fatal_error: None,
    }
}

#[test]
fn test_text_report_sections() {
    let report = generate_text_report(&summary());
    assert!(report.contains("HARVEST RUN REPORT"));
    assert!(report.contains("0b6d3c2e-8f4a-4f7e-9a51-3f0c1e2d4b5a"));
    assert!(report.contains("completed with failures"));
    assert!(report.contains("Dedup Policy: day"));
    assert!(report.contains("Duration:     2m 05s"));
    assert!(report.contains("janedoe2022.com@20220615120000"));
    assert!(report.contains("after 1 attempt)"));
    assert!(report.contains("nocaptures.com"));
    assert!(!report.contains("RUN STOPPED"));
    assert!(!report.contains("Session resets"));
}

#[test]
fn test_text_report_storage_failure() {
    let mut summary = summary();
    summary.failed.clear();
    summary.fatal_error = Some("janedoe2022.com@20220615120000: IO error: disk full".to_string());
    let report = generate_text_report(&summary);
    assert!(report.contains("stopped (storage failure)"));
    assert!(report.contains("RUN STOPPED"));
    assert!(report.contains("disk full"));
}

#[test]
fn test_json_report() {
    let json = generate_json_report(&summary()).unwrap();
    let value: serde_json::Value = serde_json::from_str(&json).unwrap();
    assert_eq!(value["completed"], 9);
    assert_eq!(value["dedup_policy"], "day");
    assert_eq!(value["failed"][0]["candidate"], "Jane Doe");
    assert!(value["fatal_error"].is_null());
}

#[test]
fn test_generate_and_save() {
    let temp_dir = TempDir::new().unwrap();
    let path = temp_dir.path().join("report.json");
    let content = generate_report(&summary(), ReportFormat::Json).unwrap();
    save_report(&content, &path).unwrap();
    assert_eq!(std::fs::read_to_string(&path).unwrap(), content);
}
