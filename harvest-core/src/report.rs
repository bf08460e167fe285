// Run report generation

use crate::harvest::HarvestSummary;
use serde::{Deserialize, Serialize};
use std::fs::File;
use std::io::Write;
use std::path::Path;

const RULE: &str = "━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━\n";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum ReportFormat {
    #[default]
    Text,
    Json,
}

impl ReportFormat {
    pub fn from_str(s: &str) -> Option<Self> {
        match s.to_lowercase().as_str() {
            "text" | "txt" => Some(ReportFormat::Text),
            "json" => Some(ReportFormat::Json),
            _ => None,
        }
    }
}

pub fn generate_report(summary: &HarvestSummary, format: ReportFormat) -> Result<String, serde_json::Error> {
    match format {
        ReportFormat::Text => Ok(generate_text_report(summary)),
        ReportFormat::Json => generate_json_report(summary),
    }
}

pub fn generate_text_report(summary: &HarvestSummary) -> String {
    let mut report = String::new();

    report.push_str(RULE);
    report.push_str("                           HARVEST RUN REPORT\n");
    report.push_str(RULE);
    report.push('\n');

    report.push_str(&format!("Run ID:       {}\n", summary.run_id));
    report.push_str(&format!("Status:       {}\n", status_to_string(summary)));
    report.push_str(&format!("Roster:       {}\n", summary.roster));
    report.push_str(&format!(
        "Started:      {}\n",
        summary.started_at.format("%Y-%m-%d %H:%M:%S UTC")
    ));
    report.push_str(&format!("Duration:     {}\n", format_duration(summary.elapsed_secs)));
    report.push_str(&format!("Dedup Policy: {}\n", summary.dedup_policy));
    report.push_str(&format!("Workers:      {}\n", summary.workers));
    report.push('\n');

    report.push_str(RULE);
    report.push_str("SUMMARY\n");
    report.push_str(RULE);
    report.push('\n');
    report.push_str(&format!("  Roster entries:      {}\n", summary.roster_entries));
    report.push_str(&format!("  Snapshots found:     {}\n", summary.snapshots_found));
    report.push_str(&format!("  Completed:           {}\n", summary.completed));
    if summary.already_recorded > 0 {
        report.push_str(&format!(
            "    already in output: {}\n",
            summary.already_recorded
        ));
    }
    report.push_str(&format!("  Skipped (done):      {}\n", summary.checkpoint_hits));
    report.push_str(&format!("  No data:             {}\n", summary.no_data.len()));
    report.push_str(&format!("  Failed:              {}\n", summary.failed.len()));
    if summary.cancelled > 0 {
        report.push_str(&format!("  Abandoned:           {}\n", summary.cancelled));
    }
    report.push_str(&format!("  Pages kept:          {}\n", summary.pages_fetched));
    report.push_str(&format!("  Pages skipped:       {}\n", summary.pages_skipped));
    report.push_str(&format!("  Requests:            {}\n", summary.requests));
    if summary.session_resets > 0 {
        report.push_str(&format!("  Session resets:      {}\n", summary.session_resets));
    }
    report.push('\n');

    if let Some(ref fatal) = summary.fatal_error {
        report.push_str(RULE);
        report.push_str("RUN STOPPED\n");
        report.push_str(RULE);
        report.push('\n');
        report.push_str(&format!("  {}\n\n", fatal));
    }

    if !summary.failed.is_empty() {
        report.push_str(RULE);
        report.push_str("FAILED UNITS (retried on the next run)\n");
        report.push_str(RULE);
        report.push('\n');
        for (idx, failed) in summary.failed.iter().enumerate() {
            report.push_str(&format!("[{}] {} - {}\n", idx + 1, failed.candidate, failed.key));
            report.push_str(&format!(
                "    {} (after {} attempt{})\n",
                failed.error,
                failed.attempts,
                if failed.attempts == 1 { "" } else { "s" }
            ));
        }
        report.push('\n');
    }

    if !summary.no_data.is_empty() {
        report.push_str(RULE);
        report.push_str("NO DATA\n");
        report.push_str(RULE);
        report.push('\n');
        for entry in &summary.no_data {
            report.push_str(&format!(
                "  {} ({}, {}): {}\n",
                entry.candidate, entry.website_url, entry.year, entry.reason
            ));
        }
        report.push('\n');
    }

    report.push_str(RULE);
    report.push_str("                             End of Report\n");
    report.push_str(RULE);
    report
}

pub fn generate_json_report(summary: &HarvestSummary) -> Result<String, serde_json::Error> {
    serde_json::to_string_pretty(summary)
}

pub fn save_report(content: &str, path: &Path) -> std::io::Result<()> {
    let mut file = File::create(path)?;
    file.write_all(content.as_bytes())?;
    Ok(())
}

fn status_to_string(summary: &HarvestSummary) -> &'static str {
    if summary.fatal_error.is_some() {
        "stopped (storage failure)"
    } else if summary.interrupted {
        "interrupted"
    } else if summary.failed.is_empty() {
        "completed"
    } else {
        "completed with failures"
    }
}

fn format_duration(secs: f64) -> String {
    let total = secs.round() as u64;
    let (h, m, s) = (total / 3600, (total % 3600) / 60, total % 60);
    if h > 0 {
        format!("{}h {:02}m {:02}s", h, m, s)
    } else if m > 0 {
        format!("{}m {:02}s", m, s)
    } else {
        format!("{:.1}s", secs)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_format_duration() {
        assert_eq!(format_duration(4.2), "4.2s");
        assert_eq!(format_duration(125.0), "2m 05s");
        assert_eq!(format_duration(3725.0), "1h 02m 05s");
    }

    #[test]
    fn test_report_format_from_str() {
        assert_eq!(ReportFormat::from_str("JSON"), Some(ReportFormat::Json));
        assert_eq!(ReportFormat::from_str("txt"), Some(ReportFormat::Text));
        assert_eq!(ReportFormat::from_str("html"), None);
    }
}
