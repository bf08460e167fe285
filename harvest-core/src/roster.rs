//! Candidate roster loading.

use crate::error::{HarvestError, Result};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use tracing::{debug, info, warn};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Stage {
    Primary,
    #[default]
    General,
}

impl Stage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Stage::Primary => "primary",
            Stage::General => "general",
        }
    }
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Stage {
    type Err = String;

    fn from_str(s: &str) -> std::result::Result<Self, Self::Err> {
        match s.trim().to_ascii_lowercase().as_str() {
            "" | "general" | "g" | "2" => Ok(Stage::General),
            "primary" | "p" | "1" => Ok(Stage::Primary),
            other => Err(format!("unknown stage '{}'", other)),
        }
    }
}

/// One candidate website to harvest for one election year.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct RosterEntry {
    pub candidate: String,
    pub state: String,
    pub district: Option<String>,
    pub office: String,
    pub year: i32,
    pub party: String,
    pub stage: Stage,
    pub website_url: String,
}

#[derive(Debug, Deserialize)]
struct RosterRow {
    #[serde(default)]
    candidate: String,
    #[serde(default)]
    state: String,
    #[serde(default)]
    district: String,
    #[serde(default)]
    office: String,
    #[serde(default)]
    year: String,
    #[serde(default)]
    party: String,
    #[serde(default)]
    stage: String,
    #[serde(default, alias = "website", alias = "url")]
    website_url: String,
}

#[derive(Debug, Clone, Default)]
pub struct Roster {
    pub entries: Vec<RosterEntry>,
    /// Rows without a website.
    pub missing_website: usize,
    /// Rows that could not be read (bad year or stage).
    pub invalid_rows: usize,
}

impl Roster {
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }
}

/// `{roster_dir}/roster_{office}_{year}.csv`
pub fn roster_path(roster_dir: &Path, office: &str, year: i32) -> PathBuf {
    roster_dir.join(format!("roster_{}_{}.csv", office.to_ascii_lowercase(), year))
}

/// File stem used to scope checkpoints to one roster.
pub fn roster_scope(path: &Path) -> String {
    path.file_stem()
        .map(|s| s.to_string_lossy().into_owned())
        .unwrap_or_else(|| "roster".to_string())
}

pub fn load_roster(path: &Path) -> Result<Roster> {
    if !path.exists() {
        return Err(HarvestError::Roster(format!(
            "roster file not found: {}",
            path.display()
        )));
    }

    let mut reader = csv::ReaderBuilder::new()
        .trim(csv::Trim::All)
        .flexible(true)
        .from_path(path)?;

    let mut roster = Roster::default();
    for (idx, row) in reader.deserialize::<RosterRow>().enumerate() {
        // Header is line 1.
        let line = idx + 2;
        let row = match row {
            Ok(row) => row,
            Err(e) => {
                warn!("Roster line {} unreadable: {}", line, e);
                roster.invalid_rows += 1;
                continue;
            }
        };

        if row.website_url.is_empty() {
            debug!("Roster line {} ({}) has no website", line, row.candidate);
            roster.missing_website += 1;
            continue;
        }

        let Ok(year) = row.year.parse::<i32>() else {
            warn!("Roster line {} has invalid year '{}'", line, row.year);
            roster.invalid_rows += 1;
            continue;
        };
        let stage = match row.stage.parse::<Stage>() {
            Ok(stage) => stage,
            Err(e) => {
                warn!("Roster line {}: {}", line, e);
                roster.invalid_rows += 1;
                continue;
            }
        };

        roster.entries.push(RosterEntry {
            candidate: row.candidate,
            state: row.state,
            district: Some(row.district).filter(|d| !d.is_empty()),
            office: row.office,
            year,
            party: row.party,
            stage,
            website_url: row.website_url,
        });
    }

    info!(
        "Loaded {} roster entries from {} ({} without website, {} invalid)",
        roster.entries.len(),
        path.display(),
        roster.missing_website,
        roster.invalid_rows
    );
    Ok(roster)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_stage_parse() {
        assert_eq!("".parse::<Stage>(), Ok(Stage::General));
        assert_eq!("P".parse::<Stage>(), Ok(Stage::Primary));
        assert_eq!("2".parse::<Stage>(), Ok(Stage::General));
        assert!("runoff".parse::<Stage>().is_err());
    }

    #[test]
    fn test_roster_paths() {
        let path = roster_path(Path::new("data/rosters"), "House", 2022);
        assert_eq!(path, PathBuf::from("data/rosters/roster_house_2022.csv"));
        assert_eq!(roster_scope(&path), "roster_house_2022");
    }
}
