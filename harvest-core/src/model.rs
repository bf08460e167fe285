use crate::roster::RosterEntry;
use harvest_scanner::{SnapshotCrawl, SnapshotDescriptor, TextExtractor};
use serde::{Deserialize, Serialize};
use std::fmt;

/// Identity of a crawl unit: normalized source URL plus capture timestamp.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct UnitKey {
    pub source_url: String,
    pub timestamp: String,
}

impl UnitKey {
    pub fn new(source_url: impl Into<String>, timestamp: impl Into<String>) -> Self {
        Self {
            source_url: source_url.into(),
            timestamp: timestamp.into(),
        }
    }

    /// Single-line form used by the checkpoint log.
    pub fn to_line(&self) -> String {
        format!("{}\t{}", self.source_url, self.timestamp)
    }

    pub fn from_line(line: &str) -> Option<Self> {
        let (source_url, timestamp) = line.trim_end_matches('\r').split_once('\t')?;
        if source_url.is_empty()
            || timestamp.len() != 14
            || !timestamp.bytes().all(|b| b.is_ascii_digit())
        {
            return None;
        }
        Some(Self::new(source_url, timestamp))
    }
}

impl fmt::Display for UnitKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}@{}", self.source_url, self.timestamp)
    }
}

/// A roster entry paired with one of its snapshots.
#[derive(Debug, Clone)]
pub struct CrawlUnit {
    pub entry: RosterEntry,
    pub snapshot: SnapshotDescriptor,
}

impl CrawlUnit {
    pub fn new(entry: RosterEntry, snapshot: SnapshotDescriptor) -> Self {
        Self { entry, snapshot }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.snapshot.source_url, &self.snapshot.timestamp)
    }
}

/// Lifecycle of a unit: `Pending` goes straight to `Done` on a checkpoint
/// hit, otherwise through `InFlight` to one of the outcomes. Only
/// `Completed` leads to `Done`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum UnitState {
    Pending,
    InFlight,
    Completed,
    FailedRetryable,
    FailedFatal,
    Done,
}

impl UnitState {
    pub fn as_str(&self) -> &'static str {
        match self {
            UnitState::Pending => "pending",
            UnitState::InFlight => "in_flight",
            UnitState::Completed => "completed",
            UnitState::FailedRetryable => "failed_retryable",
            UnitState::FailedFatal => "failed_fatal",
            UnitState::Done => "done",
        }
    }

    pub fn can_transition_to(&self, next: UnitState) -> bool {
        use UnitState::*;
        matches!(
            (self, next),
            (Pending, Done)
                | (Pending, InFlight)
                | (InFlight, Completed)
                | (InFlight, FailedRetryable)
                | (InFlight, FailedFatal)
                | (FailedRetryable, InFlight)
                | (FailedRetryable, FailedFatal)
                | (Completed, Done)
                | (Completed, FailedFatal)
        )
    }
}

impl fmt::Display for UnitState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Everything recorded for one completed unit.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SnapshotResult {
    pub entry: RosterEntry,
    pub snapshot: SnapshotDescriptor,
    pub text: String,
    pub n_chars: usize,
    pub n_words: usize,
    pub pages: usize,
}

impl SnapshotResult {
    /// Aggregate a crawl in page order, root first.
    pub fn from_crawl(unit: &CrawlUnit, crawl: &SnapshotCrawl, extractor: &TextExtractor) -> Self {
        let summary = extractor.summarize(crawl.chunks());
        Self {
            entry: unit.entry.clone(),
            snapshot: unit.snapshot.clone(),
            text: summary.text,
            n_chars: summary.n_chars,
            n_words: summary.n_words,
            pages: crawl.pages.len(),
        }
    }

    pub fn key(&self) -> UnitKey {
        UnitKey::new(&self.snapshot.source_url, &self.snapshot.timestamp)
    }
}
