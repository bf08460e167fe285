use serde::{Deserialize, Serialize};
use std::fmt;

/// One archived capture of a campaign URL.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotDescriptor {
    /// Source URL normalized for grouping and checkpoint keys.
    pub source_url: String,
    /// URL exactly as the archive index recorded it.
    pub original_url: String,
    /// Canonical `YYYYMMDDHHMMSS` capture time.
    pub timestamp: String,
    /// Archive URL that serves this capture.
    pub archive_url: String,
}

impl SnapshotDescriptor {
    /// `YYYYMMDD` of the capture.
    pub fn day(&self) -> &str {
        &self.timestamp[..8]
    }

    /// `YYYYMM` of the capture.
    pub fn month(&self) -> &str {
        &self.timestamp[..6]
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PageKind {
    Root,
    Frame,
    Subpage,
}

impl PageKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            PageKind::Root => "root",
            PageKind::Frame => "frame",
            PageKind::Subpage => "subpage",
        }
    }
}

/// A sanitized page that produced visible text. Lives only until it is
/// folded into a snapshot aggregate.
#[derive(Debug, Clone)]
pub struct PageRecord {
    pub url: String,
    pub kind: PageKind,
    /// Hops from the snapshot root (frames and links both count).
    pub depth: usize,
    pub body: String,
    pub chunks: Vec<String>,
    pub n_chars: usize,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SkipReason {
    FetchFailed(String),
    ParseFailed(String),
    TooShort { chars: usize },
    DuplicateContent,
    Asset,
}

impl fmt::Display for SkipReason {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SkipReason::FetchFailed(e) => write!(f, "fetch failed: {}", e),
            SkipReason::ParseFailed(e) => write!(f, "parse failed: {}", e),
            SkipReason::TooShort { chars } => write!(f, "too little text ({} chars)", chars),
            SkipReason::DuplicateContent => f.write_str("duplicate content"),
            SkipReason::Asset => f.write_str("non-html asset"),
        }
    }
}

/// A page that was visited but contributed nothing to the aggregate.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageSkip {
    pub url: String,
    pub kind: PageKind,
    pub depth: usize,
    pub reason: SkipReason,
}

/// Everything gathered under one snapshot.
#[derive(Debug, Clone, Default)]
pub struct SnapshotCrawl {
    pub pages: Vec<PageRecord>,
    pub skipped: Vec<PageSkip>,
    pub requests: usize,
}

impl SnapshotCrawl {
    pub fn page_count(&self, kind: PageKind) -> usize {
        self.pages.iter().filter(|p| p.kind == kind).count()
    }

    /// All visible-text chunks in visiting order.
    pub fn chunks(&self) -> impl Iterator<Item = &str> {
        self.pages
            .iter()
            .flat_map(|p| p.chunks.iter().map(String::as_str))
    }
}
