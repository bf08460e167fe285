//! Per-(office, year) result files.

use crate::error::{HarvestError, Result};
use crate::model::SnapshotResult;
use serde::{Deserialize, Serialize};
use std::collections::{HashMap, HashSet};
use std::fs::{self, File, OpenOptions};
use std::io::{Read, Seek, SeekFrom};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, PoisonError};
use tracing::{debug, warn};

pub const DATA_SOURCE: &str = "wayback_cdx";

/// One output row.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SnapshotRecord {
    pub candidate: String,
    pub state: String,
    pub district: String,
    pub office: String,
    pub year: i32,
    pub party: String,
    pub stage: String,
    pub date: String,
    pub urlkey: String,
    pub snap_url: String,
    pub data_source: String,
    pub n_tags: usize,
    pub n_clean_tags: usize,
    pub text_snap_content: String,
    pub n_char: usize,
    pub n_words: usize,
}

impl From<&SnapshotResult> for SnapshotRecord {
    fn from(result: &SnapshotResult) -> Self {
        let entry = &result.entry;
        Self {
            candidate: entry.candidate.clone(),
            state: entry.state.clone(),
            district: entry.district.clone().unwrap_or_default(),
            office: entry.office.clone(),
            year: entry.year,
            party: entry.party.clone(),
            stage: entry.stage.to_string(),
            date: result.snapshot.timestamp.clone(),
            urlkey: result.snapshot.source_url.clone(),
            snap_url: result.snapshot.archive_url.clone(),
            data_source: DATA_SOURCE.to_string(),
            n_tags: 0,
            n_clean_tags: 0,
            text_snap_content: result.text.clone(),
            n_char: result.n_chars,
            n_words: result.n_words,
        }
    }
}

/// Where completed units are recorded.
pub trait OutputStore: Send + Sync {
    /// Append one result. Returns `false` if the same (urlkey, date) was
    /// already present and nothing was written.
    fn append(&self, result: &SnapshotResult) -> Result<bool>;

    fn records_written(&self) -> usize;
}

struct ResultFile {
    writer: csv::Writer<File>,
    keys: HashSet<(String, String)>,
}

/// CSV files at `{output_dir}/{office}/{year}.csv`.
pub struct CsvOutputStore {
    output_dir: PathBuf,
    files: Mutex<HashMap<PathBuf, ResultFile>>,
    written: AtomicUsize,
}

impl CsvOutputStore {
    pub fn new(output_dir: &Path) -> Self {
        Self {
            output_dir: output_dir.to_path_buf(),
            files: Mutex::new(HashMap::new()),
            written: AtomicUsize::new(0),
        }
    }

    pub fn result_path(&self, office: &str, year: i32) -> PathBuf {
        let office = office.trim().to_ascii_lowercase();
        let office = if office.is_empty() { "unknown".to_string() } else { office };
        self.output_dir.join(office).join(format!("{}.csv", year))
    }

    fn open_result_file(path: &Path) -> Result<ResultFile> {
        if let Some(parent) = path.parent() {
            fs::create_dir_all(parent)?;
        }

        let mut file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(false)
            .open(path)?;
        let mut content = Vec::new();
        file.read_to_end(&mut content)?;

        let scan = scan_result_file(path, &content)?;
        if scan.complete_len < content.len() as u64 {
            warn!(
                "Dropping {} byte(s) of incomplete trailing row from {}",
                content.len() as u64 - scan.complete_len,
                path.display()
            );
            file.set_len(scan.complete_len)?;
            file.sync_data()?;
        }
        file.seek(SeekFrom::End(0))?;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(false)
            .from_writer(file);
        if scan.complete_len == 0 {
            writer.write_record(HEADER)?;
            writer.flush()?;
        }

        debug!("Opened {} ({} existing record(s))", path.display(), scan.keys.len());
        Ok(ResultFile {
            writer,
            keys: scan.keys,
        })
    }
}

const HEADER: [&str; 16] = [
    "candidate",
    "state",
    "district",
    "office",
    "year",
    "party",
    "stage",
    "date",
    "urlkey",
    "snap_url",
    "data_source",
    "n_tags",
    "n_clean_tags",
    "text_snap_content",
    "n_char",
    "n_words",
];

struct FileScan {
    /// (urlkey, date) of every complete row.
    keys: HashSet<(String, String)>,
    /// Byte length of the file up to the end of the last complete row.
    complete_len: u64,
}

/// Offset just past the record terminator(s) at `pos`, if the record that
/// ends there was newline-terminated.
fn terminated_end(content: &[u8], pos: u64) -> Option<u64> {
    let mut end = pos as usize;
    while end < content.len() && matches!(content[end], b'\r' | b'\n') {
        end += 1;
    }
    (end > 0 && content[end - 1] == b'\n').then_some(end as u64)
}

/// Read the existing rows of a result file. A trailing row cut short by a
/// crash (unterminated, wrong field count, or inside an open quote) is not
/// counted and lies beyond `complete_len`.
fn scan_result_file(path: &Path, content: &[u8]) -> Result<FileScan> {
    let mut scan = FileScan {
        keys: HashSet::new(),
        complete_len: 0,
    };
    if content.is_empty() {
        return Ok(scan);
    }

    let mut reader = csv::ReaderBuilder::new()
        .flexible(true)
        .has_headers(false)
        .from_reader(content);
    let mut record = csv::StringRecord::new();

    if !reader.read_record(&mut record)? {
        return Ok(scan);
    }
    let Some(header_end) = terminated_end(content, reader.position().byte()) else {
        // Not even the header made it to disk.
        return Ok(scan);
    };
    let headers = record.clone();
    let urlkey_idx = headers.iter().position(|h| h == "urlkey");
    let date_idx = headers.iter().position(|h| h == "date");
    let (Some(urlkey_idx), Some(date_idx)) = (urlkey_idx, date_idx) else {
        return Err(HarvestError::Storage(format!(
            "{} is not a snapshot result file (missing urlkey/date columns)",
            path.display()
        )));
    };
    scan.complete_len = header_end;

    loop {
        match reader.read_record(&mut record) {
            Ok(false) => break,
            Ok(true) => {
                let Some(end) = terminated_end(content, reader.position().byte()) else {
                    continue;
                };
                if record.len() != headers.len() {
                    warn!(
                        "Skipping row with {} field(s) in {}",
                        record.len(),
                        path.display()
                    );
                    continue;
                }
                if let (Some(urlkey), Some(date)) = (record.get(urlkey_idx), record.get(date_idx)) {
                    scan.keys.insert((urlkey.to_string(), date.to_string()));
                }
                scan.complete_len = end;
            }
            Err(e) => {
                warn!("Skipping unreadable row in {}: {}", path.display(), e);
            }
        }
    }
    Ok(scan)
}

impl OutputStore for CsvOutputStore {
    fn append(&self, result: &SnapshotResult) -> Result<bool> {
        let record = SnapshotRecord::from(result);
        let path = self.result_path(&record.office, record.year);

        let mut files = self.files.lock().unwrap_or_else(PoisonError::into_inner);
        if !files.contains_key(&path) {
            let opened = Self::open_result_file(&path)?;
            files.insert(path.clone(), opened);
        }
        let Some(file) = files.get_mut(&path) else {
            return Err(HarvestError::Storage(format!("{} not open", path.display())));
        };

        let key = (record.urlkey.clone(), record.date.clone());
        if file.keys.contains(&key) {
            debug!("{}@{} already in {}", key.0, key.1, path.display());
            return Ok(false);
        }

        file.writer
            .serialize(&record)
            .map_err(HarvestError::from)
            .and_then(|_| file.writer.flush().map_err(HarvestError::from))
            .and_then(|_| file.writer.get_ref().sync_data().map_err(HarvestError::from))
            .map_err(|e| {
                HarvestError::Storage(format!("could not append to {}: {}", path.display(), e))
            })?;
        file.keys.insert(key);

        self.written.fetch_add(1, Ordering::Relaxed);
        Ok(true)
    }

    fn records_written(&self) -> usize {
        self.written.load(Ordering::Relaxed)
    }
}

/// Read every record back from a result file.
pub fn read_records(path: &Path) -> Result<Vec<SnapshotRecord>> {
    let mut reader = csv::Reader::from_path(path)?;
    let records = reader
        .deserialize::<SnapshotRecord>()
        .collect::<std::result::Result<Vec<_>, _>>()?;
    Ok(records)
}
