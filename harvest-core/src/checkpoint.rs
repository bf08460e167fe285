//! Durable record of completed crawl units.

use crate::config::CheckpointBackend;
use crate::error::{HarvestError, Result};
use crate::model::UnitKey;
use rusqlite::{Connection, params};
use std::collections::HashSet;
use std::fs::{self, File, OpenOptions};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::{SystemTime, UNIX_EPOCH};
use tracing::{debug, info, warn};

/// Append-only set of completed unit keys. Implementations load all prior
/// state when opened and must tolerate concurrent `mark_done` calls.
pub trait CheckpointStore: Send + Sync {
    fn is_done(&self, key: &UnitKey) -> bool;

    /// Record a unit as complete. Marking an existing key is a no-op.
    fn mark_done(&self, key: &UnitKey) -> Result<()>;

    fn len(&self) -> usize;

    fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn location(&self) -> String;
}

pub fn checkpoint_log_path(progress_dir: &Path, scope: &str) -> PathBuf {
    progress_dir.join(format!("progress_{}.log", scope))
}

pub fn checkpoint_db_path(progress_dir: &Path) -> PathBuf {
    progress_dir.join("progress.db")
}

/// Open the configured backend for one roster scope.
pub fn open_checkpoint_store(
    backend: CheckpointBackend,
    progress_dir: &Path,
    scope: &str,
) -> Result<Arc<dyn CheckpointStore>> {
    let store: Arc<dyn CheckpointStore> = match backend {
        CheckpointBackend::File => Arc::new(FileCheckpointStore::open(&checkpoint_log_path(
            progress_dir,
            scope,
        ))?),
        CheckpointBackend::Sqlite => Arc::new(SqliteCheckpointStore::open(
            &checkpoint_db_path(progress_dir),
            scope,
        )?),
    };
    info!(
        "Checkpoint store {} holds {} completed unit(s)",
        store.location(),
        store.len()
    );
    Ok(store)
}

struct LogState {
    done: HashSet<UnitKey>,
    file: File,
}

/// One `source_url<TAB>timestamp` line per completed unit.
pub struct FileCheckpointStore {
    path: PathBuf,
    state: Mutex<LogState>,
}

impl FileCheckpointStore {
    pub fn open(path: &Path) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let mut done = HashSet::new();
        let mut torn = false;
        if path.exists() {
            let content = fs::read_to_string(path)?;
            let mut lines: Vec<&str> = content.split('\n').collect();
            // Whatever follows the last newline was never fully written.
            if let Some(tail) = lines.pop()
                && !tail.is_empty()
            {
                warn!("Ignoring incomplete checkpoint line in {}: {:?}", path.display(), tail);
                torn = true;
            }
            for (idx, line) in lines.iter().enumerate() {
                if line.trim().is_empty() {
                    continue;
                }
                match UnitKey::from_line(line) {
                    Some(key) => {
                        done.insert(key);
                    }
                    None => warn!("Malformed checkpoint line {} in {}", idx + 1, path.display()),
                }
            }
        }

        let mut file = OpenOptions::new().create(true).append(true).open(path)?;
        if torn {
            file.write_all(b"\n")?;
            file.sync_data()?;
        }

        debug!("Loaded {} checkpoint(s) from {}", done.len(), path.display());
        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(LogState { done, file }),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl CheckpointStore for FileCheckpointStore {
    fn is_done(&self, key: &UnitKey) -> bool {
        let state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        state.done.contains(key)
    }

    fn mark_done(&self, key: &UnitKey) -> Result<()> {
        let mut state = self.state.lock().unwrap_or_else(PoisonError::into_inner);
        if state.done.contains(key) {
            return Ok(());
        }
        let line = format!("{}\n", key.to_line());
        state
            .file
            .write_all(line.as_bytes())
            .and_then(|_| state.file.sync_data())
            .map_err(|e| {
                HarvestError::Storage(format!(
                    "could not append checkpoint to {}: {}",
                    self.path.display(),
                    e
                ))
            })?;
        state.done.insert(key.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .done
            .len()
    }

    fn location(&self) -> String {
        self.path.display().to_string()
    }
}

fn current_timestamp() -> i64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs() as i64)
        .unwrap_or(0)
}

/// Checkpoints in an embedded database shared by all rosters; each roster
/// sees only its own scope.
pub struct SqliteCheckpointStore {
    path: PathBuf,
    scope: String,
    conn: Mutex<Connection>,
    done: Mutex<HashSet<UnitKey>>,
}

impl SqliteCheckpointStore {
    pub fn open(path: &Path, scope: &str) -> Result<Self> {
        if let Some(parent) = path.parent()
            && !parent.as_os_str().is_empty()
        {
            fs::create_dir_all(parent)?;
        }

        let conn = Connection::open(path)?;
        conn.execute_batch(
            "
            PRAGMA journal_mode = WAL;
            PRAGMA synchronous = NORMAL;
            PRAGMA temp_store = MEMORY;

            CREATE TABLE IF NOT EXISTS checkpoints (
                scope TEXT NOT NULL,
                source_url TEXT NOT NULL,
                timestamp TEXT NOT NULL,
                completed_at INTEGER NOT NULL,
                PRIMARY KEY (scope, source_url, timestamp)
            );
            ",
        )?;

        let done = {
            let mut stmt =
                conn.prepare("SELECT source_url, timestamp FROM checkpoints WHERE scope = ?1")?;
            let rows = stmt.query_map([scope], |row| {
                Ok(UnitKey::new(row.get::<_, String>(0)?, row.get::<_, String>(1)?))
            })?;
            rows.collect::<rusqlite::Result<HashSet<_>>>()?
        };

        debug!(
            "Loaded {} checkpoint(s) for scope {} from {}",
            done.len(),
            scope,
            path.display()
        );
        Ok(Self {
            path: path.to_path_buf(),
            scope: scope.to_string(),
            conn: Mutex::new(conn),
            done: Mutex::new(done),
        })
    }

    pub fn scope(&self) -> &str {
        &self.scope
    }
}

impl CheckpointStore for SqliteCheckpointStore {
    fn is_done(&self, key: &UnitKey) -> bool {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .contains(key)
    }

    fn mark_done(&self, key: &UnitKey) -> Result<()> {
        let conn = self.conn.lock().unwrap_or_else(PoisonError::into_inner);
        conn.execute(
            "INSERT OR IGNORE INTO checkpoints (scope, source_url, timestamp, completed_at)
             VALUES (?1, ?2, ?3, ?4)",
            params![self.scope, key.source_url, key.timestamp, current_timestamp()],
        )
        .map_err(|e| {
            HarvestError::Storage(format!(
                "could not record checkpoint in {}: {}",
                self.path.display(),
                e
            ))
        })?;
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .insert(key.clone());
        Ok(())
    }

    fn len(&self) -> usize {
        self.done
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    fn location(&self) -> String {
        format!("{} [{}]", self.path.display(), self.scope)
    }
}
