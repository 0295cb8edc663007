//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-kv's node runtime before it answers any rpc
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use raft_core::{HardState, LogDelta, LogEntry};
use std::fs::{self, File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use thiserror::Error;
use tracing::warn;

/// errors raised while reading or writing persisted state
#[derive(Debug, Error)]
pub enum StorageError {
    #[error("storage i/o failed: {0}")]
    Io(#[from] io::Error),

    #[error("corrupt persisted state: {0}")]
    Codec(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, StorageError>;

/// trait for durable storage of raft state
///
/// this abstraction allows the same node runtime to work with:
/// - real filesystem (restartable nodes)
/// - in-memory (simulated clusters and tests)
pub trait Storage: Send {
    /// persist the current term, vote and commit index
    fn save_hard_state(&mut self, state: &HardState) -> Result<()>;

    /// load the persisted hard state (zeroed for a new node)
    fn load_hard_state(&self) -> Result<HardState>;

    /// append entries to the log
    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()>;

    /// load all log entries (for crash recovery)
    fn load_log(&self) -> Result<Vec<LogEntry>>;

    /// truncate log from given index (for conflict resolution)
    fn truncate_log_from(&mut self, from_index: u64) -> Result<()>;

    /// clear all persisted state
    fn clear(&mut self) -> Result<()>;

    /// flush the log changes a node accumulated since the last call
    fn apply_delta(&mut self, delta: &LogDelta) -> Result<()> {
        if let Some(from_index) = delta.truncate_from {
            self.truncate_log_from(from_index)?;
        }
        self.append_entries(&delta.entries)
    }
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term, voted_for and commit index
/// - log.jsonl: one json log entry per line, appended in index order
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> Result<Self> {
        let dir = dir.into();
        fs::create_dir_all(&dir)?;
        Ok(Self { dir })
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    fn meta_path(&self) -> PathBuf {
        self.dir.join("meta.json")
    }

    fn log_path(&self) -> PathBuf {
        self.dir.join("log.jsonl")
    }

    /// write to a temp file, fsync, then rename over the target
    fn write_atomic(&self, target: &Path, bytes: &[u8]) -> Result<()> {
        let temp_path = target.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(bytes)?;
        file.sync_all()?;
        fs::rename(&temp_path, target)?;
        Ok(())
    }

    fn encode_log(entries: &[LogEntry]) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        for entry in entries {
            serde_json::to_writer(&mut buf, entry)?;
            buf.push(b'\n');
        }
        Ok(buf)
    }
}

impl Storage for FileStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        let json = serde_json::to_vec_pretty(state)?;
        self.write_atomic(&self.meta_path(), &json)
    }

    fn load_hard_state(&self) -> Result<HardState> {
        let path = self.meta_path();
        if !path.exists() {
            return Ok(HardState::default());
        }
        let contents = fs::read(&path)?;
        Ok(serde_json::from_slice(&contents)?)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        if entries.is_empty() {
            return Ok(());
        }
        let mut file = OpenOptions::new().create(true).append(true).open(self.log_path())?;
        file.write_all(&Self::encode_log(entries)?)?;
        file.sync_all()?;
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        let path = self.log_path();
        if !path.exists() {
            return Ok(Vec::new());
        }
        let contents = fs::read_to_string(&path)?;

        // every complete line ends with '\n'; anything after the last one was
        // cut short by a crash mid-append
        let (complete, tail) = match contents.rfind('\n') {
            Some(end) => contents.split_at(end + 1),
            None => ("", contents.as_str()),
        };

        let mut log = Vec::new();
        for line in complete.lines() {
            if line.trim().is_empty() {
                continue;
            }
            log.push(serde_json::from_str(line)?);
        }

        if !tail.trim().is_empty() {
            match serde_json::from_str(tail) {
                Ok(entry) => log.push(entry),
                Err(e) => warn!(
                    path = %path.display(),
                    error = %e,
                    "dropping torn entry at end of log"
                ),
            }
            // rewrite so the next append starts on a fresh line
            self.write_atomic(&path, &Self::encode_log(&log)?)?;
        }
        Ok(log)
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        let mut log = self.load_log()?;
        log.retain(|e| e.index < from_index);
        let bytes = Self::encode_log(&log)?;
        self.write_atomic(&self.log_path(), &bytes)
    }

    fn clear(&mut self) -> Result<()> {
        for path in [self.meta_path(), self.log_path()] {
            match fs::remove_file(path) {
                Ok(()) => {}
                Err(e) if e.kind() == io::ErrorKind::NotFound => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for simulated clusters
///
/// stores all state in memory, no persistence across process restarts
#[derive(Debug, Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Vec<LogEntry>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_hard_state(&mut self, state: &HardState) -> Result<()> {
        self.hard_state = *state;
        Ok(())
    }

    fn load_hard_state(&self) -> Result<HardState> {
        Ok(self.hard_state)
    }

    fn append_entries(&mut self, entries: &[LogEntry]) -> Result<()> {
        self.log.extend(entries.iter().cloned());
        Ok(())
    }

    fn load_log(&self) -> Result<Vec<LogEntry>> {
        Ok(self.log.clone())
    }

    fn truncate_log_from(&mut self, from_index: u64) -> Result<()> {
        self.log.retain(|e| e.index < from_index);
        Ok(())
    }

    fn clear(&mut self) -> Result<()> {
        self.hard_state = HardState::default();
        self.log.clear();
        Ok(())
    }
}
