//! # raft-storage
//!
//! why: provide durable persistence for raft state using standard rust fs apis
//! relations: written by raft-runtime after every node mutation, read back on restart
//! what: Storage trait, FileStorage implementation, InMemoryStorage for testing

use raft_core::{HardState, Log, LogEntry, PersistentState, Snapshot};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use std::fs::{self, File};
use std::io::{self, Read, Write};
use std::path::{Path, PathBuf};

/// trait for durable storage of raft state
///
/// term, vote and log are always written together so a reader never sees a
/// vote from one term next to a log from another
pub trait Storage {
    /// persist term, vote and the retained log
    fn save_state(&mut self, hard_state: &HardState, log: &Log) -> io::Result<()>;

    /// persist the latest snapshot, replacing any older one
    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()>;

    /// load everything written so far (defaults for a fresh node)
    fn load(&self) -> io::Result<PersistentState>;

    /// clear all persisted state (for testing)
    fn clear(&mut self) -> io::Result<()>;
}

/// make a loaded log agree with the snapshot next to it
///
/// a crash between `save_snapshot` and `save_state` leaves a log whose
/// watermark is behind the snapshot; the snapshot wins
pub fn reconcile(mut log: Log, snapshot: Option<&Snapshot>) -> Log {
    let Some(snapshot) = snapshot else {
        return log;
    };
    let index = snapshot.last_included_index;
    if index <= log.last_included_index() {
        return log;
    }

    if index < log.last_index() && log.term_at(index) == Some(snapshot.last_included_term) {
        log.truncate_before(index + 1);
        log.set_watermark(index, snapshot.last_included_term);
    } else {
        log.reset_to_snapshot(index, snapshot.last_included_term);
    }
    log
}

fn invalid_data<E>(e: E) -> io::Error
where
    E: Into<Box<dyn std::error::Error + Send + Sync>>,
{
    io::Error::new(io::ErrorKind::InvalidData, e)
}

// -- file storage implementation --

/// file-based storage implementation using std::fs
///
/// stores raft state in a directory with:
/// - meta.json: term and voted_for
/// - log.json: watermark and retained entries
/// - snapshot.json: latest snapshot
pub struct FileStorage {
    /// directory path for storing state files
    dir: PathBuf,
}

impl FileStorage {
    /// create a new filestorage at the given directory
    /// creates the directory if it doesn't exist
    pub fn new(dir: impl Into<PathBuf>) -> io::Result<Self> {
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
        self.dir.join("log.json")
    }

    fn snapshot_path(&self) -> PathBuf {
        self.dir.join("snapshot.json")
    }

    /// atomic write: write to temp file then rename
    fn write_json<T: Serialize>(&self, path: PathBuf, value: &T) -> io::Result<()> {
        let json = serde_json::to_string_pretty(value).map_err(invalid_data)?;

        let temp_path = path.with_extension("tmp");
        let mut file = File::create(&temp_path)?;
        file.write_all(json.as_bytes())?;
        file.sync_all()?;
        fs::rename(&temp_path, path)?;

        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, path: PathBuf) -> io::Result<Option<T>> {
        if !path.exists() {
            return Ok(None);
        }

        let mut file = File::open(&path)?;
        let mut contents = String::new();
        file.read_to_string(&mut contents)?;

        serde_json::from_str(&contents).map(Some).map_err(invalid_data)
    }
}

/// on-disk log layout, validated through `Log::from_parts` when read
#[derive(Serialize, Deserialize, Default)]
struct LogFile {
    last_included_index: u64,
    last_included_term: u64,
    entries: Vec<LogEntry>,
}

impl Storage for FileStorage {
    fn save_state(&mut self, hard_state: &HardState, log: &Log) -> io::Result<()> {
        let file = LogFile {
            last_included_index: log.last_included_index(),
            last_included_term: log.last_included_term(),
            entries: log.entries().to_vec(),
        };
        // log first: a vote must never be durable ahead of the log it was judged against
        self.write_json(self.log_path(), &file)?;
        self.write_json(self.meta_path(), hard_state)
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.write_json(self.snapshot_path(), snapshot)
    }

    fn load(&self) -> io::Result<PersistentState> {
        let hard_state: HardState = self.read_json(self.meta_path())?.unwrap_or_default();
        let file: LogFile = self.read_json(self.log_path())?.unwrap_or_default();
        let snapshot: Option<Snapshot> = self.read_json(self.snapshot_path())?;

        let log = Log::from_parts(file.entries, file.last_included_index, file.last_included_term)
            .map_err(|e| invalid_data(e.to_string()))?;

        Ok(PersistentState {
            hard_state,
            log: reconcile(log, snapshot.as_ref()),
            snapshot,
        })
    }

    fn clear(&mut self) -> io::Result<()> {
        let _ = fs::remove_file(self.meta_path());
        let _ = fs::remove_file(self.log_path());
        let _ = fs::remove_file(self.snapshot_path());
        Ok(())
    }
}

// -- in-memory storage implementation --

/// in-memory storage for testing
///
/// stores all state in memory, no persistence across restarts
#[derive(Default)]
pub struct InMemoryStorage {
    hard_state: HardState,
    log: Log,
    snapshot: Option<Snapshot>,
}

impl InMemoryStorage {
    /// create a new in-memory storage
    pub fn new() -> Self {
        Self::default()
    }
}

impl Storage for InMemoryStorage {
    fn save_state(&mut self, hard_state: &HardState, log: &Log) -> io::Result<()> {
        self.hard_state = *hard_state;
        self.log = log.clone();
        Ok(())
    }

    fn save_snapshot(&mut self, snapshot: &Snapshot) -> io::Result<()> {
        self.snapshot = Some(snapshot.clone());
        Ok(())
    }

    fn load(&self) -> io::Result<PersistentState> {
        Ok(PersistentState {
            hard_state: self.hard_state,
            log: reconcile(self.log.clone(), self.snapshot.as_ref()),
            snapshot: self.snapshot.clone(),
        })
    }

    fn clear(&mut self) -> io::Result<()> {
        *self = Self::default();
        Ok(())
    }
}
