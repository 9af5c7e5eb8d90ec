//! File-backed checkpoint store.
//!
//! Two files per collection, each holding one decimal millisecond epoch:
//! `last_executed` (written when a run starts) and `last_finished` (written
//! only after a run completes without fault). A missing file means the event
//! has never happened.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use sync_core::{CheckpointRecord, FaultClass, Timestamp};
use sync_logging::{sync_info, sync_warn};

use crate::persist::{AtomicFileWriter, PersistError};

const STARTED_FILENAME: &str = "last_executed";
const COMPLETED_FILENAME: &str = "last_finished";

#[derive(Debug, thiserror::Error)]
pub enum CheckpointError {
    #[error("cannot read checkpoint {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("checkpoint {path:?} does not hold a millisecond timestamp: {content:?}")]
    Corrupt { path: PathBuf, content: String },
    #[error("cannot write checkpoint: {0}")]
    Write(#[from] PersistError),
    #[error("refusing to move `completed` back from {current} to {candidate}")]
    NotMonotonic {
        current: Timestamp,
        candidate: Timestamp,
    },
}

impl CheckpointError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            CheckpointError::Read { .. } => FaultClass::IoRead,
            CheckpointError::Corrupt { .. } => FaultClass::MalformedInput,
            CheckpointError::Write(PersistError::Directory { .. }) => FaultClass::CreateDirectory,
            CheckpointError::Write(PersistError::Io { .. }) => FaultClass::IoWrite,
            CheckpointError::NotMonotonic { .. } => FaultClass::Generic,
        }
    }
}

/// What a run needs to know about its own checkpoint window.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RunStart {
    pub started: Timestamp,
    pub prior_completed: Option<Timestamp>,
}

/// Single-writer checkpoint store for one collection.
#[derive(Debug, Clone)]
pub struct CheckpointStore {
    writer: AtomicFileWriter,
}

impl CheckpointStore {
    pub fn new(dir: PathBuf) -> Self {
        Self {
            writer: AtomicFileWriter::new(dir),
        }
    }

    pub fn dir(&self) -> &Path {
        self.writer.dir()
    }

    pub fn load(&self) -> Result<CheckpointRecord, CheckpointError> {
        Ok(CheckpointRecord {
            started: self.read(STARTED_FILENAME)?,
            completed: self.read(COMPLETED_FILENAME)?,
        })
    }

    /// Opens a run: reads the prior `completed` and, unless `record_started`
    /// is false (debug runs), persists this run's `started`.
    pub fn begin_run(&self, record_started: bool) -> Result<RunStart, CheckpointError> {
        let record = self.load()?;
        let now = Timestamp::now();
        let started = record.next_started(now);
        if started != now {
            sync_warn!(
                "clock is behind last completed run ({} < {}); starting at {}",
                now,
                started,
                started
            );
        }
        if record_started {
            self.write(STARTED_FILENAME, started)?;
        }
        sync_info!(
            "checkpoint {:?}: started={} prior_completed={}",
            self.dir(),
            started,
            record
                .completed
                .map_or_else(|| "never".to_string(), |ts| ts.to_string())
        );
        Ok(RunStart {
            started,
            prior_completed: record.completed,
        })
    }

    /// Records a clean run. `completed` only ever moves forward.
    pub fn mark_completed(&self, completed: Timestamp) -> Result<(), CheckpointError> {
        let record = self.load()?;
        if !record.accepts_completed(completed) {
            return Err(CheckpointError::NotMonotonic {
                current: record.completed.unwrap_or(completed),
                candidate: completed,
            });
        }
        self.write(COMPLETED_FILENAME, completed)
    }

    fn read(&self, filename: &str) -> Result<Option<Timestamp>, CheckpointError> {
        let path = self.dir().join(filename);
        let content = match fs::read_to_string(&path) {
            Ok(text) => text,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(None),
            Err(source) => return Err(CheckpointError::Read { path, source }),
        };
        match Timestamp::parse_decimal(&content) {
            Some(ts) => Ok(Some(ts)),
            None => Err(CheckpointError::Corrupt { path, content }),
        }
    }

    fn write(&self, filename: &str, value: Timestamp) -> Result<(), CheckpointError> {
        self.writer
            .write(filename, value.as_millis().to_string().as_bytes())?;
        Ok(())
    }
}
