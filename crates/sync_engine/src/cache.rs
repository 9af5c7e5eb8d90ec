//! Id-keyed on-disk record cache.
//!
//! Layout: `{root}/{collection}/{id}.json`, with sub-collections nested one
//! directory per parent id: `{root}/{collection}/{parent_id}/{id}.json`.
//! Writes are idempotent: writing an id again replaces its file.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use serde::de::DeserializeOwned;
use serde::Serialize;
use sync_core::{FaultClass, TaskFailure, Timestamp};
use sync_logging::sync_debug;

use crate::persist::{ensure_dir, AtomicFileWriter, PersistError};

const ENTRY_EXTENSION: &str = "json";

#[derive(Debug, thiserror::Error)]
pub enum CacheError {
    #[error("cannot create cache directory {path:?}: {message}")]
    CreateDirectory { path: PathBuf, message: String },
    #[error("cannot write cache entry {path:?}: {source}")]
    Write { path: PathBuf, source: io::Error },
    #[error("cannot read cache entry {path:?}: {source}")]
    Read { path: PathBuf, source: io::Error },
    #[error("cannot decode cache entry {path:?}: {source}")]
    Decode {
        path: PathBuf,
        source: serde_json::Error,
    },
    #[error("cannot encode record {id}: {source}")]
    Encode { id: u64, source: serde_json::Error },
    #[error("cannot remove {path:?}: {source}")]
    Remove { path: PathBuf, source: io::Error },
}

impl CacheError {
    pub fn fault_class(&self) -> FaultClass {
        match self {
            CacheError::CreateDirectory { .. } => FaultClass::CreateDirectory,
            CacheError::Write { .. } | CacheError::Remove { .. } => FaultClass::IoWrite,
            CacheError::Read { .. } => FaultClass::IoRead,
            CacheError::Decode { .. } => FaultClass::MalformedInput,
            CacheError::Encode { .. } => FaultClass::Generic,
        }
    }
}

impl From<PersistError> for CacheError {
    fn from(err: PersistError) -> Self {
        match err {
            PersistError::Directory { path, message } => {
                CacheError::CreateDirectory { path, message }
            }
            PersistError::Io { path, source } => CacheError::Write { path, source },
        }
    }
}

impl From<CacheError> for TaskFailure {
    fn from(err: CacheError) -> Self {
        TaskFailure::new(err.fault_class(), err.to_string())
    }
}

/// One cached record.
#[derive(Debug, Clone, PartialEq)]
pub struct CacheEntry<T> {
    pub id: u64,
    pub payload: T,
    pub path: PathBuf,
}

/// Cache directory of one collection. Cheap to clone; clones share the directory.
#[derive(Debug, Clone)]
pub struct CacheStore {
    writer: AtomicFileWriter,
}

impl CacheStore {
    /// Cache for `collection` under `root`. Does not touch the filesystem.
    pub fn new(root: &Path, collection: &str) -> Self {
        Self::at(root.join(collection))
    }

    pub fn at(dir: PathBuf) -> Self {
        Self {
            writer: AtomicFileWriter::new(dir),
        }
    }

    /// Nested cache for the sub-collection of one parent record.
    pub fn child(&self, parent_id: u64) -> Self {
        Self::at(self.dir().join(parent_id.to_string()))
    }

    pub fn dir(&self) -> &Path {
        self.writer.dir()
    }

    /// Create the directory if missing and check it is writable.
    pub fn ensure(&self) -> Result<(), CacheError> {
        ensure_dir(self.dir()).map_err(CacheError::from)
    }

    pub fn entry_path(&self, id: u64) -> PathBuf {
        self.dir().join(entry_filename(id))
    }

    pub fn write<T: Serialize>(&self, id: u64, payload: &T) -> Result<PathBuf, CacheError> {
        let bytes =
            serde_json::to_vec(payload).map_err(|source| CacheError::Encode { id, source })?;
        Ok(self.writer.write(&entry_filename(id), &bytes)?)
    }

    pub fn read<T: DeserializeOwned>(&self, id: u64) -> Result<Option<T>, CacheError> {
        let path = self.entry_path(id);
        match fs::read(&path) {
            Ok(bytes) => decode(&path, &bytes).map(Some),
            Err(err) if err.kind() == io::ErrorKind::NotFound => Ok(None),
            Err(source) => Err(CacheError::Read { path, source }),
        }
    }

    /// Ids of every entry, ascending. A missing directory has no entries.
    pub fn ids(&self) -> Result<Vec<u64>, CacheError> {
        let mut ids: Vec<u64> = self.entry_files()?.into_iter().map(|(id, _)| id).collect();
        ids.sort_unstable();
        Ok(ids)
    }

    pub fn is_empty(&self) -> Result<bool, CacheError> {
        Ok(self.entry_files()?.is_empty())
    }

    /// Load every entry, ascending by id.
    pub fn read_all<T: DeserializeOwned>(&self) -> Result<Vec<CacheEntry<T>>, CacheError> {
        let mut files = self.entry_files()?;
        files.sort_unstable_by_key(|(id, _)| *id);
        files
            .into_iter()
            .map(|(id, path)| {
                let bytes = fs::read(&path).map_err(|source| CacheError::Read {
                    path: path.clone(),
                    source,
                })?;
                let payload = decode(&path, &bytes)?;
                Ok(CacheEntry { id, payload, path })
            })
            .collect()
    }

    /// Delete the whole collection directory, nested sub-collections included.
    /// Returns the number of top-level entries removed.
    pub fn remove_all(&self) -> Result<usize, CacheError> {
        let removed = self.entry_files()?.len();
        match fs::remove_dir_all(self.dir()) {
            Ok(()) => {}
            Err(err) if err.kind() == io::ErrorKind::NotFound => {}
            Err(source) => {
                return Err(CacheError::Remove {
                    path: self.dir().to_path_buf(),
                    source,
                })
            }
        }
        sync_debug!("removed cache directory {:?} ({} entries)", self.dir(), removed);
        Ok(removed)
    }

    /// Delete entries whose file was modified strictly after `since`, recursing
    /// into nested sub-collections. Returns the number of files removed.
    ///
    /// Modification times are truncated to whole milliseconds first, so a file
    /// written in the same millisecond as `since` counts as older.
    pub fn remove_modified_after(&self, since: Timestamp) -> Result<usize, CacheError> {
        remove_newer_in(self.dir(), since)
    }

    fn entry_files(&self) -> Result<Vec<(u64, PathBuf)>, CacheError> {
        let dir = self.dir();
        let read_dir = match fs::read_dir(dir) {
            Ok(read_dir) => read_dir,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(source) => {
                return Err(CacheError::Read {
                    path: dir.to_path_buf(),
                    source,
                })
            }
        };
        let mut files = Vec::new();
        for entry in read_dir {
            let entry = entry.map_err(|source| CacheError::Read {
                path: dir.to_path_buf(),
                source,
            })?;
            let path = entry.path();
            if !entry.file_type().map(|ft| ft.is_file()).unwrap_or(false) {
                continue;
            }
            if let Some(id) = entry_id(&path) {
                files.push((id, path));
            }
        }
        Ok(files)
    }
}

fn entry_filename(id: u64) -> String {
    format!("{id}.{ENTRY_EXTENSION}")
}

fn entry_id(path: &Path) -> Option<u64> {
    if path.extension().and_then(|ext| ext.to_str()) != Some(ENTRY_EXTENSION) {
        return None;
    }
    path.file_stem()?.to_str()?.parse().ok()
}

fn decode<T: DeserializeOwned>(path: &Path, bytes: &[u8]) -> Result<T, CacheError> {
    serde_json::from_slice(bytes).map_err(|source| CacheError::Decode {
        path: path.to_path_buf(),
        source,
    })
}

fn remove_newer_in(dir: &Path, since: Timestamp) -> Result<usize, CacheError> {
    let read_dir = match fs::read_dir(dir) {
        Ok(read_dir) => read_dir,
        Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(source) => {
            return Err(CacheError::Read {
                path: dir.to_path_buf(),
                source,
            })
        }
    };

    let mut removed = 0;
    for entry in read_dir {
        let entry = entry.map_err(|source| CacheError::Read {
            path: dir.to_path_buf(),
            source,
        })?;
        let path = entry.path();
        let meta = entry.metadata().map_err(|source| CacheError::Read {
            path: path.clone(),
            source,
        })?;
        if meta.is_dir() {
            removed += remove_newer_in(&path, since)?;
            continue;
        }
        let modified = meta.modified().map_err(|source| CacheError::Read {
            path: path.clone(),
            source,
        })?;
        if Timestamp::from_system_time(modified) > since {
            match fs::remove_file(&path) {
                Ok(()) => removed += 1,
                Err(err) if err.kind() == io::ErrorKind::NotFound => {}
                Err(source) => return Err(CacheError::Remove { path, source }),
            }
        }
    }
    Ok(removed)
}
