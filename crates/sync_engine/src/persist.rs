use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use tempfile::NamedTempFile;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum PersistError {
    #[error("directory {path:?} missing or not writable: {message}")]
    Directory { path: PathBuf, message: String },
    #[error("io error writing {path:?}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Ensure a directory exists and is writable; create it if missing.
pub fn ensure_dir(dir: &Path) -> Result<(), PersistError> {
    let directory_error = |message: String| PersistError::Directory {
        path: dir.to_path_buf(),
        message,
    };
    if dir.exists() {
        let meta = fs::metadata(dir).map_err(|e| directory_error(e.to_string()))?;
        if !meta.is_dir() {
            return Err(directory_error("path is not a directory".into()));
        }
    } else {
        fs::create_dir_all(dir).map_err(|e| directory_error(e.to_string()))?;
    }
    // Basic writability check: try creating a temp file.
    NamedTempFile::new_in(dir).map_err(|e| directory_error(e.to_string()))?;
    Ok(())
}

/// Atomically write content to `{dir}/{filename}` by writing a temp file then renaming.
///
/// Readers never observe a partially written file; a crash mid-write leaves
/// at most an orphaned temp file, which the temp guard removes on drop.
#[derive(Debug, Clone)]
pub struct AtomicFileWriter {
    dir: PathBuf,
}

impl AtomicFileWriter {
    pub fn new(dir: PathBuf) -> Self {
        Self { dir }
    }

    pub fn dir(&self) -> &Path {
        &self.dir
    }

    pub fn write(&self, filename: &str, content: &[u8]) -> Result<PathBuf, PersistError> {
        let target = self.dir.join(filename);
        let io_error = |source: io::Error| PersistError::Io {
            path: target.clone(),
            source,
        };

        if !self.dir.is_dir() {
            fs::create_dir_all(&self.dir).map_err(|e| PersistError::Directory {
                path: self.dir.clone(),
                message: e.to_string(),
            })?;
        }

        let mut tmp = NamedTempFile::new_in(&self.dir).map_err(io_error)?;
        tmp.write_all(content).map_err(io_error)?;
        tmp.flush().map_err(io_error)?;
        tmp.as_file_mut().sync_all().map_err(io_error)?;

        // `persist` replaces an existing target in one rename.
        tmp.persist(&target).map_err(|e| io_error(e.error))?;
        Ok(target)
    }
}
