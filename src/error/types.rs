use std::io;
use std::path::{Path, PathBuf};
use std::time::Duration;
use thiserror::Error;

#[derive(Debug, Error)]
pub enum LockError {
    #[error("Failed to acquire lock on {0}: held by another owner")]
    WouldBlock(PathBuf),

    #[error("Failed to acquire lock on {path}: timeout after {duration:?}")]
    Timeout { path: PathBuf, duration: Duration },

    #[error("Cannot release lock on {path}: not held by the calling thread")]
    NotHeld { path: PathBuf },

    #[error("Failed to open lock file {path}: {source}")]
    Path { path: PathBuf, source: io::Error },

    #[error("Lock operation on {path} failed: {source}")]
    Platform { path: PathBuf, source: io::Error },

    #[error("Acquiring {path} would deadlock: the calling thread already holds it through another handle")]
    WouldDeadlock { path: PathBuf },

    #[error("Invalid lock path: {0}")]
    InvalidPath(PathBuf),

    #[error("Failed to prepare lock directory {path}: {source}")]
    CacheDirectory { path: PathBuf, source: io::Error },

    #[error("Failed to determine the lock cache directory")]
    NoCacheDirectory,
}

impl LockError {
    /// True for the errors that only describe contention (the lock exists and
    /// someone else has it).
    pub fn is_contention(&self) -> bool {
        matches!(self, LockError::WouldBlock(_) | LockError::Timeout { .. })
    }

    /// Raw OS error code of an underlying I/O failure, if any.
    pub fn os_code(&self) -> Option<i32> {
        match self {
            LockError::Path { source, .. }
            | LockError::Platform { source, .. }
            | LockError::CacheDirectory { source, .. } => source.raw_os_error(),
            _ => None,
        }
    }

    /// The lock path the error refers to.
    pub fn path(&self) -> Option<&Path> {
        match self {
            LockError::WouldBlock(path) | LockError::InvalidPath(path) => Some(path),
            LockError::Timeout { path, .. }
            | LockError::NotHeld { path }
            | LockError::Path { path, .. }
            | LockError::Platform { path, .. }
            | LockError::WouldDeadlock { path }
            | LockError::CacheDirectory { path, .. } => Some(path),
            LockError::NoCacheDirectory => None,
        }
    }

    pub(crate) fn not_held(path: &Path) -> Self {
        LockError::NotHeld {
            path: path.to_path_buf(),
        }
    }

    pub(crate) fn platform(path: &Path, source: io::Error) -> Self {
        LockError::Platform {
            path: path.to_path_buf(),
            source,
        }
    }
}

pub type Result<T> = std::result::Result<T, LockError>;
