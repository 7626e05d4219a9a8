use crate::error::{LockError, Result};
use directories::ProjectDirs;
use sha2::{Digest, Sha256};
use std::env;
use std::fmt;
use std::fs;
use std::path::{Path, PathBuf};

/// Canonical absolute path of a lock file.
///
/// Two identities compare equal iff their paths canonicalize to the same
/// location, so `./a.lock`, `/tmp/x/a.lock` and a symlink pointing at it all
/// share one identity and one registry entry.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct LockIdentity {
    path: PathBuf,
}

impl LockIdentity {
    /// Resolve `path` to its canonical form. The file does not need to exist.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        let path = path.as_ref();

        if let Ok(canonical) = path.canonicalize() {
            return Ok(Self { path: canonical });
        }

        let absolute = if path.is_absolute() {
            path.to_path_buf()
        } else {
            env::current_dir()
                .map_err(|e| LockError::Path {
                    path: path.to_path_buf(),
                    source: e,
                })?
                .join(path)
        };

        let filename = absolute
            .file_name()
            .ok_or_else(|| LockError::InvalidPath(path.to_path_buf()))?;

        // Missing file: resolve the directory it would live in. A missing
        // directory is left as-is and reported when the file is opened.
        let resolved = match absolute.parent().map(Path::canonicalize) {
            Some(Ok(parent)) => parent.join(filename),
            _ => absolute.clone(),
        };

        Ok(Self { path: resolved })
    }

    /// Lock file for an arbitrary resource, placed in the per-user cache
    /// directory instead of next to the resource.
    ///
    /// The name is `{parent}.{file}.{hash}.lock` where `hash` is a prefix of
    /// the SHA-256 of the resource's canonical path.
    pub fn for_resource(resource: impl AsRef<Path>) -> Result<Self> {
        let resource = Self::new(resource)?;
        let canonical = resource.path();

        let filename = canonical
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .ok_or_else(|| LockError::InvalidPath(canonical.to_path_buf()))?;

        let parent_name = canonical
            .parent()
            .and_then(|p| p.file_name())
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "root".to_string());

        let mut hasher = Sha256::new();
        hasher.update(canonical.to_string_lossy().as_bytes());
        let hash = format!("{:x}", hasher.finalize());

        let lock_filename = format!("{}.{}.{}.lock", parent_name, filename, &hash[..12]);

        Ok(Self {
            path: lock_cache_dir()?.join(lock_filename),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Sibling identity with `suffix` appended to the file name.
    pub(crate) fn sibling(&self, suffix: &str) -> Self {
        let mut name = self
            .path
            .file_name()
            .map(|n| n.to_os_string())
            .unwrap_or_default();
        name.push(suffix);
        Self {
            path: self.path.with_file_name(name),
        }
    }
}

impl fmt::Display for LockIdentity {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.path.display())
    }
}

impl AsRef<Path> for LockIdentity {
    fn as_ref(&self) -> &Path {
        &self.path
    }
}

/// Platform cache directory for derived lock files, created on demand.
pub fn lock_cache_dir() -> Result<PathBuf> {
    let proj_dirs = ProjectDirs::from("", "", "interlock").ok_or(LockError::NoCacheDirectory)?;

    let cache_dir = proj_dirs.cache_dir().join("locks");

    if !cache_dir.exists() {
        fs::create_dir_all(&cache_dir).map_err(|e| LockError::CacheDirectory {
            path: cache_dir.clone(),
            source: e,
        })?;
    }

    Ok(cache_dir)
}
