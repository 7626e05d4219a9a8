use crate::error::{LockError, Result};
use crate::lock::config::LockConfig;
use crate::lock::strategy::{Backoff, Wait};
use crate::platform::{LockMode, NativeLock, PlatformLock, TryLock};
use parking_lot::Mutex;
use std::fs::{self, File, OpenOptions};
use std::path::{Path, PathBuf};
use tracing::{debug, warn};

/// Backing file of one lock instance.
///
/// The handle is opened on the first lock attempt and then kept open across
/// lock/unlock cycles. Closing it (on [`LockFile::close`] or drop) releases
/// any OS lock it still carries.
#[derive(Debug)]
pub(crate) struct LockFile {
    path: PathBuf,
    handle: Mutex<Option<File>>,
}

impl LockFile {
    pub(crate) fn new(path: &Path) -> Self {
        Self {
            path: path.to_path_buf(),
            handle: Mutex::new(None),
        }
    }

    fn open(&self, config: &LockConfig) -> Result<File> {
        if config.create_parent_dirs {
            if let Some(parent) = self.path.parent() {
                fs::create_dir_all(parent).map_err(|e| LockError::Path {
                    path: self.path.clone(),
                    source: e,
                })?;
            }
        }

        // Never truncate: the file may be locked by another process.
        let mut opts = OpenOptions::new();
        opts.read(true).write(true).create(true).truncate(false);

        #[cfg(unix)]
        {
            use std::os::unix::fs::OpenOptionsExt;
            opts.custom_flags(libc::O_NOFOLLOW);
        }

        let file = opts.open(&self.path).map_err(|e| LockError::Path {
            path: self.path.clone(),
            source: e,
        })?;
        debug!("Opened lock file: {}", self.path.display());
        Ok(file)
    }

    /// Take the OS lock in `mode`, polling until `wait` runs out.
    pub(crate) fn lock(&self, mode: LockMode, wait: Wait, config: &LockConfig) -> Result<bool> {
        let mut handle = self.handle.lock();
        let file = match handle.take() {
            Some(file) => file,
            None => self.open(config)?,
        };
        let file = handle.insert(file);

        if wait.is_forever() && config.native_wait {
            NativeLock::block_lock(file, mode)
                .map_err(|e| LockError::platform(&self.path, e))?;
            return Ok(true);
        }

        let mut backoff = Backoff::new(config);
        loop {
            match NativeLock::try_lock(file, mode).map_err(|e| LockError::platform(&self.path, e))? {
                TryLock::Acquired => return Ok(true),
                TryLock::WouldBlock => {
                    if !backoff.pause(wait) {
                        return Ok(false);
                    }
                }
            }
        }
    }

    /// Release the OS lock, keeping the handle for the next acquire. If the
    /// unlock call fails the handle is closed, which releases the lock anyway,
    /// and the failure is still reported.
    pub(crate) fn unlock(&self) -> Result<()> {
        let mut handle = self.handle.lock();
        let Some(file) = handle.as_ref() else {
            return Ok(());
        };

        if let Err(e) = NativeLock::unlock(file) {
            warn!(
                "Unlock of {} failed, closing handle to release it: {}",
                self.path.display(),
                e
            );
            *handle = None;
            return Err(LockError::platform(&self.path, e));
        }
        Ok(())
    }

    pub(crate) fn close(&self) {
        if self.handle.lock().take().is_some() {
            debug!("Closed lock file: {}", self.path.display());
        }
    }

    #[cfg(test)]
    pub(crate) fn is_open(&self) -> bool {
        self.handle.lock().is_some()
    }
}
