use crate::error::{LockError, Result};
use crate::lock::strategy::LockStrategy;
use std::fmt;
use std::path::Path;
use tracing::error;

/// Anything with the acquire/release contract of the inter-process locks.
pub trait Lockable {
    /// Returns `false` when the lock could not be taken within `strategy`.
    fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool>;

    fn release(&self) -> Result<()>;

    fn lock_path(&self) -> &Path;
}

impl<T: Lockable + ?Sized> Lockable for &T {
    fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool> {
        (**self).acquire_with(strategy)
    }

    fn release(&self) -> Result<()> {
        (**self).release()
    }

    fn lock_path(&self) -> &Path {
        (**self).lock_path()
    }
}

/// Holds a [`Lockable`] until dropped or explicitly unlocked.
///
/// Prefer [`LockGuard::unlock`] when a failed release matters to the caller;
/// drop can only log it.
#[must_use = "the lock is released as soon as the guard is dropped"]
pub struct LockGuard<L: Lockable> {
    lock: L,
    released: bool,
}

impl<L: Lockable> LockGuard<L> {
    /// Acquire `lock` per `strategy`. Failing to get it in time is an error
    /// here: [`LockError::WouldBlock`] for `NoWait`, [`LockError::Timeout`]
    /// for `Timeout`.
    pub fn acquire(lock: L, strategy: &LockStrategy) -> Result<Self> {
        if lock.acquire_with(strategy)? {
            return Ok(Self {
                lock,
                released: false,
            });
        }

        let path = lock.lock_path().to_path_buf();
        Err(match strategy {
            LockStrategy::Timeout(duration) => LockError::Timeout {
                path,
                duration: *duration,
            },
            LockStrategy::NoWait | LockStrategy::Wait => LockError::WouldBlock(path),
        })
    }

    pub fn path(&self) -> &Path {
        self.lock.lock_path()
    }

    /// Release now and report the outcome.
    pub fn unlock(mut self) -> Result<()> {
        self.released = true;
        self.lock.release()
    }
}

impl<L: Lockable> Drop for LockGuard<L> {
    fn drop(&mut self) {
        if self.released {
            return;
        }
        if let Err(e) = self.lock.release() {
            error!(
                "Failed to release lock {} on scope exit: {}",
                self.lock.lock_path().display(),
                e
            );
        }
    }
}

impl<L: Lockable> fmt::Debug for LockGuard<L> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockGuard")
            .field("path", &self.lock.lock_path())
            .field("released", &self.released)
            .finish()
    }
}

/// Run `f` while holding `lock`.
///
/// Acquisition failures are returned as-is. A failed release is returned when
/// `f` succeeded; when `f` already failed its error wins and the release
/// failure is logged. The lock is also released if `f` panics.
pub fn with_lock<L, T, E, F>(lock: L, strategy: &LockStrategy, f: F) -> std::result::Result<T, E>
where
    L: Lockable,
    E: From<LockError>,
    F: FnOnce() -> std::result::Result<T, E>,
{
    let guard = LockGuard::acquire(lock, strategy)?;
    match f() {
        Ok(value) => {
            guard.unlock()?;
            Ok(value)
        }
        Err(e) => {
            let path = guard.path().to_path_buf();
            if let Err(release_err) = guard.unlock() {
                error!(
                    "Failed to release lock {} after error: {}",
                    path.display(),
                    release_err
                );
            }
            Err(e)
        }
    }
}
