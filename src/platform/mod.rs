//! Per-OS translation of "lock this open file" into the native advisory
//! locking call.
//!
//! Locks are bound to the open handle: closing the file releases whatever
//! lock it carried, even when [`PlatformLock::unlock`] was never called. The
//! engine relies on that for its drop path and for crash recovery (a dead
//! process has all its handles closed by the OS).
//!
//! The OS layer is never asked to handle reentrancy. Depending on the
//! platform, locking an already-locked handle again is either a no-op or a
//! conversion, so depth is tracked above this layer.

use std::fs::File;
use std::io;

#[cfg(unix)]
mod unix;
#[cfg(windows)]
mod windows;

#[cfg(unix)]
pub use unix::UnixLock as NativeLock;
#[cfg(windows)]
pub use windows::WindowsLock as NativeLock;

/// Whole-file lock flavour.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LockMode {
    Shared,
    Exclusive,
}

/// Outcome of a single non-blocking attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TryLock {
    Acquired,
    WouldBlock,
}

pub trait PlatformLock {
    /// Single attempt. Contention is reported as [`TryLock::WouldBlock`];
    /// any other failure is returned with its OS error code intact.
    fn try_lock(file: &File, mode: LockMode) -> io::Result<TryLock>;

    /// Block in the kernel until the lock is granted.
    fn block_lock(file: &File, mode: LockMode) -> io::Result<()>;

    fn unlock(file: &File) -> io::Result<()>;
}
