use super::{LockMode, PlatformLock, TryLock};
use fs2::FileExt;
use std::fs::File;
use std::io;

// ERROR_SHARING_VIOLATION
const SHARING_VIOLATION: i32 = 32;
// ERROR_LOCK_VIOLATION
const LOCK_VIOLATION: i32 = 33;

/// `LockFileEx` over the whole file. Region locks are mandatory and tied to
/// the handle that took them.
#[derive(Debug)]
pub struct WindowsLock;

fn is_contention(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(SHARING_VIOLATION) | Some(LOCK_VIOLATION))
        || e.kind() == io::ErrorKind::WouldBlock
}

impl PlatformLock for WindowsLock {
    fn try_lock(file: &File, mode: LockMode) -> io::Result<TryLock> {
        let result = match mode {
            LockMode::Shared => FileExt::try_lock_shared(file),
            LockMode::Exclusive => FileExt::try_lock_exclusive(file),
        };
        match result {
            Ok(()) => Ok(TryLock::Acquired),
            Err(e) if is_contention(&e) => Ok(TryLock::WouldBlock),
            Err(e) => Err(e),
        }
    }

    fn block_lock(file: &File, mode: LockMode) -> io::Result<()> {
        match mode {
            LockMode::Shared => FileExt::lock_shared(file),
            LockMode::Exclusive => FileExt::lock_exclusive(file),
        }
    }

    fn unlock(file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}
