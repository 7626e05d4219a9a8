use super::{LockMode, PlatformLock, TryLock};
use fs2::FileExt;
use std::fs::File;
use std::io;

/// `flock(2)` locks, which belong to the open file description. Two handles
/// opened separately conflict with each other even inside one process.
#[derive(Debug)]
pub struct UnixLock;

fn is_contention(e: &io::Error) -> bool {
    matches!(e.raw_os_error(), Some(code) if code == libc::EWOULDBLOCK || code == libc::EAGAIN)
        || e.kind() == io::ErrorKind::WouldBlock
}

impl PlatformLock for UnixLock {
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
        loop {
            let result = match mode {
                LockMode::Shared => FileExt::lock_shared(file),
                LockMode::Exclusive => FileExt::lock_exclusive(file),
            };
            match result {
                Err(e) if e.raw_os_error() == Some(libc::EINTR) => continue,
                other => return other,
            }
        }
    }

    fn unlock(file: &File) -> io::Result<()> {
        FileExt::unlock(file)
    }
}
