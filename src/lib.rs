//! Cross-platform inter-process file locks
//!
//! [`InterProcessLock`] is an exclusive, per-thread reentrant lock backed by
//! an OS advisory lock on a file. [`InterProcessReaderWriterLock`] adds
//! shared readers with writer preference. Both coordinate the threads of one
//! process through a [`LockRegistry`] so that a lock held by one thread is
//! never handed to another thread of the same process by the OS.
//!
//! The guarantee covers processes that share one local filesystem path. It
//! does not extend to network filesystems or other machines.

pub mod error;
pub mod lock;
pub mod platform;
pub mod registry;

pub use error::{LockError, Result};
pub use lock::{
    with_lock, InterProcessLock, InterProcessReaderWriterLock, LockConfig, LockGuard,
    LockIdentity, LockStrategy, Lockable,
};
pub use registry::{LockRegistry, Registration};
