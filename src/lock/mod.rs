mod config;
mod file;
mod guard;
mod identity;
mod process;
mod rw;
pub(crate) mod strategy;

pub use config::LockConfig;
pub use guard::{with_lock, LockGuard, Lockable};
pub use identity::{lock_cache_dir, LockIdentity};
pub use process::InterProcessLock;
pub use rw::{InterProcessReaderWriterLock, ReadLock, WriteLock};
pub use strategy::LockStrategy;
