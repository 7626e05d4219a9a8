use crate::error::Result;
use crate::lock::config::LockConfig;
use crate::lock::file::LockFile;
use crate::lock::guard::{LockGuard, Lockable};
use crate::lock::identity::LockIdentity;
use crate::lock::strategy::{LockStrategy, Wait};
use crate::platform::LockMode;
use crate::registry::{next_instance_id, Claim, Owner, Registration};
use std::path::Path;
use std::time::Duration;
use tracing::{debug, warn};

/// Exclusive lock on a file, shared with other processes and other threads
/// of this process.
///
/// An instance is `Sync`: put it in an `Arc` and any thread can acquire it.
/// The thread that acquired it is the only one that may release it, and it
/// may acquire it again without blocking (every acquire needs a matching
/// release).
///
/// Threads of one process are serialized through the process-local
/// [`LockRegistry`](crate::LockRegistry) before the OS lock is touched, so two
/// instances for the same path never both hold it, even though each owns its
/// own file handle.
///
/// After the last release the OS lock is dropped but the handle stays open
/// for the next acquire. Dropping the instance closes it. If the process dies
/// while holding the lock, the OS closes the handle and the lock is freed.
/// The lock file itself is never deleted.
#[derive(Debug)]
pub struct InterProcessLock {
    id: u64,
    file: LockFile,
    registration: Registration,
    config: LockConfig,
}

impl InterProcessLock {
    /// Lock backed by `path`, coordinated through the global registry. No file
    /// is opened until the first acquire.
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, LockConfig::default())
    }

    pub fn with_config(path: impl AsRef<Path>, config: LockConfig) -> Result<Self> {
        Ok(Self::from_identity(LockIdentity::new(path)?, config))
    }

    pub fn from_identity(identity: LockIdentity, config: LockConfig) -> Self {
        let registration = config.registry().resolve(&identity);
        Self {
            id: next_instance_id(),
            file: LockFile::new(identity.path()),
            registration,
            config,
        }
    }

    /// Acquire the lock.
    ///
    /// - `blocking = false`: one attempt, `timeout` is ignored.
    /// - `blocking = true, timeout = None`: wait until acquired.
    /// - `blocking = true, timeout = Some(t)`: give up after `t`.
    ///
    /// Returns `false` when the lock could not be had in time. Errors are
    /// reserved for failures to open or lock the file, and for an untimed
    /// wait that could only end in self-deadlock.
    pub fn acquire(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool> {
        self.acquire_with(&LockStrategy::from_flags(blocking, timeout))
    }

    pub fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool> {
        self.acquire_within(strategy.start())
    }

    pub(crate) fn acquire_within(&self, wait: Wait) -> Result<bool> {
        let owner = Owner::current(self.id);
        let coordinator = self.registration.coordinator();

        match coordinator.claim_exclusive(owner, wait, self.path())? {
            Claim::Reentered => return Ok(true),
            Claim::Unavailable => {
                debug!("Lock held in this process: {}", self.path().display());
                return Ok(false);
            }
            Claim::Claimed => {}
        }

        match self.file.lock(LockMode::Exclusive, wait, &self.config) {
            Ok(true) => {
                coordinator.confirm(owner);
                debug!("Lock acquired: {}", self.path().display());
                Ok(true)
            }
            Ok(false) => {
                coordinator.vacate(owner);
                debug!("Lock held by another process: {}", self.path().display());
                Ok(false)
            }
            Err(e) => {
                coordinator.vacate(owner);
                Err(e)
            }
        }
    }

    /// Release one level of the calling thread's hold. Fails with
    /// [`LockError::NotHeld`](crate::LockError::NotHeld) if the calling thread
    /// does not hold the lock through this instance.
    pub fn release(&self) -> Result<()> {
        let owner = Owner::current(self.id);
        let coordinator = self.registration.coordinator();

        if coordinator.leave(owner, self.path())? > 0 {
            return Ok(());
        }

        let unlocked = self.file.unlock();
        coordinator.vacate(owner);
        debug!("Lock released: {}", self.path().display());
        unlocked
    }

    /// Whether this instance is currently held, by any thread. Does not ask
    /// the OS.
    pub fn locked(&self) -> bool {
        self.registration.coordinator().held_by_instance(self.id)
    }

    pub fn held_by_current_thread(&self) -> bool {
        self.registration
            .coordinator()
            .held_by(Owner::current(self.id))
    }

    pub fn path(&self) -> &Path {
        self.registration.identity().path()
    }

    pub fn identity(&self) -> &LockIdentity {
        self.registration.identity()
    }

    /// Block until acquired and return a guard that releases on drop.
    pub fn lock(&self) -> Result<LockGuard<&Self>> {
        LockGuard::acquire(self, &LockStrategy::Wait)
    }

    /// Single attempt; `None` if the lock is held elsewhere.
    pub fn try_lock(&self) -> Result<Option<LockGuard<&Self>>> {
        match LockGuard::acquire(self, &LockStrategy::NoWait) {
            Ok(guard) => Ok(Some(guard)),
            Err(e) if e.is_contention() => Ok(None),
            Err(e) => Err(e),
        }
    }

    pub fn lock_with(&self, strategy: &LockStrategy) -> Result<LockGuard<&Self>> {
        LockGuard::acquire(self, strategy)
    }
}

impl Lockable for InterProcessLock {
    fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool> {
        InterProcessLock::acquire_with(self, strategy)
    }

    fn release(&self) -> Result<()> {
        InterProcessLock::release(self)
    }

    fn lock_path(&self) -> &Path {
        self.path()
    }
}

impl Drop for InterProcessLock {
    fn drop(&mut self) {
        if self.locked() {
            warn!(
                "Lock dropped while held, releasing: {}",
                self.path().display()
            );
            if let Err(e) = self.file.unlock() {
                warn!("{}", e);
            }
            self.registration.coordinator().vacate_instance(self.id);
        }
        self.file.close();
    }
}
