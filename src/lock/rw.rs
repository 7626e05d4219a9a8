use crate::error::{LockError, Result};
use crate::lock::config::LockConfig;
use crate::lock::file::LockFile;
use crate::lock::guard::{LockGuard, Lockable};
use crate::lock::identity::LockIdentity;
use crate::lock::process::InterProcessLock;
use crate::lock::strategy::{LockStrategy, Wait};
use crate::platform::LockMode;
use crate::registry::{next_instance_id, Claim, Owner, Registration};
use parking_lot::Mutex;
use std::collections::HashMap;
use std::path::Path;
use std::thread::{self, ThreadId};
use std::time::Duration;
use tracing::{debug, warn};

const GATE_SUFFIX: &str = ".gate";

/// Shared-read / exclusive-write lock across processes.
///
/// Two files are involved. The data file carries a shared OS lock per
/// reading instance or an exclusive one for the writer. The gate file
/// (`<data>.gate`) is an [`InterProcessLock`] that writers hold for their
/// whole write and readers take only while entering.
///
/// This makes the lock writer-preferring: once a writer is waiting it owns
/// the gate, so new readers, in this process or any other, queue behind it
/// while current readers drain. A thread that already reads through this
/// instance can nest further reads without touching the gate.
///
/// Upgrading (read, then write on the same thread) and downgrading are not
/// supported. An untimed attempt fails with
/// [`LockError::WouldDeadlock`]; a timed one returns `false`.
#[derive(Debug)]
pub struct InterProcessReaderWriterLock {
    id: u64,
    data: LockFile,
    registration: Registration,
    gate: InterProcessLock,
    readers: Mutex<HashMap<ThreadId, usize>>,
    config: LockConfig,
}

impl InterProcessReaderWriterLock {
    pub fn new(path: impl AsRef<Path>) -> Result<Self> {
        Self::with_config(path, LockConfig::default())
    }

    pub fn with_config(path: impl AsRef<Path>, config: LockConfig) -> Result<Self> {
        let identity = LockIdentity::new(path)?;
        let gate = InterProcessLock::from_identity(identity.sibling(GATE_SUFFIX), config.clone());
        let registration = config.registry().resolve(&identity);
        Ok(Self {
            id: next_instance_id(),
            data: LockFile::new(identity.path()),
            registration,
            gate,
            readers: Mutex::new(HashMap::new()),
            config,
        })
    }

    pub fn acquire_read(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool> {
        self.acquire_read_with(&LockStrategy::from_flags(blocking, timeout))
    }

    pub fn acquire_read_with(&self, strategy: &LockStrategy) -> Result<bool> {
        let me = thread::current().id();
        if let Some(depth) = self.readers.lock().get_mut(&me) {
            *depth += 1;
            return Ok(true);
        }

        let wait = strategy.start();
        if wait.is_forever() && self.write_held_by_current_thread() {
            return Err(LockError::WouldDeadlock {
                path: self.path().to_path_buf(),
            });
        }

        if !self.gate.acquire_within(wait)? {
            return Ok(false);
        }

        let entered = self.enter_shared(me, wait);
        let gate_released = self.gate.release();

        match (entered, gate_released) {
            (Ok(acquired), Ok(())) => {
                if acquired {
                    debug!("Read lock acquired: {}", self.path().display());
                }
                Ok(acquired)
            }
            (Err(e), _) => Err(e),
            (Ok(acquired), Err(e)) => {
                if acquired {
                    self.release_read()?;
                }
                Err(e)
            }
        }
    }

    /// Register `me` as a reader, taking the shared OS lock if this instance
    /// has no readers yet. Runs with the gate held.
    fn enter_shared(&self, me: ThreadId, wait: Wait) -> Result<bool> {
        let coordinator = self.registration.coordinator();
        if !coordinator.claim_shared(me, wait, self.path())? {
            return Ok(false);
        }

        let mut readers = self.readers.lock();
        if readers.is_empty() {
            match self.data.lock(LockMode::Shared, wait, &self.config) {
                Ok(true) => {}
                Ok(false) => {
                    coordinator.leave_shared(me);
                    return Ok(false);
                }
                Err(e) => {
                    coordinator.leave_shared(me);
                    return Err(e);
                }
            }
        }
        readers.insert(me, 1);
        Ok(true)
    }

    pub fn release_read(&self) -> Result<()> {
        let me = thread::current().id();
        let mut readers = self.readers.lock();

        let Some(depth) = readers.get_mut(&me) else {
            return Err(LockError::not_held(self.path()));
        };
        *depth -= 1;
        if *depth > 0 {
            return Ok(());
        }
        readers.remove(&me);

        let unlocked = if readers.is_empty() {
            self.data.unlock()
        } else {
            Ok(())
        };
        self.registration.coordinator().leave_shared(me);
        debug!("Read lock released: {}", self.path().display());
        unlocked
    }

    pub fn acquire_write(&self, blocking: bool, timeout: Option<Duration>) -> Result<bool> {
        self.acquire_write_with(&LockStrategy::from_flags(blocking, timeout))
    }

    pub fn acquire_write_with(&self, strategy: &LockStrategy) -> Result<bool> {
        let owner = Owner::current(self.id);
        let coordinator = self.registration.coordinator();
        if coordinator.reenter(owner) {
            return Ok(true);
        }

        let wait = strategy.start();
        if wait.is_forever() && self.readers.lock().contains_key(&thread::current().id()) {
            return Err(LockError::WouldDeadlock {
                path: self.path().to_path_buf(),
            });
        }

        if !self.gate.acquire_within(wait)? {
            return Ok(false);
        }

        let acquired = match coordinator.claim_exclusive(owner, wait, self.path()) {
            Ok(Claim::Claimed) => match self.data.lock(LockMode::Exclusive, wait, &self.config) {
                Ok(true) => {
                    coordinator.confirm(owner);
                    Ok(true)
                }
                Ok(false) => {
                    coordinator.vacate(owner);
                    Ok(false)
                }
                Err(e) => {
                    coordinator.vacate(owner);
                    Err(e)
                }
            },
            Ok(Claim::Reentered) | Ok(Claim::Unavailable) => Ok(false),
            Err(e) => Err(e),
        };

        match acquired {
            Ok(true) => {
                debug!("Write lock acquired: {}", self.path().display());
                Ok(true)
            }
            other => {
                if let Err(e) = self.gate.release() {
                    if other.is_ok() {
                        return Err(e);
                    }
                    warn!(
                        "Failed to release gate {} after failed write lock: {}",
                        self.gate_path().display(),
                        e
                    );
                }
                other
            }
        }
    }

    pub fn release_write(&self) -> Result<()> {
        let owner = Owner::current(self.id);
        let coordinator = self.registration.coordinator();

        if coordinator.leave(owner, self.path())? > 0 {
            return Ok(());
        }

        let unlocked = self.data.unlock();
        coordinator.vacate(owner);
        let gate_released = self.gate.release();
        debug!("Write lock released: {}", self.path().display());
        unlocked.and(gate_released)
    }

    /// Whether any thread reads through this instance.
    pub fn read_locked(&self) -> bool {
        !self.readers.lock().is_empty()
    }

    /// Whether this instance is write-held, by any thread.
    pub fn write_locked(&self) -> bool {
        self.registration.coordinator().held_by_instance(self.id)
    }

    fn write_held_by_current_thread(&self) -> bool {
        self.registration
            .coordinator()
            .held_by(Owner::current(self.id))
    }

    pub fn path(&self) -> &Path {
        self.registration.identity().path()
    }

    pub fn gate_path(&self) -> &Path {
        self.gate.path()
    }

    /// Read side as a [`Lockable`].
    pub fn read(&self) -> ReadLock<'_> {
        ReadLock(self)
    }

    /// Write side as a [`Lockable`].
    pub fn write(&self) -> WriteLock<'_> {
        WriteLock(self)
    }
}

impl Drop for InterProcessReaderWriterLock {
    fn drop(&mut self) {
        let readers = self.readers.get_mut();
        if !readers.is_empty() {
            warn!(
                "Read lock dropped while held, releasing: {}",
                self.registration.identity()
            );
            for (reader, _) in readers.drain() {
                self.registration.coordinator().leave_shared(reader);
            }
        }
        if self.registration.coordinator().vacate_instance(self.id) {
            warn!(
                "Write lock dropped while held, releasing: {}",
                self.registration.identity()
            );
        }
        self.data.close();
        // The gate is an InterProcessLock and cleans up after itself.
    }
}

/// Read view of an [`InterProcessReaderWriterLock`].
#[derive(Debug, Clone, Copy)]
pub struct ReadLock<'a>(&'a InterProcessReaderWriterLock);

/// Write view of an [`InterProcessReaderWriterLock`].
#[derive(Debug, Clone, Copy)]
pub struct WriteLock<'a>(&'a InterProcessReaderWriterLock);

impl ReadLock<'_> {
    pub fn lock(self) -> Result<LockGuard<Self>> {
        LockGuard::acquire(self, &LockStrategy::Wait)
    }

    pub fn lock_with(self, strategy: &LockStrategy) -> Result<LockGuard<Self>> {
        LockGuard::acquire(self, strategy)
    }
}

impl WriteLock<'_> {
    pub fn lock(self) -> Result<LockGuard<Self>> {
        LockGuard::acquire(self, &LockStrategy::Wait)
    }

    pub fn lock_with(self, strategy: &LockStrategy) -> Result<LockGuard<Self>> {
        LockGuard::acquire(self, strategy)
    }
}

impl Lockable for ReadLock<'_> {
    fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool> {
        self.0.acquire_read_with(strategy)
    }

    fn release(&self) -> Result<()> {
        self.0.release_read()
    }

    fn lock_path(&self) -> &Path {
        self.0.path()
    }
}

impl Lockable for WriteLock<'_> {
    fn acquire_with(&self, strategy: &LockStrategy) -> Result<bool> {
        self.0.acquire_write_with(strategy)
    }

    fn release(&self) -> Result<()> {
        self.0.release_write()
    }

    fn lock_path(&self) -> &Path {
        self.0.path()
    }
}
