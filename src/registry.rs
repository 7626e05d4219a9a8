//! Process-local coordination for inter-process locks.
//!
//! OS file locks say nothing useful about threads of one process: depending
//! on the platform and the call they are either granted per process or
//! silently re-entered. Every lock instance therefore resolves its canonical
//! path here first, and all instances of one path share a [`Coordinator`]
//! that records which thread (through which instance) holds the path and how
//! many in-process readers are inside it. The OS lock is only touched by the
//! thread that won the coordinator.

use crate::error::{LockError, Result};
use crate::lock::LockIdentity;
use crate::lock::strategy::Wait;
use parking_lot::{Condvar, Mutex, MutexGuard};
use std::collections::HashMap;
use std::fmt;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, OnceLock, Weak};
use std::thread::{self, ThreadId};
use tracing::trace;

static GLOBAL_REGISTRY: OnceLock<Arc<LockRegistry>> = OnceLock::new();
static NEXT_INSTANCE: AtomicU64 = AtomicU64::new(1);

pub(crate) fn next_instance_id() -> u64 {
    NEXT_INSTANCE.fetch_add(1, Ordering::Relaxed)
}

/// A thread acting through one particular lock instance.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub(crate) struct Owner {
    thread: ThreadId,
    instance: u64,
}

impl Owner {
    pub(crate) fn current(instance: u64) -> Self {
        Self {
            thread: thread::current().id(),
            instance,
        }
    }
}

pub(crate) enum Claim {
    /// The owner already held the path; depth was incremented.
    Reentered,
    /// The path is reserved for the owner, who must now take the OS lock and
    /// then either [`Coordinator::confirm`] or [`Coordinator::vacate`].
    Claimed,
    Unavailable,
}

#[derive(Debug, Default)]
struct Holder {
    owner: Option<Owner>,
    // 0 while the owner is still taking or dropping the OS lock
    depth: usize,
    // in-process reader entries per thread
    readers: HashMap<ThreadId, usize>,
}

impl Holder {
    /// Whether waiting on this state could only end when `me` itself lets go.
    fn waits_on(&self, me: ThreadId, exclusive: bool) -> bool {
        self.owner.map(|o| o.thread) == Some(me)
            || (exclusive && self.readers.contains_key(&me))
    }
}

#[derive(Debug, Default)]
pub(crate) struct Coordinator {
    state: Mutex<Holder>,
    released: Condvar,
}

impl Coordinator {
    fn wait_until_ready<F>(
        &self,
        state: &mut MutexGuard<'_, Holder>,
        wait: Wait,
        path: &Path,
        exclusive: bool,
        ready: F,
    ) -> Result<bool>
    where
        F: Fn(&Holder) -> bool,
    {
        let me = thread::current().id();
        loop {
            if ready(&**state) {
                return Ok(true);
            }
            match wait {
                Wait::Never => return Ok(false),
                Wait::Until(deadline) => {
                    if self.released.wait_until(state, deadline).timed_out() {
                        return Ok(ready(&**state));
                    }
                }
                Wait::Forever => {
                    if state.waits_on(me, exclusive) {
                        return Err(LockError::WouldDeadlock {
                            path: path.to_path_buf(),
                        });
                    }
                    self.released.wait(state);
                }
            }
        }
    }

    pub(crate) fn claim_exclusive(&self, owner: Owner, wait: Wait, path: &Path) -> Result<Claim> {
        let mut state = self.state.lock();
        if state.owner == Some(owner) && state.depth > 0 {
            state.depth += 1;
            trace!(path = %path.display(), depth = state.depth, "reentered lock");
            return Ok(Claim::Reentered);
        }

        if !self.wait_until_ready(&mut state, wait, path, true, |h| {
            h.owner.is_none() && h.readers.is_empty()
        })? {
            return Ok(Claim::Unavailable);
        }

        state.owner = Some(owner);
        state.depth = 0;
        Ok(Claim::Claimed)
    }

    /// Increment depth if `owner` already holds the path.
    pub(crate) fn reenter(&self, owner: Owner) -> bool {
        let mut state = self.state.lock();
        if state.owner == Some(owner) && state.depth > 0 {
            state.depth += 1;
            true
        } else {
            false
        }
    }

    pub(crate) fn confirm(&self, owner: Owner) {
        let mut state = self.state.lock();
        debug_assert_eq!(state.owner, Some(owner));
        state.depth = 1;
    }

    /// Drop one level of `owner`'s hold and return the remaining depth. At
    /// zero the owner keeps its claim until it calls [`Coordinator::vacate`].
    pub(crate) fn leave(&self, owner: Owner, path: &Path) -> Result<usize> {
        let mut state = self.state.lock();
        if state.owner != Some(owner) || state.depth == 0 {
            return Err(LockError::not_held(path));
        }
        state.depth -= 1;
        Ok(state.depth)
    }

    pub(crate) fn vacate(&self, owner: Owner) {
        let mut state = self.state.lock();
        if state.owner == Some(owner) {
            state.owner = None;
            state.depth = 0;
            self.released.notify_all();
            MutexGuard::unlock_fair(state);
        }
    }

    /// Clear the hold of `instance` whichever thread took it. Returns whether
    /// anything was held.
    pub(crate) fn vacate_instance(&self, instance: u64) -> bool {
        let mut state = self.state.lock();
        match state.owner {
            Some(owner) if owner.instance == instance => {
                state.owner = None;
                state.depth = 0;
                self.released.notify_all();
                MutexGuard::unlock_fair(state);
                true
            }
            _ => false,
        }
    }

    /// Enter `reader` as an in-process reader once no exclusive owner is
    /// present.
    pub(crate) fn claim_shared(&self, reader: ThreadId, wait: Wait, path: &Path) -> Result<bool> {
        let mut state = self.state.lock();
        if !self.wait_until_ready(&mut state, wait, path, false, |h| h.owner.is_none())? {
            return Ok(false);
        }
        *state.readers.entry(reader).or_insert(0) += 1;
        Ok(true)
    }

    pub(crate) fn leave_shared(&self, reader: ThreadId) {
        let mut state = self.state.lock();
        if let Some(count) = state.readers.get_mut(&reader) {
            *count -= 1;
            if *count == 0 {
                state.readers.remove(&reader);
            }
        }
        if state.readers.is_empty() {
            self.released.notify_all();
            MutexGuard::unlock_fair(state);
        }
    }

    pub(crate) fn held_by(&self, owner: Owner) -> bool {
        let state = self.state.lock();
        state.owner == Some(owner) && state.depth > 0
    }

    pub(crate) fn held_by_instance(&self, instance: u64) -> bool {
        let state = self.state.lock();
        matches!(state.owner, Some(o) if o.instance == instance) && state.depth > 0
    }

    pub(crate) fn is_held(&self) -> bool {
        let state = self.state.lock();
        (state.owner.is_some() && state.depth > 0) || !state.readers.is_empty()
    }
}

/// Table of canonical lock path to the coordination state shared by every
/// lock instance for that path.
///
/// Most code uses [`LockRegistry::global`]. Tests and embedders that want
/// lock instances isolated from the rest of the process create their own
/// with [`LockRegistry::new`] and pass it through
/// [`LockConfig::with_registry`](crate::LockConfig::with_registry).
#[derive(Default)]
pub struct LockRegistry {
    entries: Mutex<HashMap<PathBuf, Weak<Coordinator>>>,
}

impl LockRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// The process-wide registry, created on first use.
    pub fn global() -> Arc<Self> {
        Arc::clone(GLOBAL_REGISTRY.get_or_init(|| Arc::new(Self::new())))
    }

    /// Shared coordination handle for `identity`. The entry lives as long as
    /// any [`Registration`] for it does.
    pub fn resolve(self: &Arc<Self>, identity: &LockIdentity) -> Registration {
        let mut entries = self.entries.lock();

        let coordinator = match entries.get(identity.path()).and_then(Weak::upgrade) {
            Some(existing) => existing,
            None => {
                let created = Arc::new(Coordinator::default());
                entries.insert(identity.path().to_path_buf(), Arc::downgrade(&created));
                trace!(path = %identity, "registered lock path");
                created
            }
        };

        Registration {
            registry: Arc::clone(self),
            identity: identity.clone(),
            coordinator,
        }
    }

    /// Number of paths with at least one live registration.
    pub fn len(&self) -> usize {
        self.entries
            .lock()
            .values()
            .filter(|w| w.strong_count() > 0)
            .count()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn contains(&self, identity: &LockIdentity) -> bool {
        self.entries
            .lock()
            .get(identity.path())
            .map_or(false, |w| w.strong_count() > 0)
    }

    fn evict(&self, identity: &LockIdentity, coordinator: &Arc<Coordinator>) {
        let mut entries = self.entries.lock();
        // Upgrades only happen under this mutex, so a count of one means the
        // caller's handle is the last.
        if Arc::strong_count(coordinator) != 1 {
            return;
        }
        let is_same = entries
            .get(identity.path())
            .map_or(false, |w| w.as_ptr() == Arc::as_ptr(coordinator));
        if is_same {
            entries.remove(identity.path());
            trace!(path = %identity, "evicted lock path");
        }
    }
}

impl fmt::Debug for LockRegistry {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LockRegistry")
            .field("paths", &self.len())
            .finish()
    }
}

/// One lock instance's reference to a registry entry.
#[derive(Debug)]
pub struct Registration {
    registry: Arc<LockRegistry>,
    identity: LockIdentity,
    coordinator: Arc<Coordinator>,
}

impl Registration {
    pub fn identity(&self) -> &LockIdentity {
        &self.identity
    }

    /// Whether any thread of this process currently holds the path, through
    /// any instance, exclusively or as a reader.
    pub fn is_held(&self) -> bool {
        self.coordinator.is_held()
    }

    pub(crate) fn coordinator(&self) -> &Coordinator {
        &self.coordinator
    }
}

impl Drop for Registration {
    fn drop(&mut self) {
        self.registry.evict(&self.identity, &self.coordinator);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::{Duration, Instant};
    use tempfile::TempDir;

    fn identity(temp: &TempDir, name: &str) -> LockIdentity {
        LockIdentity::new(temp.path().join(name)).unwrap()
    }

    #[test]
    fn test_same_path_shares_coordinator() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(LockRegistry::new());

        let a = registry.resolve(&identity(&temp, "a.lock"));
        let b = registry.resolve(&identity(&temp, "a.lock"));
        let c = registry.resolve(&identity(&temp, "c.lock"));

        assert!(Arc::ptr_eq(&a.coordinator, &b.coordinator));
        assert!(!Arc::ptr_eq(&a.coordinator, &c.coordinator));
        assert_eq!(registry.len(), 2);
    }

    #[test]
    fn test_entry_evicted_with_last_registration() {
        let temp = TempDir::new().unwrap();
        let registry = Arc::new(LockRegistry::new());
        let id = identity(&temp, "a.lock");

        let a = registry.resolve(&id);
        let b = registry.resolve(&id);
        drop(a);
        assert!(registry.contains(&id));
        drop(b);
        assert!(!registry.contains(&id));
        assert!(registry.is_empty());
    }

    #[test]
    fn test_isolated_registries_do_not_share() {
        let temp = TempDir::new().unwrap();
        let id = identity(&temp, "a.lock");
        let first = Arc::new(LockRegistry::new());
        let second = Arc::new(LockRegistry::new());

        let a = first.resolve(&id);
        let b = second.resolve(&id);
        assert!(!Arc::ptr_eq(&a.coordinator, &b.coordinator));
    }

    #[test]
    fn test_claim_reenter_and_leave() {
        let coordinator = Coordinator::default();
        let owner = Owner::current(1);
        let path = Path::new("x.lock");

        assert!(matches!(
            coordinator.claim_exclusive(owner, Wait::Never, path).unwrap(),
            Claim::Claimed
        ));
        assert!(!coordinator.held_by(owner), "claimed but not confirmed");
        coordinator.confirm(owner);
        assert!(matches!(
            coordinator.claim_exclusive(owner, Wait::Never, path).unwrap(),
            Claim::Reentered
        ));

        assert_eq!(coordinator.leave(owner, path).unwrap(), 1);
        assert_eq!(coordinator.leave(owner, path).unwrap(), 0);
        assert!(matches!(
            coordinator.leave(owner, path),
            Err(LockError::NotHeld { .. })
        ));
        coordinator.vacate(owner);
        assert!(!coordinator.is_held());
    }

    #[test]
    fn test_other_instance_on_same_thread_is_unavailable() {
        let coordinator = Coordinator::default();
        let path = Path::new("x.lock");
        let first = Owner::current(1);
        let second = Owner::current(2);

        coordinator.claim_exclusive(first, Wait::Never, path).unwrap();
        coordinator.confirm(first);

        assert!(matches!(
            coordinator.claim_exclusive(second, Wait::Never, path).unwrap(),
            Claim::Unavailable
        ));
        assert!(matches!(
            coordinator.claim_exclusive(second, Wait::Forever, path),
            Err(LockError::WouldDeadlock { .. })
        ));
    }

    #[test]
    fn test_timed_claim_gives_up() {
        let coordinator = Arc::new(Coordinator::default());
        let holder = Owner::current(1);
        coordinator
            .claim_exclusive(holder, Wait::Never, Path::new("x.lock"))
            .unwrap();
        coordinator.confirm(holder);

        let waiter = Arc::clone(&coordinator);
        let start = Instant::now();
        let claimed = thread::spawn(move || {
            let deadline = Wait::Until(Instant::now() + Duration::from_millis(100));
            matches!(
                waiter
                    .claim_exclusive(Owner::current(2), deadline, Path::new("x.lock"))
                    .unwrap(),
                Claim::Claimed
            )
        })
        .join()
        .unwrap();

        assert!(!claimed);
        assert!(start.elapsed() >= Duration::from_millis(90));
    }

    #[test]
    fn test_readers_block_exclusive_claim() {
        let coordinator = Coordinator::default();
        let path = Path::new("x.lock");

        let me = thread::current().id();

        assert!(coordinator.claim_shared(me, Wait::Never, path).unwrap());
        assert!(coordinator.claim_shared(me, Wait::Never, path).unwrap());
        assert!(matches!(
            coordinator
                .claim_exclusive(Owner::current(1), Wait::Never, path)
                .unwrap(),
            Claim::Unavailable
        ));

        coordinator.leave_shared(me);
        assert!(coordinator.is_held(), "one reader entry left");
        coordinator.leave_shared(me);
        assert!(matches!(
            coordinator
                .claim_exclusive(Owner::current(1), Wait::Never, path)
                .unwrap(),
            Claim::Claimed
        ));
        assert!(!coordinator
            .claim_shared(thread::current().id(), Wait::Never, path)
            .unwrap());
    }

    #[test]
    fn test_reader_waiting_on_itself_would_deadlock() {
        let coordinator = Coordinator::default();
        let path = Path::new("x.lock");
        let me = thread::current().id();
        assert!(coordinator.claim_shared(me, Wait::Never, path).unwrap());

        assert!(matches!(
            coordinator.claim_exclusive(Owner::current(1), Wait::Forever, path),
            Err(LockError::WouldDeadlock { .. })
        ));
        // A timed claim just gives up.
        let soon = Wait::Until(Instant::now() + Duration::from_millis(20));
        assert!(matches!(
            coordinator.claim_exclusive(Owner::current(1), soon, path).unwrap(),
            Claim::Unavailable
        ));
        // More readers never wait on readers.
        assert!(coordinator.claim_shared(me, Wait::Forever, path).unwrap());
        coordinator.leave_shared(me);
        coordinator.leave_shared(me);
        assert!(!coordinator.is_held());
    }
}
