use crate::registry::LockRegistry;
use std::sync::Arc;
use std::time::Duration;

/// Tuning knobs shared by every lock type.
#[derive(Debug, Clone)]
pub struct LockConfig {
    /// First sleep between polling attempts.
    pub initial_delay: Duration,
    /// Upper bound the doubling sleep is clamped to.
    pub max_delay: Duration,
    /// Random extra sleep added to every pause.
    pub jitter: Duration,
    /// For untimed blocking acquires, wait in the kernel instead of polling.
    pub native_wait: bool,
    /// Create missing parent directories of the lock file when opening it.
    pub create_parent_dirs: bool,
    registry: Option<Arc<LockRegistry>>,
}

impl Default for LockConfig {
    fn default() -> Self {
        Self {
            initial_delay: Duration::from_millis(10),
            max_delay: Duration::from_millis(100),
            jitter: Duration::from_millis(10),
            native_wait: false,
            create_parent_dirs: false,
            registry: None,
        }
    }
}

impl LockConfig {
    pub fn with_initial_delay(mut self, delay: Duration) -> Self {
        self.initial_delay = delay;
        self
    }

    pub fn with_max_delay(mut self, max_delay: Duration) -> Self {
        self.max_delay = max_delay;
        self
    }

    pub fn with_jitter(mut self, jitter: Duration) -> Self {
        self.jitter = jitter;
        self
    }

    pub fn with_native_wait(mut self, native_wait: bool) -> Self {
        self.native_wait = native_wait;
        self
    }

    pub fn with_create_parent_dirs(mut self, create: bool) -> Self {
        self.create_parent_dirs = create;
        self
    }

    /// Coordinate through `registry` instead of the process-wide one.
    pub fn with_registry(mut self, registry: Arc<LockRegistry>) -> Self {
        self.registry = Some(registry);
        self
    }

    pub(crate) fn registry(&self) -> Arc<LockRegistry> {
        match &self.registry {
            Some(registry) => Arc::clone(registry),
            None => LockRegistry::global(),
        }
    }
}
