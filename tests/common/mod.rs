#![allow(dead_code)]

use interlock::{LockConfig, LockRegistry};
use std::path::Path;
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

pub fn init_tracing() {
    let _ = tracing_subscriber::fmt()
        .with_max_level(tracing::Level::DEBUG)
        .with_test_writer()
        .try_init();
}

/// Config whose locks only coordinate with others built from the same config.
pub fn isolated_config() -> LockConfig {
    LockConfig::default().with_registry(Arc::new(LockRegistry::new()))
}

/// Poll until `path` exists.
pub fn wait_for_file(path: &Path, limit: Duration) -> bool {
    let start = Instant::now();
    while start.elapsed() < limit {
        if path.exists() {
            return true;
        }
        thread::sleep(Duration::from_millis(20));
    }
    false
}
