use std::sync::atomic::{AtomicU64, Ordering};

/// Monotonic cache version observed by the UI.
///
/// Bumped on every mutation or invalidation event (store, clear, memory
/// pressure, foreground resume). Observers diff the value between frames to
/// decide whether to re-query image state; it never decreases for the
/// lifetime of the process.
#[derive(Debug, Default)]
pub struct CacheGeneration(AtomicU64);

impl CacheGeneration {
    pub fn current(&self) -> u64 {
        self.0.load(Ordering::Relaxed)
    }

    pub fn bump(&self) -> u64 {
        self.0.fetch_add(1, Ordering::Relaxed) + 1
    }
}
