//! Cache hit/miss accounting

use std::sync::atomic::{AtomicU64, Ordering};

/// Resource cache statistics
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct CacheStats {
    /// Lookups answered from the cache
    pub hits: u64,
    /// Lookups that went to the backing store
    pub misses: u64,
    /// Current number of cached resources
    pub len: usize,
    /// Configured maximum
    pub capacity: usize,
}

impl CacheStats {
    /// Calculate hit rate as a percentage
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            (self.hits as f64 / total as f64) * 100.0
        }
    }
}

/// Lock-free counters; both reset to zero when either wraps
#[derive(Debug)]
pub(crate) struct Counters {
    enabled: bool,
    hits: AtomicU64,
    misses: AtomicU64,
}

impl Counters {
    pub(crate) fn new(enabled: bool) -> Self {
        Counters {
            enabled,
            hits: AtomicU64::new(0),
            misses: AtomicU64::new(0),
        }
    }

    pub(crate) fn hit(&self) {
        self.bump(&self.hits);
    }

    pub(crate) fn miss(&self) {
        self.bump(&self.misses);
    }

    fn bump(&self, counter: &AtomicU64) {
        if !self.enabled {
            return;
        }
        if counter.fetch_add(1, Ordering::Relaxed) == u64::MAX {
            self.reset();
        }
    }

    pub(crate) fn reset(&self) {
        self.hits.store(0, Ordering::Relaxed);
        self.misses.store(0, Ordering::Relaxed);
    }

    pub(crate) fn snapshot(&self) -> (u64, u64) {
        (
            self.hits.load(Ordering::Relaxed),
            self.misses.load(Ordering::Relaxed),
        )
    }
}
