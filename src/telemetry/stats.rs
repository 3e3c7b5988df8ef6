//! Lock-free counters behind [`CacheStats`].

use std::sync::atomic::{AtomicU64, Ordering};

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct CacheStats {
    /// Reads that returned a value (FRESH or STALE).
    pub hits: u64,
    /// Reads that found nothing servable (absent, corrupt or EXPIRED).
    pub misses: u64,
    /// Subset of `hits` that were STALE.
    pub stale_hits: u64,
    /// Subset of `misses` caused by an EXPIRED entry.
    pub expired: u64,
    pub puts: u64,
    pub errors: u64,
    pub refresh_started: u64,
    pub refresh_completed: u64,
    pub refresh_failed: u64,
    pub refresh_superseded: u64,
    pub active_tasks: u64,
}

impl CacheStats {
    pub fn hit_ratio(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

#[derive(Default)]
pub struct StatsRecorder {
    pub(crate) hits: AtomicU64,
    pub(crate) misses: AtomicU64,
    pub(crate) stale_hits: AtomicU64,
    pub(crate) expired: AtomicU64,
    pub(crate) puts: AtomicU64,
    pub(crate) errors: AtomicU64,
    pub(crate) refresh_started: AtomicU64,
    pub(crate) refresh_completed: AtomicU64,
    pub(crate) refresh_failed: AtomicU64,
    pub(crate) refresh_superseded: AtomicU64,
    pub(crate) active_tasks: AtomicU64,
}

impl StatsRecorder {
    pub fn new() -> Self {
        Self::default()
    }

    pub(crate) fn bump(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn snapshot(&self) -> CacheStats {
        CacheStats {
            hits: self.hits.load(Ordering::Relaxed),
            misses: self.misses.load(Ordering::Relaxed),
            stale_hits: self.stale_hits.load(Ordering::Relaxed),
            expired: self.expired.load(Ordering::Relaxed),
            puts: self.puts.load(Ordering::Relaxed),
            errors: self.errors.load(Ordering::Relaxed),
            refresh_started: self.refresh_started.load(Ordering::Relaxed),
            refresh_completed: self.refresh_completed.load(Ordering::Relaxed),
            refresh_failed: self.refresh_failed.load(Ordering::Relaxed),
            refresh_superseded: self.refresh_superseded.load(Ordering::Relaxed),
            active_tasks: self.active_tasks.load(Ordering::Relaxed),
        }
    }
}
