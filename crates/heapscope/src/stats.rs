//! Statistics - timers and counters for walks, queries and caches

use std::time::{Duration, Instant};

/// Wall-clock timer for one query
#[derive(Debug, Clone, Copy)]
pub struct QueryTimer {
    start: Instant,
}

impl QueryTimer {
    pub fn start() -> Self {
        Self {
            start: Instant::now(),
        }
    }

    pub fn elapsed(&self) -> Duration {
        self.start.elapsed()
    }

    pub fn elapsed_ms(&self) -> f64 {
        self.elapsed().as_secs_f64() * 1000.0
    }
}

/// Hit/miss counters of one cache
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CacheStats {
    pub hits: u64,
    pub misses: u64,
    /// Requests served without touching the cache
    pub bypasses: u64,
    /// Refills or queries that failed
    pub failures: u64,
}

impl CacheStats {
    pub fn hit_rate(&self) -> f64 {
        let total = self.hits + self.misses;
        if total == 0 {
            0.0
        } else {
            self.hits as f64 / total as f64
        }
    }
}

/// Counters of one object walk
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WalkStats {
    pub objects: u64,
    pub bytes: u64,
    pub segments: u64,
    pub segments_abandoned: u64,
}

/// Counters of one graph query
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct QueryStats {
    pub roots_visited: u64,
    pub nodes_expanded: u64,
    pub objects_unreadable: u64,
}
