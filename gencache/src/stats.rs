//! Per-unit-of-work counters.

use serde::Serialize;
use std::time::Duration;

/// Snapshot of the counters of one [`crate::ObjectCache`].
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct CacheStats {
    /// Reads answered by the local cache (negative entries included)
    pub local_hits: u64,
    /// Reads answered by the backend with a value
    pub remote_hits: u64,
    /// Reads the backend answered without a value
    pub misses: u64,
    /// Primary backend calls issued
    pub backend_calls: u64,
    /// Time spent in primary backend calls
    pub backend_time: Duration,
    /// Entries held by the local cache
    pub local_entries: usize,
    /// Approximate bytes held by the local cache
    pub local_footprint: usize,
    /// Token reads issued by the shared token store
    pub token_reads: u64,
    /// Token writes issued by the shared token store
    pub token_writes: u64,
}

impl CacheStats {
    /// Fraction of reads served without a backend miss, or `None` before
    /// the first read.
    pub fn hit_ratio(&self) -> Option<f64> {
        let reads = self.local_hits + self.remote_hits + self.misses;
        if reads == 0 {
            None
        } else {
            Some((self.local_hits + self.remote_hits) as f64 / reads as f64)
        }
    }
}

#[derive(Debug, Default)]
pub(crate) struct Counters {
    pub(crate) local_hits: u64,
    pub(crate) remote_hits: u64,
    pub(crate) misses: u64,
    pub(crate) backend_calls: u64,
    pub(crate) backend_time: Duration,
}

impl Counters {
    pub(crate) fn record_call(&mut self, elapsed: Duration) {
        self.backend_calls += 1;
        self.backend_time += elapsed;
    }
}
