//! Cache counters reported through the `metrics` facade.
//!
//! Nothing is exported unless the embedding application installs a recorder.

use metrics::counter;

/// Metric names as constants for consistency.
pub mod names {
    pub const CACHE_HITS_TOTAL: &str = "tiercache_hits_total";
    pub const CACHE_MISSES_TOTAL: &str = "tiercache_misses_total";
    pub const REMOTE_READS_TOTAL: &str = "tiercache_remote_reads_total";
    pub const INVALIDATIONS_TOTAL: &str = "tiercache_invalidations_total";
}

/// Record a cache hit on the given tier (`local`, `mirror`, `remote`).
pub fn record_cache_hit(tier: &'static str) {
    counter!(names::CACHE_HITS_TOTAL, "tier" => tier).increment(1);
}

/// Record a cache miss.
pub fn record_cache_miss() {
    counter!(names::CACHE_MISSES_TOTAL).increment(1);
}

/// Record a read issued against the remote store.
pub fn record_remote_read() {
    counter!(names::REMOTE_READS_TOTAL).increment(1);
}

/// Record an invalidation message applied to the local mirror.
pub fn record_invalidation(command: &'static str) {
    counter!(names::INVALIDATIONS_TOTAL, "command" => command).increment(1);
}
