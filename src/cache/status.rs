//! Operational counters and the cacheable status snapshot

use std::sync::atomic::{AtomicU64, Ordering};
use std::time::Duration;

use parking_lot::Mutex;
use serde::Serialize;
use tokio::time::Instant;

/// Internal counters updated by the stages
///
/// All counters are relaxed atomics; the status snapshot is advisory and
/// does not need cross-counter consistency.
#[derive(Debug, Default)]
pub(crate) struct CacheMetrics {
    pub reads_attempted: AtomicU64,
    pub reads_succeeded: AtomicU64,
    pub reads_failed_final: AtomicU64,
    pub read_retries: AtomicU64,
    pub writes_attempted: AtomicU64,
    pub writes_succeeded: AtomicU64,
    pub writes_failed_final: AtomicU64,
    pub write_retries: AtomicU64,
    pub in_flight_reads: AtomicU64,
    pub in_flight_writes: AtomicU64,
    pub read_queue_size: AtomicU64,
    pub write_queue_size: AtomicU64,
    pub main_queue_size: AtomicU64,
    pub return_queue_size: AtomicU64,
    pub entries_created: AtomicU64,
    pub entries_evicted: AtomicU64,
    pub read_hits: AtomicU64,
    pub read_timeouts: AtomicU64,
    pub stale_reads_served: AtomicU64,
    pub updates_collected: AtomicU64,
    pub assertions_failed: AtomicU64,
}

impl CacheMetrics {
    pub fn incr(counter: &AtomicU64) {
        counter.fetch_add(1, Ordering::Relaxed);
    }

    pub fn decr(counter: &AtomicU64) {
        counter.fetch_sub(1, Ordering::Relaxed);
    }

    pub fn set(counter: &AtomicU64, value: u64) {
        counter.store(value, Ordering::Relaxed);
    }
}

/// Point-in-time view of cache health
#[derive(Debug, Clone, Serialize)]
pub struct CacheStatus {
    /// Cache identifier
    pub cache_name: String,
    /// Live entries in the entry table
    pub entry_table_size: usize,
    /// Keys waiting for a storage read
    pub read_queue_size: u64,
    /// Keys waiting for a storage write
    pub write_queue_size: u64,
    /// Entries cycling through the main queue
    pub main_queue_size: u64,
    /// Entries dwelling post-write
    pub return_queue_size: u64,
    /// Storage reads currently executing
    pub in_flight_reads: u64,
    /// Storage writes currently executing
    pub in_flight_writes: u64,
    /// Storage read attempts since startup
    pub reads_attempted: u64,
    /// Storage reads that returned data
    pub reads_succeeded: u64,
    /// Storage reads that failed after all retries
    pub reads_failed_final: u64,
    /// Read retries issued
    pub read_retries: u64,
    /// Storage write attempts since startup
    pub writes_attempted: u64,
    /// Storage writes confirmed
    pub writes_succeeded: u64,
    /// Storage writes that failed after all retries
    pub writes_failed_final: u64,
    /// Write retries issued
    pub write_retries: u64,
    /// Entries admitted since startup
    pub entries_created: u64,
    /// Entries removed since startup
    pub entries_evicted: u64,
    /// Caller reads served from memory
    pub read_hits: u64,
    /// Caller reads that hit their deadline while loading
    pub read_timeouts: u64,
    /// Caller reads served stale after a permanent resync failure
    pub stale_reads_served: u64,
    /// Updates accepted into entry logs
    pub updates_collected: u64,
    /// Events suppressed by log throttling
    pub events_throttled: u64,
    /// Internal assertion failures
    pub assertions_failed: u64,
}

/// TTL cache for status snapshots
///
/// Building a snapshot walks every counter; callers that poll frequently
/// can pass a TTL and share one snapshot per window.
pub(crate) struct StatusCache {
    cached: Mutex<Option<(Instant, CacheStatus)>>,
}

impl StatusCache {
    pub fn new() -> Self {
        Self {
            cached: Mutex::new(None),
        }
    }

    pub fn get_or_build(
        &self,
        max_age: Duration,
        build: impl FnOnce() -> CacheStatus,
    ) -> CacheStatus {
        let mut cached = self.cached.lock();
        let now = Instant::now();
        if let Some((built_at, status)) = cached.as_ref() {
            if now.duration_since(*built_at) < max_age {
                return status.clone();
            }
        }
        let status = build();
        *cached = Some((now, status.clone()));
        status
    }
}
