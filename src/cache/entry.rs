//! Cache entry, per-entry state machine, and the update log
//!
//! Entries are owned exclusively by the entry table. Stage queues never hold
//! entries; they hold `(key, generation)` handles resolved back through the
//! table at dequeue, so a handle whose entry was evicted is dropped there.

use std::collections::VecDeque;

use parking_lot::Mutex;
use tokio::sync::Notify;
use tokio::time::Instant;

use crate::cache::adapter::CacheAdapter;
use crate::error::CacheError;

/// Lifecycle state of a cache entry
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum EntryState {
    /// Initial storage read not yet completed
    Loading,
    /// Payload present and current
    Loaded,
    /// Queued for a background reconciliation read
    ResyncPending,
    /// Reconciliation read in flight
    Resyncing,
    /// Queued for a storage write
    WritePending,
    /// Storage write in flight
    Writing,
    /// Terminal: no longer reachable from the entry table
    RemovedFromCache,
    /// Initial read failed after all retries
    ReadFailedFinal,
    /// Reconciliation read failed after all retries
    ResyncFailedFinal,
}

impl EntryState {
    /// Whether a storage read is queued or in flight for this state
    pub fn read_in_flight(&self) -> bool {
        matches!(
            self,
            EntryState::Loading | EntryState::ResyncPending | EntryState::Resyncing
        )
    }

    /// Whether a storage write is queued or in flight for this state
    pub fn write_in_flight(&self) -> bool {
        matches!(self, EntryState::WritePending | EntryState::Writing)
    }
}

/// Read/write/cycle failure counters
#[derive(Debug, Clone, Copy, Default)]
pub struct FailureCounters {
    /// Storage read attempts for the current read
    pub read_attempts: u32,
    /// Storage write attempts for the current pending write
    pub write_attempts: u32,
    /// Full cycles that ended in a permanent write failure
    pub cycle_failures: u32,
}

/// Mutable entry body, guarded by the per-entry lock
///
/// The lock is only ever held for short critical sections; storage calls
/// happen with it released.
pub(crate) struct EntryBody<A: CacheAdapter> {
    pub state: EntryState,
    pub payload: Option<A::Cached>,
    pub update_log: VecDeque<A::LogEntry>,
    /// Set when a resync merge replayed collected updates into the payload;
    /// keeps the entry eligible for a write after the log was consumed.
    /// Cleared together with the log at the write split.
    pub dirty: bool,
    /// Last write data handed to the write stage and not yet confirmed
    pub pending_write: Option<A::StorageWrite>,
    pub failures: FailureCounters,
    /// Times this entry was re-looped through the return queue while dirty
    pub requeue_count: u32,
    /// Completed main-queue cycles; never decreases
    pub cycle_count: u64,
    /// Cycle counter captured when the current resync was scheduled
    pub cycle_at_resync_start: u64,
    /// When the current resync was scheduled; reads stamped after this
    /// observed data the merge may supersede
    pub resync_started_at: Option<Instant>,
    /// Update log exceeded its bound while a resync was outstanding
    pub resync_overdue: bool,
    /// Updates refused after a permanent resync failure
    pub updates_paused: bool,
    /// Most recent successful caller read
    pub last_read_at: Option<Instant>,
    /// Error to report to waiters once the entry is terminal
    pub final_error: Option<CacheError>,
}

impl<A: CacheAdapter> EntryBody<A> {
    fn new() -> Self {
        Self {
            state: EntryState::Loading,
            payload: None,
            update_log: VecDeque::new(),
            dirty: false,
            pending_write: None,
            failures: FailureCounters::default(),
            requeue_count: 0,
            cycle_count: 0,
            cycle_at_resync_start: 0,
            resync_started_at: None,
            resync_overdue: false,
            updates_paused: false,
            last_read_at: None,
            final_error: None,
        }
    }

    /// Whether the entry holds data that still needs to reach storage
    pub fn is_dirty(&self) -> bool {
        !self.update_log.is_empty() || self.dirty || self.pending_write.is_some()
    }

    /// Updates currently held in the log
    pub fn pending_update_count(&self) -> usize {
        self.update_log.len()
    }

    /// Append one update to the log; returns true on the append that
    /// crosses the configured bound
    pub fn append_update(&mut self, entry: A::LogEntry, max_updates: usize) -> bool {
        self.update_log.push_back(entry);
        if self.update_log.len() > max_updates && !self.resync_overdue {
            self.resync_overdue = true;
            return true;
        }
        false
    }

    /// Consume the log and the merge-dirtiness marker in one step
    pub fn take_log(&mut self) -> VecDeque<A::LogEntry> {
        self.dirty = false;
        std::mem::take(&mut self.update_log)
    }

    /// Whether the current resync returned after its cycle rolled over
    pub fn resync_is_late(&self) -> bool {
        self.resync_overdue || self.cycle_count != self.cycle_at_resync_start
    }
}

/// Shared cache entry: key, generation, lock-guarded body, and the waiter
/// notification used to release blocked readers
pub(crate) struct CacheEntry<A: CacheAdapter> {
    pub key: A::Key,
    /// Distinguishes this incarnation from evicted predecessors under the
    /// same key; queue handles carry it and are dropped on mismatch
    pub generation: u64,
    pub body: Mutex<EntryBody<A>>,
    /// Signalled on load completion, final failure, and eviction
    pub waiters: Notify,
}

impl<A: CacheAdapter> CacheEntry<A> {
    pub fn new(key: A::Key, generation: u64) -> Self {
        Self {
            key,
            generation,
            body: Mutex::new(EntryBody::new()),
            waiters: Notify::new(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::error::StorageError;
    use async_trait::async_trait;

    struct NoopAdapter;

    #[async_trait]
    impl CacheAdapter for NoopAdapter {
        type Key = u64;
        type Value = String;
        type Cached = String;
        type StorageRead = String;
        type StorageWrite = String;
        type Update = char;
        type LogEntry = char;

        async fn read_from_storage(
            &self,
            _key: &u64,
            _is_refresh: bool,
        ) -> Result<String, StorageError> {
            Ok(String::new())
        }

        async fn write_to_storage(&self, _key: &u64, _write: String) -> Result<(), StorageError> {
            Ok(())
        }

        fn to_internal_update(&self, _key: &u64, update: char) -> char {
            update
        }

        fn to_cache_format(&self, _key: &u64, raw: String) -> String {
            raw
        }

        fn to_return_value(&self, _key: &u64, cached: &String) -> String {
            cached.clone()
        }

        fn apply_update(&self, mut cached: String, update: &char) -> String {
            cached.push(*update);
            cached
        }

        fn split_for_write(
            &self,
            _key: &u64,
            cached: String,
            _previous_failed: Option<String>,
        ) -> (String, String) {
            (cached.clone(), cached)
        }
    }

    #[test]
    fn test_new_entry_is_loading_and_clean() {
        let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
        let body = entry.body.lock();
        assert_eq!(body.state, EntryState::Loading);
        assert!(!body.is_dirty());
        assert!(body.payload.is_none());
    }

    #[test]
    fn test_log_append_and_overflow() {
        let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
        let mut body = entry.body.lock();
        assert!(!body.append_update('a', 2));
        assert!(!body.append_update('b', 2));
        assert!(body.append_update('c', 2));
        // Only the crossing append reports the overflow.
        assert!(!body.append_update('d', 2));
        assert!(body.resync_overdue);
        assert_eq!(body.pending_update_count(), 4);
    }

    #[test]
    fn test_take_log_clears_dirtiness() {
        let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
        let mut body = entry.body.lock();
        body.append_update('a', 8);
        body.dirty = true;
        let log: Vec<char> = body.take_log().into_iter().collect();
        assert_eq!(log, vec!['a']);
        assert!(!body.is_dirty());
    }

    #[test]
    fn test_retained_failed_write_keeps_entry_dirty() {
        let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
        let mut body = entry.body.lock();
        body.pending_write = Some("w".to_string());
        assert!(body.is_dirty());
    }

    #[test]
    fn test_late_resync_detection() {
        let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
        let mut body = entry.body.lock();
        body.cycle_count = 3;
        body.cycle_at_resync_start = 3;
        assert!(!body.resync_is_late());
        body.cycle_count = 4;
        assert!(body.resync_is_late());
        body.cycle_count = 3;
        body.resync_overdue = true;
        assert!(body.resync_is_late());
    }

    #[test]
    fn test_state_flight_classification() {
        assert!(EntryState::Loading.read_in_flight());
        assert!(EntryState::Resyncing.read_in_flight());
        assert!(!EntryState::Loaded.read_in_flight());
        assert!(EntryState::Writing.write_in_flight());
        assert!(!EntryState::Loaded.write_in_flight());
    }

    mod properties {
        use super::*;
        use proptest::prelude::*;

        proptest! {
            // Replay order is what makes resync merges deterministic.
            #[test]
            fn log_preserves_submission_order(updates in proptest::collection::vec(proptest::char::any(), 0..64)) {
                let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
                let mut body = entry.body.lock();
                for update in &updates {
                    body.append_update(*update, 1_000);
                }
                let drained: Vec<char> = body.take_log().into_iter().collect();
                prop_assert_eq!(drained, updates);
            }

            #[test]
            fn overflow_reported_exactly_once(max in 1usize..16, extra in 0usize..16) {
                let entry: CacheEntry<NoopAdapter> = CacheEntry::new(1, 0);
                let mut body = entry.body.lock();
                let mut overflow_reports = 0;
                for _ in 0..(max + extra) {
                    if body.append_update('u', max) {
                        overflow_reports += 1;
                    }
                }
                prop_assert_eq!(overflow_reports, usize::from(extra > 0));
                prop_assert_eq!(body.resync_overdue, extra > 0);
            }
        }
    }
}
