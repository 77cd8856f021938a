//! Entry table: the single owner of all cache entries
//!
//! Backed by a concurrent map with atomic insert-if-absent so that N racing
//! preloads for one key create exactly one entry (and therefore exactly one
//! initial storage read). A separate atomic element count enforces the hard
//! limit without racing concurrent inserts.

use std::sync::atomic::{AtomicU64, AtomicUsize, Ordering};
use std::sync::Arc;

use dashmap::mapref::entry::Entry;
use dashmap::DashMap;

use crate::cache::adapter::CacheAdapter;
use crate::cache::entry::CacheEntry;
use crate::error::CacheError;

/// Outcome of a find-or-create lookup
pub(crate) enum Lookup<A: CacheAdapter> {
    /// Entry was created by this call; the caller must schedule its
    /// initial read
    Created(Arc<CacheEntry<A>>),
    /// Entry already existed
    Existing(Arc<CacheEntry<A>>),
}

pub(crate) struct EntryTable<A: CacheAdapter> {
    entries: DashMap<A::Key, Arc<CacheEntry<A>>>,
    count: AtomicUsize,
    generation: AtomicU64,
    hard_limit: usize,
}

impl<A: CacheAdapter> EntryTable<A> {
    pub fn new(hard_limit: usize) -> Self {
        Self {
            entries: DashMap::new(),
            count: AtomicUsize::new(0),
            generation: AtomicU64::new(0),
            hard_limit,
        }
    }

    /// Live entry count
    pub fn len(&self) -> usize {
        self.count.load(Ordering::Relaxed)
    }

    pub fn get(&self, key: &A::Key) -> Option<Arc<CacheEntry<A>>> {
        self.entries.get(key).map(|e| e.value().clone())
    }

    /// Resolve a queue handle; stale generations resolve to nothing
    pub fn resolve(&self, key: &A::Key, generation: u64) -> Option<Arc<CacheEntry<A>>> {
        self.get(key).filter(|e| e.generation == generation)
    }

    /// Find the entry for a key, creating it in `Loading` state if absent
    pub fn find_or_create(&self, key: &A::Key) -> Result<Lookup<A>, CacheError> {
        match self.entries.entry(key.clone()) {
            Entry::Occupied(occupied) => Ok(Lookup::Existing(occupied.get().clone())),
            Entry::Vacant(vacant) => {
                let admitted = self
                    .count
                    .fetch_update(Ordering::AcqRel, Ordering::Acquire, |n| {
                        if n >= self.hard_limit {
                            None
                        } else {
                            Some(n + 1)
                        }
                    })
                    .is_ok();
                if !admitted {
                    return Err(CacheError::CacheFull(self.hard_limit));
                }
                let generation = self.generation.fetch_add(1, Ordering::Relaxed);
                let entry = Arc::new(CacheEntry::new(key.clone(), generation));
                vacant.insert(entry.clone());
                Ok(Lookup::Created(entry))
            }
        }
    }

    /// Remove the given incarnation of a key
    ///
    /// A no-op if the key has since been removed or re-created under a newer
    /// generation.
    pub fn remove(&self, key: &A::Key, generation: u64) -> Option<Arc<CacheEntry<A>>> {
        let removed = self
            .entries
            .remove_if(key, |_, entry| entry.generation == generation)
            .map(|(_, entry)| entry);
        if removed.is_some() {
            self.count.fetch_sub(1, Ordering::AcqRel);
        }
        removed
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cache::entry::EntryState;
    use crate::error::StorageError;
    use async_trait::async_trait;

    struct NoopAdapter;

    #[async_trait]
    impl CacheAdapter for NoopAdapter {
        type Key = u64;
        type Value = u64;
        type Cached = u64;
        type StorageRead = u64;
        type StorageWrite = u64;
        type Update = u64;
        type LogEntry = u64;

        async fn read_from_storage(&self, key: &u64, _r: bool) -> Result<u64, StorageError> {
            Ok(*key)
        }
        async fn write_to_storage(&self, _k: &u64, _w: u64) -> Result<(), StorageError> {
            Ok(())
        }
        fn to_internal_update(&self, _k: &u64, u: u64) -> u64 {
            u
        }
        fn to_cache_format(&self, _k: &u64, r: u64) -> u64 {
            r
        }
        fn to_return_value(&self, _k: &u64, c: &u64) -> u64 {
            *c
        }
        fn apply_update(&self, c: u64, u: &u64) -> u64 {
            c + u
        }
        fn split_for_write(&self, _k: &u64, c: u64, _p: Option<u64>) -> (u64, u64) {
            (c, c)
        }
    }

    #[test]
    fn test_find_or_create_is_idempotent() {
        let table: EntryTable<NoopAdapter> = EntryTable::new(10);
        let first = match table.find_or_create(&1).unwrap() {
            Lookup::Created(e) => e,
            Lookup::Existing(_) => panic!("expected creation"),
        };
        assert_eq!(first.body.lock().state, EntryState::Loading);
        assert!(matches!(table.find_or_create(&1).unwrap(), Lookup::Existing(_)));
        assert_eq!(table.len(), 1);
    }

    #[test]
    fn test_hard_limit_rejects_without_creating() {
        let table: EntryTable<NoopAdapter> = EntryTable::new(3);
        for key in 0..3 {
            assert!(matches!(table.find_or_create(&key), Ok(Lookup::Created(_))));
        }
        match table.find_or_create(&99) {
            Err(err) => assert_eq!(err, CacheError::CacheFull(3)),
            Ok(_) => panic!("expected cache full error"),
        }
        assert_eq!(table.len(), 3);
        assert!(table.get(&99).is_none());
    }

    #[test]
    fn test_remove_respects_generation() {
        let table: EntryTable<NoopAdapter> = EntryTable::new(10);
        let entry = match table.find_or_create(&1).unwrap() {
            Lookup::Created(e) => e,
            Lookup::Existing(_) => unreachable!(),
        };
        assert!(table.remove(&1, entry.generation + 1).is_none());
        assert!(table.remove(&1, entry.generation).is_some());
        assert_eq!(table.len(), 0);

        // A re-created key gets a fresh generation, so the old handle is stale.
        let recreated = match table.find_or_create(&1).unwrap() {
            Lookup::Created(e) => e,
            Lookup::Existing(_) => unreachable!(),
        };
        assert_ne!(recreated.generation, entry.generation);
        assert!(table.resolve(&1, entry.generation).is_none());
        assert!(table.resolve(&1, recreated.generation).is_some());
    }
}
