//! Storage adapter contract supplied by the embedding application
//!
//! The cache is generic over seven shapes, bundled here as associated types:
//! the key, the value returned to callers, the in-cache representation, the
//! raw storage read and write shapes, and the external/internal update
//! shapes. The adapter also supplies the conversions between them and the
//! two storage calls.

use std::fmt::Debug;
use std::hash::Hash;

use async_trait::async_trait;

use crate::error::StorageError;

/// User-supplied port bundling storage access and shape conversions
///
/// `read_from_storage` and `write_to_storage` may block for arbitrary
/// periods and are always invoked without any entry lock held. Every other
/// method must be fast and non-blocking: the cache calls them inside the
/// per-entry critical section.
#[async_trait]
pub trait CacheAdapter: Send + Sync + 'static {
    /// Cache key
    type Key: Eq + Hash + Clone + Debug + Send + Sync + 'static;
    /// Value handed back to callers
    type Value: Send + 'static;
    /// In-cache representation, mutated in place by updates
    type Cached: Send + 'static;
    /// Raw shape produced by a storage read
    type StorageRead: Send + 'static;
    /// Raw shape consumed by a storage write; cloned for retries
    type StorageWrite: Clone + Send + 'static;
    /// Update shape supplied by external callers
    type Update: Send + 'static;
    /// Update shape retained in the per-entry log
    type LogEntry: Send + 'static;

    /// Read the backing-store data for a key
    ///
    /// `is_refresh` distinguishes the initial population read from a
    /// background reconciliation read of an already-cached entry.
    async fn read_from_storage(
        &self,
        key: &Self::Key,
        is_refresh: bool,
    ) -> Result<Self::StorageRead, StorageError>;

    /// Persist previously-split write data for a key
    async fn write_to_storage(
        &self,
        key: &Self::Key,
        write: Self::StorageWrite,
    ) -> Result<(), StorageError>;

    /// Convert a caller-supplied update into its logged form
    fn to_internal_update(&self, key: &Self::Key, update: Self::Update) -> Self::LogEntry;

    /// Convert freshly-read storage data into the in-cache representation
    fn to_cache_format(&self, key: &Self::Key, raw: Self::StorageRead) -> Self::Cached;

    /// Produce the caller-facing value from the in-cache representation
    fn to_return_value(&self, key: &Self::Key, cached: &Self::Cached) -> Self::Value;

    /// Apply one logged update to the in-cache representation
    ///
    /// Invoked once per update on caller writes and again when replaying
    /// the log over a freshly-resynced base, always in submission order.
    fn apply_update(&self, cached: Self::Cached, update: &Self::LogEntry) -> Self::Cached;

    /// Decide what to retain in memory and what to send to storage
    ///
    /// `previous_failed` carries the write data of a permanently-failed
    /// earlier attempt when merged writes are enabled, so the adapter can
    /// fold it into the outgoing data.
    fn split_for_write(
        &self,
        key: &Self::Key,
        cached: Self::Cached,
        previous_failed: Option<Self::StorageWrite>,
    ) -> (Self::Cached, Self::StorageWrite);
}
