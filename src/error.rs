//! Error types shared across the caching and task-execution cores
//!
//! Errors are classified along three axes: origin (external storage vs
//! internal), recovery (transient vs permanent), and data impact. Storage
//! adapters report [`StorageError`]; callers of the public cache API see
//! [`CacheError`].

use thiserror::Error;

/// Failure reported by a storage adapter call
///
/// The stage that invoked the adapter decides what to do with it: transient
/// failures are retried up to the configured budget, permanent failures go
/// straight to the final-failure policy.
#[derive(Error, Debug, Clone)]
pub enum StorageError {
    /// Recoverable failure, eligible for retry
    #[error("transient storage failure: {0}")]
    Transient(String),

    /// Unrecoverable failure, retrying is pointless
    #[error("permanent storage failure: {0}")]
    Permanent(String),
}

impl StorageError {
    /// Whether this failure may be retried
    pub fn is_transient(&self) -> bool {
        matches!(self, StorageError::Transient(_))
    }
}

/// Errors surfaced by the public cache API
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum CacheError {
    /// Entry has no usable payload yet (still loading, or updates/reads are
    /// not permitted in its current state)
    #[error("cache entry is not loaded")]
    NotLoaded,

    /// Initial storage read failed after all retries
    #[error("initial storage read failed permanently")]
    ReadFailedFinal,

    /// Background resync read failed after all retries and the configuration
    /// forbids serving the stale in-memory value
    #[error("background resync failed permanently")]
    ResyncFailedFinal,

    /// Entry count reached the configured hard limit
    #[error("cache is full: hard element limit of {0} reached")]
    CacheFull(usize),

    /// The cache has been shut down; no further operations are accepted
    #[error("cache is shut down")]
    Shutdown,

    /// Internal invariant violation; the offending entry has been dropped
    /// from the cache
    #[error("internal assertion failed: {0}")]
    AssertionFailed(String),
}

/// Result type for public cache operations
pub type CacheResult<T> = Result<T, CacheError>;
