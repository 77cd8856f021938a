//! # STRATUS - Write-Behind Caching & Async Task Execution
//!
//! A write-behind, resync-in-background cache for slow, externally-owned
//! backing stores, plus a rate-limited asynchronous task executor built on
//! the same scheduling and failure-handling patterns.
//!
//! ## Architecture
//!
//! - `cache`: the write-behind core: entry table, read stage, main queue,
//!   write stage, return queue
//! - `rrl`: retry-and-rate-limit request execution with token-bucket gating
//! - `events`: severity-typed, throttled event bus shared by both cores
//! - `config`: validated configuration with a flat option-map parser
//! - `error`: the transient/permanent/final error taxonomy
//!
//! ## Quick Start
//!
//! ```rust,no_run
//! use std::time::Duration;
//! use stratus::{CacheConfig, WriteBehindCache};
//! # use stratus::{CacheAdapter, StorageError};
//! # use async_trait::async_trait;
//! # struct MyAdapter;
//! # #[async_trait]
//! # impl CacheAdapter for MyAdapter {
//! #     type Key = u64;
//! #     type Value = String;
//! #     type Cached = String;
//! #     type StorageRead = String;
//! #     type StorageWrite = String;
//! #     type Update = String;
//! #     type LogEntry = String;
//! #     async fn read_from_storage(&self, _: &u64, _: bool) -> Result<String, StorageError> { Ok(String::new()) }
//! #     async fn write_to_storage(&self, _: &u64, _: String) -> Result<(), StorageError> { Ok(()) }
//! #     fn to_internal_update(&self, _: &u64, u: String) -> String { u }
//! #     fn to_cache_format(&self, _: &u64, r: String) -> String { r }
//! #     fn to_return_value(&self, _: &u64, c: &String) -> String { c.clone() }
//! #     fn apply_update(&self, mut c: String, u: &String) -> String { c.push_str(u); c }
//! #     fn split_for_write(&self, _: &u64, c: String, _: Option<String>) -> (String, String) { (c.clone(), c) }
//! # }
//!
//! # async fn example() -> Result<(), Box<dyn std::error::Error>> {
//! let config = CacheConfig::new("sessions").with_cache_time(Duration::from_secs(10));
//! let cache = WriteBehindCache::new(config, MyAdapter)?;
//! cache.start()?;
//!
//! cache.preload(42).await?;
//! let value = cache.read_for(42, Duration::from_secs(5)).await?;
//! cache.write_if_cached(42, "update".to_string())?;
//!
//! let undrained = cache.shutdown_for(Duration::from_secs(30), true, true).await;
//! assert_eq!(undrained, 0);
//! # Ok(())
//! # }
//! ```

#![warn(missing_docs)]
#![warn(clippy::all)]

// Write-behind cache core
pub mod cache;

// Configuration
pub mod config;

// Error taxonomy
pub mod error;

// Event bus
pub mod events;

// Retry-and-rate-limit service
pub mod rrl;

// Re-export commonly used types
pub use cache::{CacheAdapter, CacheStatus, WriteBehindCache};
pub use config::{CacheConfig, ConfigError, PoolSize, RrlConfig};
pub use error::{CacheError, CacheResult, StorageError};
pub use events::{CacheEvent, EventListener, EventRecord, EventSeverity};
pub use rrl::{
    RequestFailure, RequestHandle, RequestProcessor, RrlError, RrlResult, RrlService,
};

/// Re-export version information
pub const VERSION: &str = env!("CARGO_PKG_VERSION");

/// Re-export crate name
pub const NAME: &str = env!("CARGO_PKG_NAME");
