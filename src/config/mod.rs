//! Configuration for the write-behind cache and the task execution service
//!
//! This module provides:
//! - Typed configuration structs with validated defaults
//! - A parser for flat string-keyed option maps
//! - Thread-pool sizing including the inline-execution sentinel
//! - Policy enums for final-failure and resync handling

use std::collections::HashMap;
use std::str::FromStr;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// Configuration errors
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum ConfigError {
    /// Option key is not recognised
    #[error("unknown option: {0}")]
    UnknownOption(String),

    /// Option value could not be parsed
    #[error("invalid value for {option}: {value}")]
    InvalidValue {
        /// Option key
        option: String,
        /// Offending value
        value: String,
    },

    /// Configuration is internally inconsistent
    #[error("invalid configuration: {0}")]
    Validation(String),
}

/// Result type for configuration operations
pub type ConfigResult<T> = Result<T, ConfigError>;

/// Worker pool sizing
///
/// `Inline` (written `[-1,-1]` in option maps) means no pool is created and
/// work executes synchronously on the stage processor task. Used when the
/// storage routine batches internally and extra concurrency buys nothing.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum PoolSize {
    /// Execute on the stage processor task, no pool
    Inline,
    /// Pool bounded to `[min, max]` concurrent workers
    Pooled {
        /// Workers kept alive when idle
        min: u32,
        /// Maximum concurrent workers
        max: u32,
    },
}

impl PoolSize {
    /// Maximum concurrency granted by this pool shape, if pooled
    pub fn max_concurrency(&self) -> Option<usize> {
        match self {
            PoolSize::Inline => None,
            PoolSize::Pooled { max, .. } => Some(*max as usize),
        }
    }
}

impl FromStr for PoolSize {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        if trimmed.eq_ignore_ascii_case("inline") || trimmed == "[-1,-1]" {
            return Ok(PoolSize::Inline);
        }
        let inner = trimmed
            .strip_prefix('[')
            .and_then(|s| s.strip_suffix(']'))
            .ok_or_else(|| format!("expected [min,max] or inline, got {s}"))?;
        let mut parts = inner.splitn(2, ',');
        let min: i64 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| format!("bad pool min in {s}"))?;
        let max: i64 = parts
            .next()
            .and_then(|p| p.trim().parse().ok())
            .ok_or_else(|| format!("bad pool max in {s}"))?;
        if min == -1 && max == -1 {
            return Ok(PoolSize::Inline);
        }
        if min < 0 || max < 0 || min > max || max == 0 {
            return Err(format!("pool bounds out of range: [{min},{max}]"));
        }
        Ok(PoolSize::Pooled {
            min: min as u32,
            max: max as u32,
        })
    }
}

/// Action taken when the initial storage read fails permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum InitialReadFailedAction {
    /// Drop the entry; waiting readers fail, later reads re-attempt
    RemoveFromCache,
    /// Keep the failed entry so readers fail fast instead of re-reading
    KeepAndThrow,
}

/// Action taken when a resync completes after its cycle already rolled over
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncTooLateAction {
    /// Adopt the freshly-read data, discarding collected updates
    SetDirectly,
    /// Adopt the freshly-read data and replay collected updates anyway
    MergeData,
    /// Keep the current in-memory data, drop the refresh result
    ClearReadPendingStatus,
    /// Evict the entry outright
    RemoveFromCache,
    /// Leave the entry untouched. Dangerous; documented for completeness
    /// and treated as `ClearReadPendingStatus` unless explicitly enabled
    /// via [`CacheConfig::allow_dangerous_do_nothing`]
    DoNothing,
}

/// Action taken when a resync read fails permanently
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ResyncFailedFinalAction {
    /// Evict the entry
    RemoveFromCache,
    /// Keep the entry but refuse further updates
    StopCollectingUpdates,
    /// Keep the entry and keep collecting updates for later writes
    KeepCollectingUpdates,
}

/// Write-behind cache configuration
///
/// Defaults are applied once at construction; [`CacheConfig::validate`]
/// rejects inconsistent combinations. All durations are monotonic-clock
/// relative.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CacheConfig {
    /// Identifier used in events and task names
    pub cache_name: String,
    /// Soft backpressure threshold; cycle times compress above it
    pub main_queue_max_target_size: usize,
    /// Hard rejection threshold for new entries
    pub max_cache_elements_hard_limit: usize,
    /// Per-entry update log cap; overflow marks the entry resync-overdue
    pub max_updates_to_collect: usize,
    /// Target time an entry spends in the main queue per cycle
    pub main_queue_cache_time: Duration,
    /// Minimum dwell; size pressure never compresses a cycle below this
    pub main_queue_cache_time_min: Duration,
    /// Post-write dwell before an entry may be evicted
    pub return_queue_cache_time_min: Duration,
    /// Whether a previously-failed write may be merged into the next split
    pub can_merge_writes: bool,
    /// Policy for permanent initial-read failures
    pub initial_read_failed_final_action: InitialReadFailedAction,
    /// Policy for resyncs that return after their cycle rolled over
    pub resync_too_late_action: ResyncTooLateAction,
    /// Policy for permanent resync failures
    pub resync_failed_final_action: ResyncFailedFinalAction,
    /// Opt-in for the literal `DoNothing` too-late semantics
    pub allow_dangerous_do_nothing: bool,
    /// Whether dirty data may still be written after a permanent resync failure
    pub allow_data_writing_after_resync_failed_final: bool,
    /// Whether stale data may still be read after a permanent resync failure
    pub allow_data_reading_after_resync_failed_final: bool,
    /// Whether updates may be carried across additional full cycles while
    /// waiting for a write to land
    pub allow_updates_collection_for_multiple_full_cycles: bool,
    /// Read worker pool shape
    pub read_thread_pool_size: PoolSize,
    /// Write worker pool shape
    pub write_thread_pool_size: PoolSize,
    /// Read inbound batching delay; zero disables batching
    pub read_queue_batching_delay: Duration,
    /// Write inbound batching delay; zero disables batching
    pub write_queue_batching_delay: Duration,
    /// Storage read attempts allowed before a failure is final
    pub read_failure_max_retry_count: u32,
    /// Storage write attempts allowed before a failure is final
    pub write_failure_max_retry_count: u32,
    /// Failed full cycles tolerated before the entry is dropped
    pub full_cache_cycle_failure_max_retry_count: u32,
    /// Post-write requeues tolerated before a forced eviction
    pub return_queue_max_requeue_count: u32,
    /// Retries against the entry table when racing a concurrent eviction
    pub max_cache_removed_retries: u32,
    /// Upper bound on any internal sleep; bounds shutdown and clock-change
    /// responsiveness
    pub max_sleep_time: Duration,
    /// Serve reads from entries whose refresh is still in flight
    pub accept_out_of_order_reads: bool,
    /// Sliding window length for event throttling
    pub log_throttle_time_interval: Duration,
    /// Events of one classifier allowed per throttle window
    pub log_throttle_max_messages_of_type_per_time_interval: u32,
    /// Deliver every event (pre-throttle) to the registered observer
    pub event_notification_enabled: bool,
}

impl Default for CacheConfig {
    fn default() -> Self {
        let cache_time = Duration::from_secs(30);
        Self {
            cache_name: "cache".to_string(),
            main_queue_max_target_size: 1_000,
            max_cache_elements_hard_limit: 2_000,
            max_updates_to_collect: 128,
            main_queue_cache_time: cache_time,
            main_queue_cache_time_min: cache_time / 10,
            return_queue_cache_time_min: Duration::from_secs(5),
            can_merge_writes: false,
            initial_read_failed_final_action: InitialReadFailedAction::RemoveFromCache,
            resync_too_late_action: ResyncTooLateAction::ClearReadPendingStatus,
            resync_failed_final_action: ResyncFailedFinalAction::KeepCollectingUpdates,
            allow_dangerous_do_nothing: false,
            allow_data_writing_after_resync_failed_final: true,
            allow_data_reading_after_resync_failed_final: true,
            allow_updates_collection_for_multiple_full_cycles: true,
            read_thread_pool_size: PoolSize::Pooled { min: 1, max: 4 },
            write_thread_pool_size: PoolSize::Pooled { min: 1, max: 4 },
            read_queue_batching_delay: Duration::ZERO,
            write_queue_batching_delay: Duration::ZERO,
            read_failure_max_retry_count: 3,
            write_failure_max_retry_count: 3,
            full_cache_cycle_failure_max_retry_count: 3,
            return_queue_max_requeue_count: 5,
            max_cache_removed_retries: 5,
            max_sleep_time: Duration::from_millis(100),
            accept_out_of_order_reads: false,
            log_throttle_time_interval: Duration::from_secs(60),
            log_throttle_max_messages_of_type_per_time_interval: 10,
            event_notification_enabled: false,
        }
    }
}

impl CacheConfig {
    /// Create a configuration with the given cache name and defaults elsewhere
    pub fn new(cache_name: impl Into<String>) -> Self {
        Self {
            cache_name: cache_name.into(),
            ..Self::default()
        }
    }

    /// Set the main-queue cycle time, deriving the minimum dwell as one
    /// tenth of it
    pub fn with_cache_time(mut self, cache_time: Duration) -> Self {
        self.main_queue_cache_time = cache_time;
        self.main_queue_cache_time_min = cache_time / 10;
        self
    }

    /// Set the post-write dwell
    pub fn with_return_queue_time(mut self, dwell: Duration) -> Self {
        self.return_queue_cache_time_min = dwell;
        self
    }

    /// Set the soft target size and derive the hard limit as twice the target
    pub fn with_target_size(mut self, target: usize) -> Self {
        self.main_queue_max_target_size = target;
        self.max_cache_elements_hard_limit = target * 2;
        self
    }

    /// Parse a flat option map as described in the option table
    ///
    /// Unknown keys are rejected so that typos surface at startup rather
    /// than as silently-ignored tuning.
    pub fn from_map(options: &HashMap<String, String>) -> ConfigResult<Self> {
        let mut config = Self::default();
        let mut hard_limit_explicit = false;
        let mut cache_time_min_explicit = false;

        for (key, value) in options {
            match key.as_str() {
                "cacheName" => config.cache_name = value.clone(),
                "mainQueueMaxTargetSize" => {
                    config.main_queue_max_target_size = parse_num(key, value)?
                }
                "maxCacheElementsHardLimit" => {
                    config.max_cache_elements_hard_limit = parse_num(key, value)?;
                    hard_limit_explicit = true;
                }
                "maxUpdatesToCollect" => config.max_updates_to_collect = parse_num(key, value)?,
                "mainQueueCacheTime" => config.main_queue_cache_time = parse_millis(key, value)?,
                "mainQueueCacheTimeMin" => {
                    config.main_queue_cache_time_min = parse_millis(key, value)?;
                    cache_time_min_explicit = true;
                }
                "returnQueueCacheTimeMin" => {
                    config.return_queue_cache_time_min = parse_millis(key, value)?
                }
                "canMergeWrites" => config.can_merge_writes = parse_bool(key, value)?,
                "initialReadFailedFinalAction" => {
                    config.initial_read_failed_final_action = match value.as_str() {
                        "REMOVE_FROM_CACHE" => InitialReadFailedAction::RemoveFromCache,
                        "KEEP_AND_THROW" => InitialReadFailedAction::KeepAndThrow,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "resyncTooLateAction" => {
                    config.resync_too_late_action = match value.as_str() {
                        "SET_DIRECTLY" => ResyncTooLateAction::SetDirectly,
                        "MERGE_DATA" => ResyncTooLateAction::MergeData,
                        "CLEAR_READ_PENDING_STATUS" => ResyncTooLateAction::ClearReadPendingStatus,
                        "REMOVE_FROM_CACHE" => ResyncTooLateAction::RemoveFromCache,
                        "DO_NOTHING" => ResyncTooLateAction::DoNothing,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "resyncFailedFinalAction" => {
                    config.resync_failed_final_action = match value.as_str() {
                        "REMOVE_FROM_CACHE" => ResyncFailedFinalAction::RemoveFromCache,
                        "STOP_COLLECTING_UPDATES" => ResyncFailedFinalAction::StopCollectingUpdates,
                        "KEEP_COLLECTING_UPDATES" => ResyncFailedFinalAction::KeepCollectingUpdates,
                        _ => return Err(invalid(key, value)),
                    }
                }
                "allowDangerousDoNothing" => {
                    config.allow_dangerous_do_nothing = parse_bool(key, value)?
                }
                "allowDataWritingAfterResyncFailedFinal" => {
                    config.allow_data_writing_after_resync_failed_final = parse_bool(key, value)?
                }
                "allowDataReadingAfterResyncFailedFinal" => {
                    config.allow_data_reading_after_resync_failed_final = parse_bool(key, value)?
                }
                "allowUpdatesCollectionForMultipleFullCycles" => {
                    config.allow_updates_collection_for_multiple_full_cycles =
                        parse_bool(key, value)?
                }
                "readThreadPoolSize" => {
                    config.read_thread_pool_size =
                        value.parse().map_err(|_| invalid(key, value))?
                }
                "writeThreadPoolSize" => {
                    config.write_thread_pool_size =
                        value.parse().map_err(|_| invalid(key, value))?
                }
                "readQueueBatchingDelay" => {
                    config.read_queue_batching_delay = parse_millis(key, value)?
                }
                "writeQueueBatchingDelay" => {
                    config.write_queue_batching_delay = parse_millis(key, value)?
                }
                "readFailureMaxRetryCount" => {
                    config.read_failure_max_retry_count = parse_num(key, value)?
                }
                "writeFailureMaxRetryCount" => {
                    config.write_failure_max_retry_count = parse_num(key, value)?
                }
                "fullCacheCycleFailureMaxRetryCount" => {
                    config.full_cache_cycle_failure_max_retry_count = parse_num(key, value)?
                }
                "returnQueueMaxRequeueCount" => {
                    config.return_queue_max_requeue_count = parse_num(key, value)?
                }
                "maxCacheRemovedRetries" => {
                    config.max_cache_removed_retries = parse_num(key, value)?
                }
                "maxSleepTime" => config.max_sleep_time = parse_millis(key, value)?,
                "acceptOutOfOrderReads" => {
                    config.accept_out_of_order_reads = parse_bool(key, value)?
                }
                "logThrottleTimeInterval" => {
                    config.log_throttle_time_interval = parse_millis(key, value)?
                }
                "logThrottleMaxMessagesOfTypePerTimeInterval" => {
                    config.log_throttle_max_messages_of_type_per_time_interval =
                        parse_num(key, value)?
                }
                "eventNotificationEnabled" => {
                    config.event_notification_enabled = parse_bool(key, value)?
                }
                _ => return Err(ConfigError::UnknownOption(key.clone())),
            }
        }

        if !hard_limit_explicit {
            config.max_cache_elements_hard_limit = config.main_queue_max_target_size * 2;
        }
        if !cache_time_min_explicit {
            config.main_queue_cache_time_min = config.main_queue_cache_time / 10;
        }

        config.validate()?;
        Ok(config)
    }

    /// Load configuration from a JSON file
    pub fn from_file(path: &str) -> Result<Self, Box<dyn std::error::Error>> {
        let contents = std::fs::read_to_string(path)?;
        let config: CacheConfig = serde_json::from_str(&contents)?;
        config.validate()?;
        Ok(config)
    }

    /// Check internal consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.cache_name.is_empty() {
            return Err(ConfigError::Validation("cacheName must not be empty".into()));
        }
        if self.main_queue_cache_time.is_zero() {
            return Err(ConfigError::Validation(
                "mainQueueCacheTime must be positive".into(),
            ));
        }
        if self.main_queue_cache_time_min > self.main_queue_cache_time {
            return Err(ConfigError::Validation(
                "mainQueueCacheTimeMin exceeds mainQueueCacheTime".into(),
            ));
        }
        if self.max_cache_elements_hard_limit < self.main_queue_max_target_size {
            return Err(ConfigError::Validation(
                "maxCacheElementsHardLimit below mainQueueMaxTargetSize".into(),
            ));
        }
        if self.max_sleep_time.is_zero() {
            return Err(ConfigError::Validation("maxSleepTime must be positive".into()));
        }
        if self.log_throttle_time_interval.is_zero() {
            return Err(ConfigError::Validation(
                "logThrottleTimeInterval must be positive".into(),
            ));
        }
        if self.max_updates_to_collect == 0 {
            return Err(ConfigError::Validation(
                "maxUpdatesToCollect must be positive".into(),
            ));
        }
        Ok(())
    }

    /// Effective too-late action after applying the safety override
    pub fn effective_resync_too_late_action(&self) -> ResyncTooLateAction {
        match self.resync_too_late_action {
            ResyncTooLateAction::DoNothing if !self.allow_dangerous_do_nothing => {
                ResyncTooLateAction::ClearReadPendingStatus
            }
            action => action,
        }
    }
}

/// Retry-and-rate-limit service configuration
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RrlConfig {
    /// Identifier used in events and task names
    pub service_name: String,
    /// Attempts allowed per request before a transient failure is final
    pub max_attempts: u32,
    /// Token bucket capacity (burst size)
    pub rate_limit_capacity: u64,
    /// Token bucket refill rate, tokens per second
    pub rate_limit_refill_per_sec: f64,
    /// Maximum concurrently-executing requests
    pub max_concurrency: usize,
    /// Base delay before the first retry
    pub retry_backoff_base: Duration,
    /// Multiplier applied per additional attempt
    pub retry_backoff_multiplier: f64,
    /// Random jitter fraction added to each backoff
    pub retry_backoff_jitter: f64,
    /// Deadline applied by `submit` when the caller supplies none
    pub default_timeout: Duration,
    /// Pending-request cap; submissions beyond it are rejected
    pub max_pending_requests: usize,
    /// Upper bound on any internal sleep
    pub max_sleep_time: Duration,
    /// Sliding window length for event throttling
    pub log_throttle_time_interval: Duration,
    /// Events of one classifier allowed per throttle window
    pub log_throttle_max_messages_of_type_per_time_interval: u32,
}

impl Default for RrlConfig {
    fn default() -> Self {
        Self {
            service_name: "rrl".to_string(),
            max_attempts: 3,
            rate_limit_capacity: 10,
            rate_limit_refill_per_sec: 10.0,
            max_concurrency: 4,
            retry_backoff_base: Duration::from_millis(100),
            retry_backoff_multiplier: 2.0,
            retry_backoff_jitter: 0.1,
            default_timeout: Duration::from_secs(30),
            max_pending_requests: 10_000,
            max_sleep_time: Duration::from_millis(100),
            log_throttle_time_interval: Duration::from_secs(60),
            log_throttle_max_messages_of_type_per_time_interval: 10,
        }
    }
}

impl RrlConfig {
    /// Create a configuration with the given service name and defaults elsewhere
    pub fn new(service_name: impl Into<String>) -> Self {
        Self {
            service_name: service_name.into(),
            ..Self::default()
        }
    }

    /// Set the token bucket shape
    pub fn with_rate(mut self, capacity: u64, refill_per_sec: f64) -> Self {
        self.rate_limit_capacity = capacity;
        self.rate_limit_refill_per_sec = refill_per_sec;
        self
    }

    /// Set the retry budget
    pub fn with_max_attempts(mut self, attempts: u32) -> Self {
        self.max_attempts = attempts;
        self
    }

    /// Set the worker concurrency bound
    pub fn with_concurrency(mut self, workers: usize) -> Self {
        self.max_concurrency = workers;
        self
    }

    /// Check internal consistency
    pub fn validate(&self) -> ConfigResult<()> {
        if self.max_attempts == 0 {
            return Err(ConfigError::Validation("max_attempts must be positive".into()));
        }
        if self.rate_limit_refill_per_sec <= 0.0 {
            return Err(ConfigError::Validation(
                "rate_limit_refill_per_sec must be positive".into(),
            ));
        }
        if self.max_concurrency == 0 {
            return Err(ConfigError::Validation("max_concurrency must be positive".into()));
        }
        if self.retry_backoff_multiplier < 1.0 {
            return Err(ConfigError::Validation(
                "retry_backoff_multiplier must be at least 1".into(),
            ));
        }
        Ok(())
    }
}

fn invalid(option: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        option: option.to_string(),
        value: value.to_string(),
    }
}

fn parse_num<T: FromStr>(option: &str, value: &str) -> ConfigResult<T> {
    value.trim().parse().map_err(|_| invalid(option, value))
}

fn parse_millis(option: &str, value: &str) -> ConfigResult<Duration> {
    let millis: u64 = parse_num(option, value)?;
    Ok(Duration::from_millis(millis))
}

fn parse_bool(option: &str, value: &str) -> ConfigResult<bool> {
    match value.trim() {
        "true" | "TRUE" | "1" => Ok(true),
        "false" | "FALSE" | "0" => Ok(false),
        _ => Err(invalid(option, value)),
    }
}
