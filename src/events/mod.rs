//! Severity-typed event bus with sliding-window throttling
//!
//! This module provides:
//! - The typed event enumeration emitted by every cache stage
//! - Severity levels mapped onto `tracing` levels
//! - Per-classifier throttling over a sliding time window
//! - An optional observer hook that sees every event pre-throttle

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::DashMap;
use parking_lot::RwLock;
use serde::{Deserialize, Serialize};
use tokio::time::Instant;

/// Event severity levels
///
/// `External*` severities describe conditions caused by or affecting the
/// backing store; the remainder are internal cache conditions.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub enum EventSeverity {
    /// Diagnostic detail
    Debug,
    /// Routine lifecycle information
    Info,
    /// Unexpected but handled condition
    Warn,
    /// Routine backing-store information
    ExternalInfo,
    /// Backing-store condition worth attention
    ExternalWarn,
    /// Backing-store operation failed permanently
    ExternalError,
    /// Updates destined for the backing store were lost
    ExternalDataLoss,
    /// Internal error
    Error,
    /// Internal invariant violation
    Critical,
}

impl EventSeverity {
    /// Whether this severity describes a backing-store condition
    pub fn is_external(&self) -> bool {
        matches!(
            self,
            EventSeverity::ExternalInfo
                | EventSeverity::ExternalWarn
                | EventSeverity::ExternalError
                | EventSeverity::ExternalDataLoss
        )
    }
}

/// Events emitted by the cache and task-execution cores
///
/// Standard events carry a dedicated ordinal; free-form events go through
/// [`CacheEvent::NonStandard`] with a caller-supplied classifier.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum CacheEvent {
    /// Cache processors started
    Started,
    /// Shutdown requested
    ShutdownRequested,
    /// Entry completed its initial load
    EntryLoaded {
        /// Stringified entry key
        key: String,
    },
    /// Entry removed from the cache
    EntryEvicted {
        /// Stringified entry key
        key: String,
    },
    /// Transient read failure, retry scheduled
    StorageReadRetryIssued {
        /// Stringified entry key
        key: String,
        /// Attempt number that failed
        attempt: u32,
    },
    /// Initial read failed after all retries
    StorageReadFailFinal {
        /// Stringified entry key
        key: String,
    },
    /// Resync read failed after all retries
    StorageResyncFailFinal {
        /// Stringified entry key
        key: String,
    },
    /// Resync returned after its cycle already rolled over
    ResyncTooLate {
        /// Stringified entry key
        key: String,
    },
    /// Per-entry update log exceeded its bound
    UpdateLogOverflow {
        /// Stringified entry key
        key: String,
        /// Log size at overflow
        size: usize,
    },
    /// Transient write failure, retry scheduled
    StorageWriteRetryIssued {
        /// Stringified entry key
        key: String,
        /// Attempt number that failed
        attempt: u32,
    },
    /// Write failed after all retries
    StorageWriteFailFinal {
        /// Stringified entry key
        key: String,
    },
    /// Collected updates were dropped before reaching the backing store
    UpdatesLost {
        /// Stringified entry key
        key: String,
        /// Number of updates dropped
        pending_updates: usize,
    },
    /// Stale in-memory value served after a permanent resync failure
    StaleValueServed {
        /// Stringified entry key
        key: String,
    },
    /// A reader observed the pre-resync value while the refresh was in
    /// flight; the merge has now superseded what it saw
    OutOfOrderReadObserved {
        /// Stringified entry key
        key: String,
    },
    /// Internal invariant violation
    AssertionFailed {
        /// Violation description
        message: String,
    },
    /// Summary of events suppressed by throttling in the closed window
    ThrottledEventsSkipped {
        /// Classifier whose window closed
        classifier: String,
        /// Suppressed event count
        skipped: u64,
    },
    /// Free-form event with a caller-supplied classifier
    NonStandard {
        /// Throttling classifier
        classifier: String,
        /// Severity to report at
        severity: EventSeverity,
        /// Event text
        message: String,
    },
}

impl CacheEvent {
    /// Severity this event reports at
    pub fn severity(&self) -> EventSeverity {
        match self {
            CacheEvent::Started | CacheEvent::ShutdownRequested => EventSeverity::Info,
            CacheEvent::EntryLoaded { .. } | CacheEvent::EntryEvicted { .. } => {
                EventSeverity::Debug
            }
            CacheEvent::StorageReadRetryIssued { .. }
            | CacheEvent::StorageWriteRetryIssued { .. } => EventSeverity::ExternalInfo,
            CacheEvent::StorageReadFailFinal { .. }
            | CacheEvent::StorageResyncFailFinal { .. }
            | CacheEvent::StorageWriteFailFinal { .. } => EventSeverity::ExternalError,
            CacheEvent::ResyncTooLate { .. } | CacheEvent::UpdateLogOverflow { .. } => {
                EventSeverity::Warn
            }
            CacheEvent::UpdatesLost { .. } => EventSeverity::ExternalDataLoss,
            CacheEvent::StaleValueServed { .. } => EventSeverity::ExternalWarn,
            CacheEvent::OutOfOrderReadObserved { .. } => EventSeverity::Debug,
            CacheEvent::AssertionFailed { .. } => EventSeverity::Critical,
            CacheEvent::ThrottledEventsSkipped { .. } => EventSeverity::Warn,
            CacheEvent::NonStandard { severity, .. } => *severity,
        }
    }

    /// Dedicated ordinal for standard events, `None` for free-form ones
    pub fn ordinal(&self) -> Option<u16> {
        let ordinal = match self {
            CacheEvent::Started => 0,
            CacheEvent::ShutdownRequested => 1,
            CacheEvent::EntryLoaded { .. } => 2,
            CacheEvent::EntryEvicted { .. } => 3,
            CacheEvent::StorageReadRetryIssued { .. } => 4,
            CacheEvent::StorageReadFailFinal { .. } => 5,
            CacheEvent::StorageResyncFailFinal { .. } => 6,
            CacheEvent::ResyncTooLate { .. } => 7,
            CacheEvent::UpdateLogOverflow { .. } => 8,
            CacheEvent::StorageWriteRetryIssued { .. } => 9,
            CacheEvent::StorageWriteFailFinal { .. } => 10,
            CacheEvent::UpdatesLost { .. } => 11,
            CacheEvent::StaleValueServed { .. } => 12,
            CacheEvent::AssertionFailed { .. } => 13,
            CacheEvent::ThrottledEventsSkipped { .. } => 14,
            CacheEvent::OutOfOrderReadObserved { .. } => 15,
            CacheEvent::NonStandard { .. } => return None,
        };
        Some(ordinal)
    }

    /// Throttling classifier
    pub fn classifier(&self) -> &str {
        match self {
            CacheEvent::Started => "started",
            CacheEvent::ShutdownRequested => "shutdown_requested",
            CacheEvent::EntryLoaded { .. } => "entry_loaded",
            CacheEvent::EntryEvicted { .. } => "entry_evicted",
            CacheEvent::StorageReadRetryIssued { .. } => "storage_read_retry_issued",
            CacheEvent::StorageReadFailFinal { .. } => "storage_read_fail_final",
            CacheEvent::StorageResyncFailFinal { .. } => "storage_resync_fail_final",
            CacheEvent::ResyncTooLate { .. } => "resync_too_late",
            CacheEvent::UpdateLogOverflow { .. } => "update_log_overflow",
            CacheEvent::StorageWriteRetryIssued { .. } => "storage_write_retry_issued",
            CacheEvent::StorageWriteFailFinal { .. } => "storage_write_fail_final",
            CacheEvent::UpdatesLost { .. } => "updates_lost",
            CacheEvent::StaleValueServed { .. } => "stale_value_served",
            CacheEvent::OutOfOrderReadObserved { .. } => "out_of_order_read",
            CacheEvent::AssertionFailed { .. } => "assertion_failed",
            CacheEvent::ThrottledEventsSkipped { .. } => "throttled_events_skipped",
            CacheEvent::NonStandard { classifier, .. } => classifier,
        }
    }

    /// Throttling-meta events must never themselves be throttled
    pub fn is_throttle_exempt(&self) -> bool {
        matches!(self, CacheEvent::ThrottledEventsSkipped { .. })
    }

    fn message(&self) -> String {
        match self {
            CacheEvent::Started => "processors started".to_string(),
            CacheEvent::ShutdownRequested => "shutdown requested".to_string(),
            CacheEvent::EntryLoaded { key } => format!("entry {key} loaded"),
            CacheEvent::EntryEvicted { key } => format!("entry {key} evicted"),
            CacheEvent::StorageReadRetryIssued { key, attempt } => {
                format!("read retry for {key} after attempt {attempt}")
            }
            CacheEvent::StorageReadFailFinal { key } => {
                format!("initial read for {key} failed permanently")
            }
            CacheEvent::StorageResyncFailFinal { key } => {
                format!("resync for {key} failed permanently")
            }
            CacheEvent::ResyncTooLate { key } => format!("resync for {key} returned too late"),
            CacheEvent::UpdateLogOverflow { key, size } => {
                format!("update log for {key} overflowed at {size} entries")
            }
            CacheEvent::StorageWriteRetryIssued { key, attempt } => {
                format!("write retry for {key} after attempt {attempt}")
            }
            CacheEvent::StorageWriteFailFinal { key } => {
                format!("write for {key} failed permanently")
            }
            CacheEvent::UpdatesLost { key, pending_updates } => {
                format!("{pending_updates} undrained updates for {key} were dropped")
            }
            CacheEvent::StaleValueServed { key } => {
                format!("stale value served for {key} after permanent resync failure")
            }
            CacheEvent::OutOfOrderReadObserved { key } => {
                format!("read of {key} raced its reconciliation and has been superseded")
            }
            CacheEvent::AssertionFailed { message } => message.clone(),
            CacheEvent::ThrottledEventsSkipped { classifier, skipped } => {
                format!("{skipped} {classifier} events suppressed in the last window")
            }
            CacheEvent::NonStandard { message, .. } => message.clone(),
        }
    }
}

/// Structured event as delivered to the observer hook
#[derive(Debug, Clone, Serialize)]
pub struct EventRecord {
    /// Wall-clock emission time
    pub timestamp: DateTime<Utc>,
    /// Cache or service that emitted the event
    pub source: String,
    /// Event severity
    pub severity: EventSeverity,
    /// Throttling classifier
    pub classifier: String,
    /// Standard-event ordinal, if any
    pub ordinal: Option<u16>,
    /// Rendered event text
    pub message: String,
}

/// Observer receiving every event before throttling is applied
pub trait EventListener: Send + Sync {
    /// Called synchronously on the emitting task; must not block
    fn on_event(&self, record: &EventRecord);
}

struct ThrottleWindow {
    started: Instant,
    emitted: u32,
    skipped: u64,
}

/// Throttled event bus
///
/// Each classifier is allowed a configured number of emissions per sliding
/// window; overflow is counted and summarised by a single
/// [`CacheEvent::ThrottledEventsSkipped`] when the window closes.
pub struct EventBus {
    source: String,
    throttle_interval: Duration,
    max_per_interval: u32,
    notification_enabled: bool,
    listener: RwLock<Option<Arc<dyn EventListener>>>,
    windows: DashMap<String, ThrottleWindow>,
    throttled_total: AtomicU64,
}

impl EventBus {
    /// Create a new event bus
    pub fn new(
        source: impl Into<String>,
        throttle_interval: Duration,
        max_per_interval: u32,
        notification_enabled: bool,
    ) -> Self {
        Self {
            source: source.into(),
            throttle_interval,
            max_per_interval,
            notification_enabled,
            listener: RwLock::new(None),
            windows: DashMap::new(),
            throttled_total: AtomicU64::new(0),
        }
    }

    /// Register the observer hook
    pub fn set_listener(&self, listener: Arc<dyn EventListener>) {
        *self.listener.write() = Some(listener);
    }

    /// Total events suppressed by throttling since startup
    pub fn throttled_total(&self) -> u64 {
        self.throttled_total.load(Ordering::Relaxed)
    }

    /// Emit an event
    pub fn emit(&self, event: CacheEvent) {
        let record = EventRecord {
            timestamp: Utc::now(),
            source: self.source.clone(),
            severity: event.severity(),
            classifier: event.classifier().to_string(),
            ordinal: event.ordinal(),
            message: event.message(),
        };

        if self.notification_enabled {
            if let Some(listener) = self.listener.read().as_ref() {
                listener.on_event(&record);
            }
        }

        if event.is_throttle_exempt() {
            self.log(&record);
            return;
        }

        let now = Instant::now();
        let mut window_summary = None;
        let pass = {
            let mut window = self
                .windows
                .entry(record.classifier.clone())
                .or_insert_with(|| ThrottleWindow {
                    started: now,
                    emitted: 0,
                    skipped: 0,
                });
            if now.duration_since(window.started) >= self.throttle_interval {
                if window.skipped > 0 {
                    window_summary = Some((record.classifier.clone(), window.skipped));
                }
                window.started = now;
                window.emitted = 0;
                window.skipped = 0;
            }
            if window.emitted < self.max_per_interval {
                window.emitted += 1;
                true
            } else {
                window.skipped += 1;
                self.throttled_total.fetch_add(1, Ordering::Relaxed);
                false
            }
        };

        if let Some((classifier, skipped)) = window_summary {
            self.emit(CacheEvent::ThrottledEventsSkipped { classifier, skipped });
        }
        if pass {
            self.log(&record);
        }
    }

    fn log(&self, record: &EventRecord) {
        let source = record.source.as_str();
        let classifier = record.classifier.as_str();
        let message = record.message.as_str();
        match record.severity {
            EventSeverity::Debug => {
                tracing::debug!(source, classifier, "{message}");
            }
            EventSeverity::Info | EventSeverity::ExternalInfo => {
                tracing::info!(source, classifier, "{message}");
            }
            EventSeverity::Warn | EventSeverity::ExternalWarn => {
                tracing::warn!(source, classifier, "{message}");
            }
            EventSeverity::ExternalError
            | EventSeverity::ExternalDataLoss
            | EventSeverity::Error
            | EventSeverity::Critical => {
                tracing::error!(source, classifier, "{message}");
            }
        }
    }
}

impl std::fmt::Debug for EventBus {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EventBus")
            .field("source", &self.source)
            .field("throttle_interval", &self.throttle_interval)
            .field("max_per_interval", &self.max_per_interval)
            .finish()
    }
}
