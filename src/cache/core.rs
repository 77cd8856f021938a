//! Shared plumbing for the stage processors
//!
//! One `CacheCore` instance is shared by the public facade and the four
//! long-lived stage tasks. It owns the entry table, the adapter, the event
//! bus, the inter-stage channels, the worker pools, and the shutdown flags.
//! The stage run loops themselves live in the sibling stage modules as
//! `impl` blocks on this type.

use std::future::Future;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;

use tokio::sync::mpsc::{UnboundedReceiver, UnboundedSender};
use tokio::sync::{Notify, Semaphore};
use tokio::time::Instant;

use crate::cache::adapter::CacheAdapter;
use crate::cache::entry::CacheEntry;
use crate::cache::status::{CacheMetrics, CacheStatus, StatusCache};
use crate::cache::table::EntryTable;
use crate::config::{CacheConfig, PoolSize};
use crate::error::CacheError;
use crate::events::{CacheEvent, EventBus};

/// Storage read order for one key
pub(crate) struct ReadRequest<K> {
    pub key: K,
    pub generation: u64,
    pub is_refresh: bool,
}

/// Storage write order for one key
pub(crate) struct WriteRequest<K> {
    pub key: K,
    pub generation: u64,
}

/// Time-ordered queue handle; holds no entry ownership
pub(crate) struct TimedHandle<K> {
    pub key: K,
    pub generation: u64,
    pub enqueued_at: Instant,
    pub expiry: Instant,
}

pub(crate) struct CacheCore<A: CacheAdapter> {
    pub config: CacheConfig,
    pub adapter: A,
    pub table: EntryTable<A>,
    pub events: EventBus,
    pub metrics: CacheMetrics,
    pub read_tx: UnboundedSender<ReadRequest<A::Key>>,
    pub write_tx: UnboundedSender<WriteRequest<A::Key>>,
    pub main_tx: UnboundedSender<TimedHandle<A::Key>>,
    pub return_tx: UnboundedSender<TimedHandle<A::Key>>,
    pub read_pool: Option<Arc<Semaphore>>,
    pub write_pool: Option<Arc<Semaphore>>,
    pub stop: AtomicBool,
    pub drain_reads_on_shutdown: AtomicBool,
    pub drain_writes_on_shutdown: AtomicBool,
    // Stage-exit markers let a draining downstream stage keep polling until
    // every producer that could still feed it has stopped.
    pub main_queue_stopped: AtomicBool,
    pub return_queue_stopped: AtomicBool,
    pub shutdown_notify: Notify,
    pub status_cache: StatusCache,
}

impl<A: CacheAdapter> CacheCore<A> {
    pub fn new(
        config: CacheConfig,
        adapter: A,
        read_tx: UnboundedSender<ReadRequest<A::Key>>,
        write_tx: UnboundedSender<WriteRequest<A::Key>>,
        main_tx: UnboundedSender<TimedHandle<A::Key>>,
        return_tx: UnboundedSender<TimedHandle<A::Key>>,
    ) -> Self {
        let events = EventBus::new(
            config.cache_name.clone(),
            config.log_throttle_time_interval,
            config.log_throttle_max_messages_of_type_per_time_interval,
            config.event_notification_enabled,
        );
        let pool = |size: PoolSize| {
            size.max_concurrency()
                .map(|permits| Arc::new(Semaphore::new(permits)))
        };
        Self {
            table: EntryTable::new(config.max_cache_elements_hard_limit),
            events,
            metrics: CacheMetrics::default(),
            read_pool: pool(config.read_thread_pool_size),
            write_pool: pool(config.write_thread_pool_size),
            config,
            adapter,
            read_tx,
            write_tx,
            main_tx,
            return_tx,
            stop: AtomicBool::new(false),
            drain_reads_on_shutdown: AtomicBool::new(false),
            drain_writes_on_shutdown: AtomicBool::new(false),
            main_queue_stopped: AtomicBool::new(false),
            return_queue_stopped: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
            status_cache: StatusCache::new(),
        }
    }

    pub fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    pub fn key_str(&self, key: &A::Key) -> String {
        format!("{key:?}")
    }

    // ------------------------------------------------------------------
    // Queue submission
    // ------------------------------------------------------------------

    pub fn enqueue_read(&self, key: A::Key, generation: u64, is_refresh: bool) {
        CacheMetrics::incr(&self.metrics.read_queue_size);
        let request = ReadRequest {
            key,
            generation,
            is_refresh,
        };
        if self.read_tx.send(request).is_err() {
            CacheMetrics::decr(&self.metrics.read_queue_size);
        }
    }

    pub fn enqueue_write(&self, key: A::Key, generation: u64) {
        CacheMetrics::incr(&self.metrics.write_queue_size);
        if self.write_tx.send(WriteRequest { key, generation }).is_err() {
            CacheMetrics::decr(&self.metrics.write_queue_size);
        }
    }

    pub fn enqueue_main(&self, key: A::Key, generation: u64) {
        let now = Instant::now();
        CacheMetrics::incr(&self.metrics.main_queue_size);
        let handle = TimedHandle {
            key,
            generation,
            enqueued_at: now,
            expiry: now + self.config.main_queue_cache_time,
        };
        if self.main_tx.send(handle).is_err() {
            CacheMetrics::decr(&self.metrics.main_queue_size);
        }
    }

    pub fn enqueue_return(&self, key: A::Key, generation: u64) {
        let now = Instant::now();
        CacheMetrics::incr(&self.metrics.return_queue_size);
        let handle = TimedHandle {
            key,
            generation,
            enqueued_at: now,
            expiry: now + self.config.return_queue_cache_time_min,
        };
        if self.return_tx.send(handle).is_err() {
            CacheMetrics::decr(&self.metrics.return_queue_size);
        }
    }

    // ------------------------------------------------------------------
    // Stage loop helpers
    // ------------------------------------------------------------------

    /// Receive the next inbound item, observing the stop flag at
    /// `max_sleep_time` granularity
    ///
    /// Returns `None` when the stage should exit: either a non-draining
    /// shutdown, or a draining shutdown whose queue is empty and whose
    /// `quiesced` condition (no producer can still feed this stage) holds.
    pub async fn next_item<T>(
        &self,
        rx: &mut UnboundedReceiver<T>,
        drain: &AtomicBool,
        gauge: &AtomicU64,
        quiesced: impl Fn() -> bool,
    ) -> Option<T> {
        loop {
            if self.is_stopping() {
                if !drain.load(Ordering::Acquire) {
                    return None;
                }
                match rx.try_recv() {
                    Ok(item) => {
                        CacheMetrics::decr(gauge);
                        return Some(item);
                    }
                    Err(_) => {
                        if quiesced() {
                            return None;
                        }
                        tokio::time::sleep(std::time::Duration::from_millis(1)).await;
                    }
                }
                continue;
            }
            tokio::select! {
                item = rx.recv() => {
                    if item.is_some() {
                        CacheMetrics::decr(gauge);
                    }
                    return item;
                }
                _ = tokio::time::sleep(self.config.max_sleep_time) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }
    }

    /// Accumulate inbound items for up to `delay` before dispatching
    ///
    /// With a zero delay each item dispatches alone.
    pub async fn collect_batch<T>(
        &self,
        rx: &mut UnboundedReceiver<T>,
        delay: std::time::Duration,
        drain: &AtomicBool,
        gauge: &AtomicU64,
        quiesced: impl Fn() -> bool,
    ) -> Option<Vec<T>> {
        let first = self.next_item(rx, drain, gauge, quiesced).await?;
        let mut batch = vec![first];
        if delay.is_zero() {
            return Some(batch);
        }
        let deadline = Instant::now() + delay;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() {
                break;
            }
            match tokio::time::timeout(remaining, rx.recv()).await {
                Ok(Some(item)) => {
                    CacheMetrics::decr(gauge);
                    batch.push(item);
                }
                Ok(None) | Err(_) => break,
            }
        }
        Some(batch)
    }

    /// Run a storage task on the stage's pool, or inline when none is
    /// configured
    pub async fn dispatch(
        &self,
        pool: &Option<Arc<Semaphore>>,
        task: impl Future<Output = ()> + Send + 'static,
    ) {
        match pool {
            None => task.await,
            Some(semaphore) => match semaphore.clone().acquire_owned().await {
                Ok(permit) => {
                    tokio::spawn(async move {
                        task.await;
                        drop(permit);
                    });
                }
                // The semaphore is never closed; fall back to inline
                // execution rather than dropping the task.
                Err(_) => task.await,
            },
        }
    }

    // ------------------------------------------------------------------
    // Eviction and assertions
    // ------------------------------------------------------------------

    /// Make an entry terminal and unreachable
    ///
    /// Returns the number of undrained updates it held; the caller decides
    /// whether that constitutes reportable data loss.
    pub fn evict(&self, entry: &Arc<CacheEntry<A>>, final_error: Option<CacheError>) -> usize {
        let pending = {
            let mut body = entry.body.lock();
            let pending = body.pending_update_count()
                + usize::from(body.pending_write.is_some() || body.dirty);
            body.state = crate::cache::entry::EntryState::RemovedFromCache;
            body.final_error = final_error;
            body.payload = None;
            body.update_log.clear();
            body.dirty = false;
            body.pending_write = None;
            pending
        };
        self.table.remove(&entry.key, entry.generation);
        entry.waiters.notify_waiters();
        CacheMetrics::incr(&self.metrics.entries_evicted);
        self.events.emit(CacheEvent::EntryEvicted {
            key: self.key_str(&entry.key),
        });
        pending
    }

    /// Record an internal invariant violation and drop the offending entry
    ///
    /// Processor tasks must never die on a bug in one entry; the entry is
    /// sacrificed and the violation reported as a critical event.
    pub fn fail_assertion(&self, entry: &Arc<CacheEntry<A>>, message: String) {
        CacheMetrics::incr(&self.metrics.assertions_failed);
        self.events.emit(CacheEvent::AssertionFailed {
            message: format!("{}: {}", self.key_str(&entry.key), message),
        });
        let pending = self.evict(entry, Some(CacheError::AssertionFailed(message)));
        if pending > 0 {
            self.events.emit(CacheEvent::UpdatesLost {
                key: self.key_str(&entry.key),
                pending_updates: pending,
            });
        }
    }

    // ------------------------------------------------------------------
    // Status
    // ------------------------------------------------------------------

    pub fn build_status(&self) -> CacheStatus {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let m = &self.metrics;
        CacheStatus {
            cache_name: self.config.cache_name.clone(),
            entry_table_size: self.table.len(),
            read_queue_size: load(&m.read_queue_size),
            write_queue_size: load(&m.write_queue_size),
            main_queue_size: load(&m.main_queue_size),
            return_queue_size: load(&m.return_queue_size),
            in_flight_reads: load(&m.in_flight_reads),
            in_flight_writes: load(&m.in_flight_writes),
            reads_attempted: load(&m.reads_attempted),
            reads_succeeded: load(&m.reads_succeeded),
            reads_failed_final: load(&m.reads_failed_final),
            read_retries: load(&m.read_retries),
            writes_attempted: load(&m.writes_attempted),
            writes_succeeded: load(&m.writes_succeeded),
            writes_failed_final: load(&m.writes_failed_final),
            write_retries: load(&m.write_retries),
            entries_created: load(&m.entries_created),
            entries_evicted: load(&m.entries_evicted),
            read_hits: load(&m.read_hits),
            read_timeouts: load(&m.read_timeouts),
            stale_reads_served: load(&m.stale_reads_served),
            updates_collected: load(&m.updates_collected),
            events_throttled: self.events.throttled_total(),
            assertions_failed: load(&m.assertions_failed),
        }
    }

    /// Items still sitting in queues or executing against storage
    pub fn undrained_items(&self) -> u64 {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let m = &self.metrics;
        load(&m.read_queue_size)
            + load(&m.write_queue_size)
            + load(&m.in_flight_reads)
            + load(&m.in_flight_writes)
    }
}
