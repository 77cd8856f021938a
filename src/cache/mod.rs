//! Write-behind cache with background reconciliation
//!
//! Reads are served from an in-memory working copy. Updates apply to the
//! working copy immediately and drain to the backing store asynchronously.
//! Entries cycle through four stages: a read stage performing initial and
//! refresh reads, a time-ordered main queue deciding each cycle between
//! write, reconcile, and requeue, a write stage draining dirty entries, and
//! a return queue holding written entries until eviction is safe.
//!
//! The backing store is owned externally; the cache reconciles against it
//! periodically so externally-applied changes become visible. Convergence is
//! eventual, not linearisable, and pending writes are not durable across
//! restarts.

use std::sync::atomic::Ordering;
use std::sync::Arc;
use std::time::Duration;

use parking_lot::Mutex;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio::time::Instant;

use crate::config::{CacheConfig, ConfigError};
use crate::error::{CacheError, CacheResult};
use crate::events::{CacheEvent, EventListener};

pub mod adapter;
mod core;
mod entry;
mod main_queue;
mod read_stage;
mod return_queue;
pub mod status;
mod table;
mod write_stage;

pub use adapter::CacheAdapter;
pub use status::CacheStatus;

use self::core::{CacheCore, ReadRequest, TimedHandle, WriteRequest};
use self::entry::EntryState;
use self::status::CacheMetrics;
use self::table::Lookup;

struct StageReceivers<A: CacheAdapter> {
    read_rx: mpsc::UnboundedReceiver<ReadRequest<A::Key>>,
    write_rx: mpsc::UnboundedReceiver<WriteRequest<A::Key>>,
    main_rx: mpsc::UnboundedReceiver<TimedHandle<A::Key>>,
    return_rx: mpsc::UnboundedReceiver<TimedHandle<A::Key>>,
}

/// Write-behind, resync-in-background cache
///
/// Generic over a [`CacheAdapter`] bundling the storage calls and shape
/// conversions. Construct with [`WriteBehindCache::new`], call
/// [`WriteBehindCache::start`] once from within a tokio runtime, and shut
/// down with [`WriteBehindCache::shutdown_for`].
pub struct WriteBehindCache<A: CacheAdapter> {
    core: Arc<CacheCore<A>>,
    receivers: Mutex<Option<StageReceivers<A>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<A: CacheAdapter> WriteBehindCache<A> {
    /// Create a cache from a validated configuration and an adapter
    pub fn new(config: CacheConfig, adapter: A) -> Result<Self, ConfigError> {
        config.validate()?;
        let (read_tx, read_rx) = mpsc::unbounded_channel();
        let (write_tx, write_rx) = mpsc::unbounded_channel();
        let (main_tx, main_rx) = mpsc::unbounded_channel();
        let (return_tx, return_rx) = mpsc::unbounded_channel();
        let core = Arc::new(CacheCore::new(
            config, adapter, read_tx, write_tx, main_tx, return_tx,
        ));
        Ok(Self {
            core,
            receivers: Mutex::new(Some(StageReceivers {
                read_rx,
                write_rx,
                main_rx,
                return_rx,
            })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the four stage processors
    pub fn start(&self) -> CacheResult<()> {
        let Some(receivers) = self.receivers.lock().take() else {
            return Err(CacheError::AssertionFailed("cache already started".into()));
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.core.clone().run_read_stage(receivers.read_rx),
        ));
        tasks.push(tokio::spawn(
            self.core.clone().run_main_queue(receivers.main_rx),
        ));
        tasks.push(tokio::spawn(
            self.core.clone().run_write_stage(receivers.write_rx),
        ));
        tasks.push(tokio::spawn(
            self.core.clone().run_return_queue(receivers.return_rx),
        ));
        self.core.events.emit(CacheEvent::Started);
        Ok(())
    }

    /// Ensure an entry exists for a key, scheduling its initial read if
    /// absent. Idempotent: racing preloads create exactly one entry.
    pub async fn preload(&self, key: A::Key) -> CacheResult<()> {
        let core = &self.core;
        for _ in 0..=core.config.max_cache_removed_retries {
            if core.is_stopping() {
                return Err(CacheError::Shutdown);
            }
            match core.table.find_or_create(&key)? {
                Lookup::Created(created) => {
                    CacheMetrics::incr(&core.metrics.entries_created);
                    core.enqueue_read(key.clone(), created.generation, false);
                    return Ok(());
                }
                Lookup::Existing(existing) => {
                    if existing.body.lock().state != EntryState::RemovedFromCache {
                        return Ok(());
                    }
                    // Racing an eviction; give the remover a beat and retry.
                    tokio::task::yield_now().await;
                }
            }
        }
        Err(CacheError::AssertionFailed(
            "entry kept vanishing during preload".into(),
        ))
    }

    /// Read the value for a key, waiting up to `wait` for a usable payload
    ///
    /// Behaves as [`WriteBehindCache::preload`] first when the key is
    /// absent. Fails with [`CacheError::NotLoaded`] if the entry is still
    /// loading at the deadline.
    pub async fn read_for(&self, key: A::Key, wait: Duration) -> CacheResult<A::Value> {
        enum Decision<V> {
            Serve(V),
            ServeStale(V),
            Fail(CacheError),
            Wait,
            Recreate,
            Violation(String),
        }

        let core = &self.core;
        let deadline = Instant::now() + wait;
        let mut removed_races = 0u32;
        'table: loop {
            if core.is_stopping() {
                return Err(CacheError::Shutdown);
            }
            let entry = match core.table.find_or_create(&key)? {
                Lookup::Created(created) => {
                    CacheMetrics::incr(&core.metrics.entries_created);
                    core.enqueue_read(key.clone(), created.generation, false);
                    created
                }
                Lookup::Existing(existing) => existing,
            };

            loop {
                // Register for wakeups before inspecting state so a
                // transition between the check and the wait is not missed.
                let notified = entry.waiters.notified();
                tokio::pin!(notified);
                notified.as_mut().enable();

                let decision = {
                    let mut body = entry.body.lock();
                    match body.state {
                        EntryState::Loaded
                        | EntryState::ResyncPending
                        | EntryState::WritePending
                        | EntryState::Writing => match &body.payload {
                            Some(payload) => {
                                let value = core.adapter.to_return_value(&key, payload);
                                body.last_read_at = Some(Instant::now());
                                Decision::Serve(value)
                            }
                            None => Decision::Violation(
                                "readable entry has no payload".to_string(),
                            ),
                        },
                        EntryState::Resyncing => {
                            if core.config.accept_out_of_order_reads {
                                match &body.payload {
                                    Some(payload) => {
                                        let value = core.adapter.to_return_value(&key, payload);
                                        body.last_read_at = Some(Instant::now());
                                        Decision::Serve(value)
                                    }
                                    None => Decision::Wait,
                                }
                            } else {
                                Decision::Wait
                            }
                        }
                        EntryState::Loading => Decision::Wait,
                        EntryState::ReadFailedFinal => {
                            Decision::Fail(CacheError::ReadFailedFinal)
                        }
                        EntryState::ResyncFailedFinal => {
                            if core.config.allow_data_reading_after_resync_failed_final {
                                match &body.payload {
                                    Some(payload) => {
                                        let value = core.adapter.to_return_value(&key, payload);
                                        body.last_read_at = Some(Instant::now());
                                        Decision::ServeStale(value)
                                    }
                                    None => Decision::Fail(CacheError::ResyncFailedFinal),
                                }
                            } else {
                                Decision::Fail(CacheError::ResyncFailedFinal)
                            }
                        }
                        EntryState::RemovedFromCache => match body.final_error.clone() {
                            Some(error) => Decision::Fail(error),
                            None => Decision::Recreate,
                        },
                    }
                };

                match decision {
                    Decision::Serve(value) => {
                        CacheMetrics::incr(&core.metrics.read_hits);
                        return Ok(value);
                    }
                    Decision::ServeStale(value) => {
                        CacheMetrics::incr(&core.metrics.read_hits);
                        CacheMetrics::incr(&core.metrics.stale_reads_served);
                        core.events.emit(CacheEvent::StaleValueServed {
                            key: core.key_str(&key),
                        });
                        return Ok(value);
                    }
                    Decision::Fail(error) => return Err(error),
                    Decision::Violation(message) => {
                        core.fail_assertion(&entry, message.clone());
                        return Err(CacheError::AssertionFailed(message));
                    }
                    Decision::Recreate => {
                        removed_races += 1;
                        if removed_races > core.config.max_cache_removed_retries {
                            return Err(CacheError::AssertionFailed(
                                "entry kept vanishing during read".into(),
                            ));
                        }
                        continue 'table;
                    }
                    Decision::Wait => {
                        if Instant::now() >= deadline {
                            CacheMetrics::incr(&core.metrics.read_timeouts);
                            return Err(CacheError::NotLoaded);
                        }
                        tokio::select! {
                            _ = &mut notified => {}
                            _ = tokio::time::sleep_until(deadline) => {
                                CacheMetrics::incr(&core.metrics.read_timeouts);
                                return Err(CacheError::NotLoaded);
                            }
                            _ = core.shutdown_notify.notified() => {
                                return Err(CacheError::Shutdown);
                            }
                        }
                    }
                }
            }
        }
    }

    /// Apply an update to a cached entry
    ///
    /// The update is converted to its logged form, appended to the entry's
    /// update log, and applied to the in-memory value in place. Fails with
    /// [`CacheError::NotLoaded`] when the key is absent or its state forbids
    /// updates.
    pub fn write_if_cached(&self, key: A::Key, update: A::Update) -> CacheResult<()> {
        let core = &self.core;
        if core.is_stopping() {
            return Err(CacheError::Shutdown);
        }
        let Some(entry) = core.table.get(&key) else {
            return Err(CacheError::NotLoaded);
        };

        let overflowed = {
            let mut body = entry.body.lock();
            let updatable = match body.state {
                EntryState::Loaded
                | EntryState::ResyncPending
                | EntryState::Resyncing
                | EntryState::WritePending
                | EntryState::Writing => true,
                // Without a payload the update can only be logged for replay
                // once the initial read lands; that needs the out-of-order
                // concession.
                EntryState::Loading => core.config.accept_out_of_order_reads,
                EntryState::ResyncFailedFinal => !body.updates_paused,
                EntryState::ReadFailedFinal | EntryState::RemovedFromCache => false,
            };
            if !updatable {
                return Err(CacheError::NotLoaded);
            }

            let logged = core.adapter.to_internal_update(&key, update);
            if let Some(payload) = body.payload.take() {
                body.payload = Some(core.adapter.apply_update(payload, &logged));
            }
            body.append_update(logged, core.config.max_updates_to_collect)
        };

        CacheMetrics::incr(&core.metrics.updates_collected);
        if overflowed {
            let size = entry.body.lock().pending_update_count();
            core.events.emit(CacheEvent::UpdateLogOverflow {
                key: core.key_str(&key),
                size,
            });
        }
        Ok(())
    }

    /// Stop the processors, optionally draining queued work first
    ///
    /// With `drain_writes` set, dirty entries still queued get a final write
    /// before the stages exit. Blocks up to `timeout` and returns the number
    /// of items still queued or in flight at the deadline; zero means a
    /// clean drain.
    pub async fn shutdown_for(
        &self,
        timeout: Duration,
        drain_writes: bool,
        drain_reads: bool,
    ) -> u64 {
        let core = &self.core;
        core.drain_writes_on_shutdown
            .store(drain_writes, Ordering::Release);
        core.drain_reads_on_shutdown
            .store(drain_reads, Ordering::Release);
        core.stop.store(true, Ordering::Release);
        core.events.emit(CacheEvent::ShutdownRequested);
        core.shutdown_notify.notify_waiters();

        let deadline = Instant::now() + timeout;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let _ = tokio::time::timeout_at(deadline, futures::future::join_all(tasks)).await;
        loop {
            let remaining = deadline.saturating_duration_since(Instant::now());
            if remaining.is_zero() || core.undrained_items() == 0 {
                break;
            }
            tokio::time::sleep(core.config.max_sleep_time.min(remaining)).await;
        }
        core.undrained_items()
    }

    /// Build or reuse a status snapshot no older than `max_age`
    pub fn status(&self, max_age: Duration) -> CacheStatus {
        self.core
            .status_cache
            .get_or_build(max_age, || self.core.build_status())
    }

    /// Register an observer that receives every event pre-throttle
    ///
    /// Only invoked when `event_notification_enabled` is set in the
    /// configuration.
    pub fn set_event_listener(&self, listener: Arc<dyn EventListener>) {
        self.core.events.set_listener(listener);
    }

    /// Live entries in the entry table
    pub fn entry_count(&self) -> usize {
        self.core.table.len()
    }
}
