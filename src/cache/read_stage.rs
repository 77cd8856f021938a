//! Read stage: initial loads and background resync reads
//!
//! A single processor task drains the inbound queue (optionally batching),
//! then dispatches each read to the worker pool or runs it inline. Workers
//! call `read_from_storage` without any lock held and route the outcome:
//! initial successes release blocked readers and admit the entry to the main
//! queue; resync successes merge the freshly-read base with updates that
//! accumulated while the read was in flight.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::cache::adapter::CacheAdapter;
use crate::cache::core::{CacheCore, ReadRequest};
use crate::cache::entry::{CacheEntry, EntryState};
use crate::cache::status::CacheMetrics;
use crate::config::{InitialReadFailedAction, ResyncFailedFinalAction, ResyncTooLateAction};
use crate::error::{CacheError, StorageError};
use crate::events::CacheEvent;

impl<A: CacheAdapter> CacheCore<A> {
    pub(crate) async fn run_read_stage(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<ReadRequest<A::Key>>,
    ) {
        loop {
            // A draining exit must wait until the main queue can no longer
            // schedule refreshes and no worker can still re-enqueue a retry.
            let quiesced = || {
                self.main_queue_stopped.load(Ordering::Acquire)
                    && self.metrics.in_flight_reads.load(Ordering::Relaxed) == 0
            };
            let batch = self
                .collect_batch(
                    &mut rx,
                    self.config.read_queue_batching_delay,
                    &self.drain_reads_on_shutdown,
                    &self.metrics.read_queue_size,
                    quiesced,
                )
                .await;
            let Some(batch) = batch else { break };
            for request in batch {
                self.clone().dispatch_read(request).await;
            }
        }
        tracing::debug!(cache = %self.config.cache_name, "read stage stopped");
    }

    async fn dispatch_read(self: Arc<Self>, request: ReadRequest<A::Key>) {
        let Some(entry) = self.table.resolve(&request.key, request.generation) else {
            return;
        };
        let violation = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => return,
                EntryState::Loading if !request.is_refresh => None,
                EntryState::ResyncPending | EntryState::Resyncing if request.is_refresh => {
                    body.state = EntryState::Resyncing;
                    None
                }
                state => Some(format!("read dispatched in state {state:?}")),
            }
        };
        if let Some(message) = violation {
            self.fail_assertion(&entry, message);
            return;
        }

        // Counted in flight from dispatch so drain accounting never sees a
        // gap between dequeue and execution.
        CacheMetrics::incr(&self.metrics.in_flight_reads);
        let core = self.clone();
        let is_refresh = request.is_refresh;
        let task = async move { core.execute_read(entry, is_refresh).await };
        self.dispatch(&self.read_pool, task).await;
    }

    async fn execute_read(self: Arc<Self>, entry: Arc<CacheEntry<A>>, is_refresh: bool) {
        CacheMetrics::incr(&self.metrics.reads_attempted);
        let result = self.adapter.read_from_storage(&entry.key, is_refresh).await;

        match result {
            Ok(raw) => {
                CacheMetrics::incr(&self.metrics.reads_succeeded);
                let cached = self.adapter.to_cache_format(&entry.key, raw);
                if is_refresh {
                    self.complete_resync(entry, cached);
                } else {
                    self.complete_initial_load(entry, cached);
                }
            }
            Err(error) => self.handle_read_failure(entry, is_refresh, error),
        }
        CacheMetrics::decr(&self.metrics.in_flight_reads);
    }

    fn complete_initial_load(&self, entry: Arc<CacheEntry<A>>, cached: A::Cached) {
        let violation = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => return,
                EntryState::Loading => {
                    // Updates accepted while loading (out-of-order mode) are
                    // replayed onto the fresh base and stay logged for the
                    // write decision.
                    let mut base = cached;
                    for update in body.update_log.iter() {
                        base = self.adapter.apply_update(base, update);
                    }
                    body.payload = Some(base);
                    body.state = EntryState::Loaded;
                    body.failures.read_attempts = 0;
                    None
                }
                state => Some(format!("initial read completed in state {state:?}")),
            }
        };
        if let Some(message) = violation {
            self.fail_assertion(&entry, message);
            return;
        }

        entry.waiters.notify_waiters();
        self.events.emit(CacheEvent::EntryLoaded {
            key: self.key_str(&entry.key),
        });
        self.enqueue_main(entry.key.clone(), entry.generation);
    }

    /// Adopt a freshly-read base and reconcile it with updates collected
    /// while the read was in flight
    fn complete_resync(&self, entry: Arc<CacheEntry<A>>, fresh: A::Cached) {
        enum Outcome {
            Done { raced_read: bool },
            TooLate { lost: usize },
            Evict { lost: usize },
        }

        let outcome = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => return,
                EntryState::Resyncing => {}
                state => {
                    let message = format!("resync completed in state {state:?}");
                    drop(body);
                    self.fail_assertion(&entry, message);
                    return;
                }
            }

            if !body.resync_is_late() {
                let replayed = body.update_log.len();
                let mut base = fresh;
                for update in body.update_log.iter() {
                    base = self.adapter.apply_update(base, update);
                }
                body.take_log();
                // Replayed updates live only in memory until the next write
                // split picks them up.
                body.dirty = replayed > 0;
                body.payload = Some(base);
                body.state = EntryState::Loaded;
                body.failures.read_attempts = 0;
                let raced_read = match (body.last_read_at, body.resync_started_at) {
                    (Some(read_at), Some(started_at)) => read_at >= started_at,
                    _ => false,
                };
                Outcome::Done { raced_read }
            } else {
                match self.config.effective_resync_too_late_action() {
                    ResyncTooLateAction::SetDirectly => {
                        let lost = body.take_log().len();
                        body.payload = Some(fresh);
                        body.state = EntryState::Loaded;
                        body.resync_overdue = false;
                        body.failures.read_attempts = 0;
                        Outcome::TooLate { lost }
                    }
                    ResyncTooLateAction::MergeData => {
                        let replayed = body.update_log.len();
                        let mut base = fresh;
                        for update in body.update_log.iter() {
                            base = self.adapter.apply_update(base, update);
                        }
                        body.take_log();
                        body.dirty = replayed > 0;
                        body.payload = Some(base);
                        body.state = EntryState::Loaded;
                        body.resync_overdue = false;
                        body.failures.read_attempts = 0;
                        Outcome::TooLate { lost: 0 }
                    }
                    ResyncTooLateAction::ClearReadPendingStatus => {
                        // Keep the in-memory value, drop the refresh result.
                        body.state = EntryState::Loaded;
                        body.resync_overdue = false;
                        body.failures.read_attempts = 0;
                        Outcome::TooLate { lost: 0 }
                    }
                    ResyncTooLateAction::RemoveFromCache => {
                        let lost = body.pending_update_count();
                        drop(body);
                        Outcome::Evict { lost }
                    }
                    ResyncTooLateAction::DoNothing => {
                        // Explicitly opted into: revert to loaded, touch
                        // nothing else.
                        body.state = EntryState::Loaded;
                        Outcome::TooLate { lost: 0 }
                    }
                }
            }
        };

        let key = self.key_str(&entry.key);
        match outcome {
            Outcome::Done { raced_read } => {
                if raced_read {
                    self.events.emit(CacheEvent::OutOfOrderReadObserved { key });
                }
                entry.waiters.notify_waiters();
            }
            Outcome::TooLate { lost } => {
                self.events.emit(CacheEvent::ResyncTooLate { key: key.clone() });
                if lost > 0 {
                    self.events.emit(CacheEvent::UpdatesLost {
                        key,
                        pending_updates: lost,
                    });
                }
                entry.waiters.notify_waiters();
            }
            Outcome::Evict { lost } => {
                self.events.emit(CacheEvent::ResyncTooLate { key: key.clone() });
                self.evict(&entry, None);
                if lost > 0 {
                    self.events.emit(CacheEvent::UpdatesLost {
                        key,
                        pending_updates: lost,
                    });
                }
            }
        }
    }

    fn handle_read_failure(
        &self,
        entry: Arc<CacheEntry<A>>,
        is_refresh: bool,
        error: StorageError,
    ) {
        let key = self.key_str(&entry.key);
        let attempts = {
            let mut body = entry.body.lock();
            if body.state == EntryState::RemovedFromCache {
                return;
            }
            body.failures.read_attempts += 1;
            body.failures.read_attempts
        };

        // The budget counts retries beyond the first attempt.
        if error.is_transient() && attempts <= self.config.read_failure_max_retry_count {
            CacheMetrics::incr(&self.metrics.read_retries);
            self.events.emit(CacheEvent::StorageReadRetryIssued {
                key,
                attempt: attempts,
            });
            self.enqueue_read(entry.key.clone(), entry.generation, is_refresh);
            return;
        }

        CacheMetrics::incr(&self.metrics.reads_failed_final);
        if is_refresh {
            self.resync_failed_final(entry, key);
        } else {
            self.initial_read_failed_final(entry, key);
        }
    }

    fn initial_read_failed_final(&self, entry: Arc<CacheEntry<A>>, key: String) {
        self.events.emit(CacheEvent::StorageReadFailFinal { key });
        match self.config.initial_read_failed_final_action {
            InitialReadFailedAction::RemoveFromCache => {
                self.evict(&entry, Some(CacheError::ReadFailedFinal));
            }
            InitialReadFailedAction::KeepAndThrow => {
                {
                    let mut body = entry.body.lock();
                    if body.state == EntryState::RemovedFromCache {
                        return;
                    }
                    body.state = EntryState::ReadFailedFinal;
                }
                entry.waiters.notify_waiters();
                // The failed entry still ages out through the main queue.
                self.enqueue_main(entry.key.clone(), entry.generation);
            }
        }
    }

    fn resync_failed_final(&self, entry: Arc<CacheEntry<A>>, key: String) {
        self.events.emit(CacheEvent::StorageResyncFailFinal { key: key.clone() });
        match self.config.resync_failed_final_action {
            ResyncFailedFinalAction::RemoveFromCache => {
                let lost = self.evict(&entry, Some(CacheError::ResyncFailedFinal));
                if lost > 0 {
                    self.events.emit(CacheEvent::UpdatesLost {
                        key,
                        pending_updates: lost,
                    });
                }
            }
            ResyncFailedFinalAction::StopCollectingUpdates => {
                let lost = {
                    let mut body = entry.body.lock();
                    if body.state == EntryState::RemovedFromCache {
                        return;
                    }
                    let lost = body.take_log().len();
                    body.updates_paused = true;
                    body.state = EntryState::ResyncFailedFinal;
                    body.failures.read_attempts = 0;
                    lost
                };
                if lost > 0 {
                    self.events.emit(CacheEvent::UpdatesLost {
                        key,
                        pending_updates: lost,
                    });
                }
                entry.waiters.notify_waiters();
            }
            ResyncFailedFinalAction::KeepCollectingUpdates => {
                {
                    let mut body = entry.body.lock();
                    if body.state == EntryState::RemovedFromCache {
                        return;
                    }
                    body.state = EntryState::ResyncFailedFinal;
                    body.failures.read_attempts = 0;
                }
                entry.waiters.notify_waiters();
            }
        }
    }
}
