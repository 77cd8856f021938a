//! Main queue stage: the time-ordered ring of in-cache entries
//!
//! Entries enter with a fixed cycle time, so the queue is FIFO in expiry
//! order. The single processor sleeps until the head is due (capped by
//! `max_sleep_time` so shutdown and clock adjustments are observed) and then
//! runs the cycle decision: dirty entries are split for writing, clean ones
//! are scheduled for a reconciliation read.

use std::collections::VecDeque;
use std::sync::Arc;
use std::time::Duration;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::cache::adapter::CacheAdapter;
use crate::cache::core::{CacheCore, TimedHandle};
use crate::cache::entry::EntryState;
use crate::cache::status::CacheMetrics;
use crate::error::CacheError;
use crate::events::CacheEvent;

enum CycleAction {
    /// Handle was stale or the entry needs nothing
    Drop,
    /// Put the entry back for another cycle
    Requeue,
    /// Hand the entry to the write stage
    Write,
    /// Schedule a reconciliation read and keep a holder queued so a late
    /// return is detectable
    Resync,
    Evict {
        error: Option<CacheError>,
        lost: usize,
    },
    Violation(String),
}

impl<A: CacheAdapter> CacheCore<A> {
    pub(crate) async fn run_main_queue(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<TimedHandle<A::Key>>,
    ) {
        let mut queue: VecDeque<TimedHandle<A::Key>> = VecDeque::new();
        loop {
            while let Ok(handle) = rx.try_recv() {
                queue.push_back(handle);
            }
            if self.is_stopping() {
                self.main_queue_shutdown_sweep(&mut queue);
                self.main_queue_stopped
                    .store(true, std::sync::atomic::Ordering::Release);
                break;
            }

            let now = Instant::now();
            let compressed = self.cycle_time_under_pressure();
            while let Some(head) = queue.front() {
                if self.effective_expiry(head, compressed) > now {
                    break;
                }
                let handle = queue.pop_front();
                if let Some(handle) = handle {
                    self.process_cycle(handle);
                }
            }
            CacheMetrics::set(&self.metrics.main_queue_size, queue.len() as u64);

            let sleep_for = queue
                .front()
                .map(|head| {
                    self.effective_expiry(head, compressed)
                        .saturating_duration_since(Instant::now())
                })
                .unwrap_or(self.config.max_sleep_time)
                .min(self.config.max_sleep_time);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                handle = rx.recv() => {
                    if let Some(handle) = handle {
                        queue.push_back(handle);
                    }
                }
                _ = self.shutdown_notify.notified() => {}
            }
        }
        tracing::debug!(cache = %self.config.cache_name, "main queue stopped");
    }

    /// Compressed cycle time while the table is over its soft target
    ///
    /// Cycle time shrinks proportionally with the overshoot but never below
    /// the minimum dwell, which defeats busy-loop thrashing under stress.
    fn cycle_time_under_pressure(&self) -> Option<Duration> {
        let live = self.table.len();
        let target = self.config.main_queue_max_target_size;
        if live <= target {
            return None;
        }
        let compressed = self
            .config
            .main_queue_cache_time
            .mul_f64(target as f64 / live as f64)
            .max(self.config.main_queue_cache_time_min);
        Some(compressed)
    }

    fn effective_expiry(&self, handle: &TimedHandle<A::Key>, compressed: Option<Duration>) -> Instant {
        match compressed {
            Some(cycle) => handle.enqueued_at + cycle,
            None => handle.expiry,
        }
    }

    fn process_cycle(&self, handle: TimedHandle<A::Key>) {
        let Some(entry) = self.table.resolve(&handle.key, handle.generation) else {
            return;
        };

        let action = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => CycleAction::Drop,
                EntryState::ResyncPending | EntryState::Resyncing => {
                    // The reconciliation read has not returned within a full
                    // cycle; rolling the counter is what lets the merge step
                    // detect the late return.
                    body.cycle_count += 1;
                    CycleAction::Requeue
                }
                EntryState::ReadFailedFinal => CycleAction::Evict {
                    error: Some(CacheError::ReadFailedFinal),
                    lost: 0,
                },
                EntryState::Loaded | EntryState::ResyncFailedFinal => {
                    body.cycle_count += 1;
                    let write_allowed = body.state == EntryState::Loaded
                        || self.config.allow_data_writing_after_resync_failed_final;
                    if body.is_dirty() && write_allowed {
                        if body.pending_write.is_some() && !self.config.can_merge_writes {
                            // Re-send the failed write as-is; newer updates
                            // stay logged for the next cycle.
                            body.state = EntryState::WritePending;
                            CycleAction::Write
                        } else {
                            let previous_failed = body.pending_write.take();
                            match body.payload.take() {
                                Some(payload) => {
                                    let (keep, send) = self.adapter.split_for_write(
                                        &entry.key,
                                        payload,
                                        previous_failed,
                                    );
                                    body.payload = Some(keep);
                                    body.pending_write = Some(send);
                                    body.take_log();
                                    body.state = EntryState::WritePending;
                                    CycleAction::Write
                                }
                                None => CycleAction::Violation(
                                    "dirty entry has no payload".to_string(),
                                ),
                            }
                        }
                    } else {
                        // Every cycle reconciles against the backing store in
                        // the default policy.
                        body.state = EntryState::ResyncPending;
                        body.cycle_at_resync_start = body.cycle_count;
                        body.resync_started_at = Some(Instant::now());
                        body.resync_overdue = false;
                        body.failures.read_attempts = 0;
                        CycleAction::Resync
                    }
                }
                state => CycleAction::Violation(format!("cycle decision in state {state:?}")),
            }
        };

        match action {
            CycleAction::Drop => {}
            CycleAction::Requeue => self.enqueue_main(handle.key, handle.generation),
            CycleAction::Write => self.enqueue_write(handle.key, handle.generation),
            CycleAction::Resync => {
                self.enqueue_read(handle.key.clone(), handle.generation, true);
                self.enqueue_main(handle.key, handle.generation);
            }
            CycleAction::Evict { error, lost } => {
                let lost = lost.max(self.evict(&entry, error));
                if lost > 0 {
                    self.events.emit(CacheEvent::UpdatesLost {
                        key: self.key_str(&entry.key),
                        pending_updates: lost,
                    });
                }
            }
            CycleAction::Violation(message) => self.fail_assertion(&entry, message),
        }
    }

    /// Final sweep on shutdown: force dirty entries into the write stage so
    /// an orderly drain persists pending updates instead of dropping them
    fn main_queue_shutdown_sweep(&self, queue: &mut VecDeque<TimedHandle<A::Key>>) {
        if !self
            .drain_writes_on_shutdown
            .load(std::sync::atomic::Ordering::Acquire)
        {
            CacheMetrics::set(&self.metrics.main_queue_size, 0);
            return;
        }
        while let Some(handle) = queue.pop_front() {
            let Some(entry) = self.table.resolve(&handle.key, handle.generation) else {
                continue;
            };
            let send = {
                let mut body = entry.body.lock();
                let write_allowed = body.state == EntryState::Loaded
                    || (body.state == EntryState::ResyncFailedFinal
                        && self.config.allow_data_writing_after_resync_failed_final);
                if !write_allowed || !body.is_dirty() {
                    false
                } else if body.pending_write.is_some() && !self.config.can_merge_writes {
                    body.state = EntryState::WritePending;
                    true
                } else {
                    let previous_failed = body.pending_write.take();
                    match body.payload.take() {
                        Some(payload) => {
                            let (keep, send) =
                                self.adapter
                                    .split_for_write(&entry.key, payload, previous_failed);
                            body.payload = Some(keep);
                            body.pending_write = Some(send);
                            body.take_log();
                            body.state = EntryState::WritePending;
                            true
                        }
                        None => false,
                    }
                }
            };
            if send {
                self.enqueue_write(handle.key, handle.generation);
            }
        }
        CacheMetrics::set(&self.metrics.main_queue_size, 0);
    }
}
