//! Return queue stage: post-write dwell before eviction
//!
//! Holding an entry here after its write gives racing readers time to
//! finish against the in-memory value, preventing a read-write-evict-reread
//! sawtooth against the backing store. Entries that picked up new updates
//! while their write was in flight loop back to the main queue for another
//! full cycle instead of being evicted.

use std::collections::VecDeque;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;
use tokio::time::Instant;

use crate::cache::adapter::CacheAdapter;
use crate::cache::core::{CacheCore, TimedHandle};
use crate::cache::entry::EntryState;
use crate::cache::status::CacheMetrics;
use crate::events::CacheEvent;

enum ReturnAction {
    Drop,
    /// Another full cycle; the entry is still dirty
    Requeue,
    /// Normal end of life
    Evict,
    /// Dirty entry that can no longer be carried forward
    EvictWithLoss {
        lost: usize,
    },
    Violation(String),
}

impl<A: CacheAdapter> CacheCore<A> {
    pub(crate) async fn run_return_queue(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<TimedHandle<A::Key>>,
    ) {
        let mut queue: VecDeque<TimedHandle<A::Key>> = VecDeque::new();
        loop {
            while let Ok(handle) = rx.try_recv() {
                queue.push_back(handle);
            }
            if self.is_stopping() {
                self.return_queue_shutdown_sweep(&mut queue);
                self.return_queue_stopped
                    .store(true, std::sync::atomic::Ordering::Release);
                break;
            }

            let now = Instant::now();
            while let Some(head) = queue.front() {
                if head.expiry > now {
                    break;
                }
                if let Some(handle) = queue.pop_front() {
                    self.process_return(handle);
                }
            }
            CacheMetrics::set(&self.metrics.return_queue_size, queue.len() as u64);

            let sleep_for = queue
                .front()
                .map(|head| head.expiry.saturating_duration_since(Instant::now()))
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
        tracing::debug!(cache = %self.config.cache_name, "return queue stopped");
    }

    fn process_return(&self, handle: TimedHandle<A::Key>) {
        let Some(entry) = self.table.resolve(&handle.key, handle.generation) else {
            return;
        };

        let action = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => ReturnAction::Drop,
                EntryState::Loaded => {
                    if !body.is_dirty() {
                        ReturnAction::Evict
                    } else if body.failures.cycle_failures
                        > self.config.full_cache_cycle_failure_max_retry_count
                        || body.requeue_count >= self.config.return_queue_max_requeue_count
                        || !self.config.allow_updates_collection_for_multiple_full_cycles
                    {
                        let lost = body.pending_update_count()
                            + usize::from(body.pending_write.is_some() || body.dirty);
                        ReturnAction::EvictWithLoss { lost }
                    } else {
                        body.requeue_count += 1;
                        ReturnAction::Requeue
                    }
                }
                state => ReturnAction::Violation(format!("return queue expiry in state {state:?}")),
            }
        };

        match action {
            ReturnAction::Drop => {}
            ReturnAction::Requeue => self.enqueue_main(handle.key, handle.generation),
            ReturnAction::Evict => {
                self.evict(&entry, None);
            }
            ReturnAction::EvictWithLoss { lost } => {
                self.evict(&entry, None);
                self.events.emit(CacheEvent::UpdatesLost {
                    key: self.key_str(&entry.key),
                    pending_updates: lost.max(1),
                });
            }
            ReturnAction::Violation(message) => self.fail_assertion(&entry, message),
        }
    }

    /// On a draining shutdown, dirty entries get one last write; everything
    /// else is left in the table for the embedder to discard
    fn return_queue_shutdown_sweep(&self, queue: &mut VecDeque<TimedHandle<A::Key>>) {
        if !self
            .drain_writes_on_shutdown
            .load(std::sync::atomic::Ordering::Acquire)
        {
            CacheMetrics::set(&self.metrics.return_queue_size, 0);
            return;
        }
        while let Some(handle) = queue.pop_front() {
            let Some(entry) = self.table.resolve(&handle.key, handle.generation) else {
                continue;
            };
            let send = {
                let mut body = entry.body.lock();
                if body.state != EntryState::Loaded || !body.is_dirty() {
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
        CacheMetrics::set(&self.metrics.return_queue_size, 0);
    }
}
