//! Write stage: drains split write data to the backing store
//!
//! Symmetric to the read stage: inbound queue, optional batching, worker
//! pool or inline execution. Confirmed writes hand the entry to the return
//! queue; transient failures retry against the retained write data; final
//! failures keep the data in the pending slot so a later cycle can merge or
//! re-send it.

use std::sync::atomic::Ordering;
use std::sync::Arc;

use tokio::sync::mpsc::UnboundedReceiver;

use crate::cache::adapter::CacheAdapter;
use crate::cache::core::{CacheCore, WriteRequest};
use crate::cache::entry::{CacheEntry, EntryState};
use crate::cache::status::CacheMetrics;
use crate::events::CacheEvent;

impl<A: CacheAdapter> CacheCore<A> {
    pub(crate) async fn run_write_stage(
        self: Arc<Self>,
        mut rx: UnboundedReceiver<WriteRequest<A::Key>>,
    ) {
        loop {
            // Both timed queues force-split dirty entries into this stage
            // during a draining shutdown; stay up until they are done and no
            // worker can still re-enqueue a retry.
            let quiesced = || {
                self.main_queue_stopped.load(Ordering::Acquire)
                    && self.return_queue_stopped.load(Ordering::Acquire)
                    && self.metrics.in_flight_writes.load(Ordering::Relaxed) == 0
            };
            let batch = self
                .collect_batch(
                    &mut rx,
                    self.config.write_queue_batching_delay,
                    &self.drain_writes_on_shutdown,
                    &self.metrics.write_queue_size,
                    quiesced,
                )
                .await;
            let Some(batch) = batch else { break };
            for request in batch {
                self.clone().dispatch_write(request).await;
            }
        }
        tracing::debug!(cache = %self.config.cache_name, "write stage stopped");
    }

    async fn dispatch_write(self: Arc<Self>, request: WriteRequest<A::Key>) {
        let Some(entry) = self.table.resolve(&request.key, request.generation) else {
            return;
        };
        let write = {
            let mut body = entry.body.lock();
            match body.state {
                EntryState::RemovedFromCache => return,
                EntryState::WritePending => match body.pending_write.clone() {
                    Some(write) => {
                        body.state = EntryState::Writing;
                        Ok(write)
                    }
                    None => Err("write dispatched with empty pending slot".to_string()),
                },
                state => Err(format!("write dispatched in state {state:?}")),
            }
        };
        let write = match write {
            Ok(write) => write,
            Err(message) => {
                self.fail_assertion(&entry, message);
                return;
            }
        };

        // Counted in flight from dispatch so drain accounting never sees a
        // gap between dequeue and execution.
        CacheMetrics::incr(&self.metrics.in_flight_writes);
        let core = self.clone();
        let task = async move { core.execute_write(entry, write).await };
        self.dispatch(&self.write_pool, task).await;
    }

    async fn execute_write(self: Arc<Self>, entry: Arc<CacheEntry<A>>, write: A::StorageWrite) {
        self.execute_write_inner(entry, write).await;
        CacheMetrics::decr(&self.metrics.in_flight_writes);
    }

    async fn execute_write_inner(&self, entry: Arc<CacheEntry<A>>, write: A::StorageWrite) {
        CacheMetrics::incr(&self.metrics.writes_attempted);
        let result = self.adapter.write_to_storage(&entry.key, write).await;

        match result {
            Ok(()) => {
                let violation = {
                    let mut body = entry.body.lock();
                    match body.state {
                        EntryState::RemovedFromCache => return,
                        EntryState::Writing => {
                            body.pending_write = None;
                            body.failures.write_attempts = 0;
                            body.state = EntryState::Loaded;
                            None
                        }
                        state => Some(format!("write confirmed in state {state:?}")),
                    }
                };
                if let Some(message) = violation {
                    self.fail_assertion(&entry, message);
                    return;
                }
                CacheMetrics::incr(&self.metrics.writes_succeeded);
                // A drained write during shutdown has nothing left to
                // schedule; the entry simply stays in the table.
                if !self.is_stopping() {
                    self.enqueue_return(entry.key.clone(), entry.generation);
                }
            }
            Err(error) => {
                let key = self.key_str(&entry.key);
                let attempts = {
                    let mut body = entry.body.lock();
                    if body.state == EntryState::RemovedFromCache {
                        return;
                    }
                    body.failures.write_attempts += 1;
                    body.failures.write_attempts
                };

                // The budget counts retries beyond the first attempt.
                if error.is_transient() && attempts <= self.config.write_failure_max_retry_count {
                    {
                        let mut body = entry.body.lock();
                        body.state = EntryState::WritePending;
                    }
                    CacheMetrics::incr(&self.metrics.write_retries);
                    self.events.emit(CacheEvent::StorageWriteRetryIssued {
                        key,
                        attempt: attempts,
                    });
                    self.enqueue_write(entry.key.clone(), entry.generation);
                    return;
                }

                // Final failure: the write data stays in the pending slot so
                // the next cycle can merge or re-send it. The entry still
                // flows through the return queue for eviction bookkeeping.
                {
                    let mut body = entry.body.lock();
                    body.failures.write_attempts = 0;
                    body.failures.cycle_failures += 1;
                    body.state = EntryState::Loaded;
                }
                CacheMetrics::incr(&self.metrics.writes_failed_final);
                self.events.emit(CacheEvent::StorageWriteFailFinal { key });
                if !self.is_stopping() {
                    self.enqueue_return(entry.key.clone(), entry.generation);
                }
            }
        }
    }
}
