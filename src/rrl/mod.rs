//! Retry-and-rate-limit service: asynchronous execution of idempotent
//! request tasks
//!
//! Submissions enter a time-ordered main queue. A token bucket gates
//! dispatch, a bounded worker pool executes attempts, and transient
//! failures loop through a delay queue with computed backoff until the
//! retry budget or the per-request deadline runs out. Cancellation is a
//! best-effort flag: a request not yet dispatched is dropped from the
//! queue; an in-progress attempt is never interrupted, but no further
//! attempts follow.

use std::collections::BinaryHeap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use parking_lot::Mutex;
use serde::Serialize;
use thiserror::Error;
use tokio::sync::mpsc::{self, UnboundedReceiver, UnboundedSender};
use tokio::sync::{oneshot, Notify, Semaphore};
use tokio::task::JoinHandle;
use tokio::time::Instant;
use uuid::Uuid;

use crate::config::{ConfigError, RrlConfig};
use crate::events::{CacheEvent, EventBus, EventSeverity};

pub mod limiter;

pub use limiter::{Acquire, ControlState, RateLimiter};

/// Errors surfaced to request submitters
#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum RrlError {
    /// The per-request deadline elapsed, counting retries
    #[error("request deadline elapsed")]
    Timeout,

    /// The request was cancelled before completing
    #[error("request cancelled")]
    Cancelled,

    /// The request failed permanently or exhausted its retry budget
    #[error("request failed: {0}")]
    Failed(String),

    /// The pending-request cap was reached
    #[error("request queue is full")]
    QueueFull,

    /// The service is shut down
    #[error("service is shut down")]
    Shutdown,
}

/// Result type for request outcomes
pub type RrlResult<T> = Result<T, RrlError>;

/// Failure reported by a request processor attempt
#[derive(Error, Debug, Clone)]
pub enum RequestFailure {
    /// Recoverable failure, eligible for another attempt
    #[error("transient request failure: {0}")]
    Transient(String),

    /// Unrecoverable failure, retrying is pointless
    #[error("permanent request failure: {0}")]
    Permanent(String),
}

impl RequestFailure {
    /// Whether another attempt may be made
    pub fn is_transient(&self) -> bool {
        matches!(self, RequestFailure::Transient(_))
    }
}

/// User-supplied request execution port
///
/// `process_request` receives the attempt number starting at 1 and must be
/// idempotent: a transient failure re-invokes it after backoff.
#[async_trait]
pub trait RequestProcessor: Send + Sync + 'static {
    /// Request input shape
    type Input: Send + Sync + 'static;
    /// Request output shape
    type Output: Send + 'static;

    /// Execute one attempt
    async fn process_request(
        &self,
        input: &Self::Input,
        attempt: u32,
    ) -> Result<Self::Output, RequestFailure>;
}

/// Caller-side handle to a submitted request
pub struct RequestHandle<O> {
    id: Uuid,
    cancelled: Arc<AtomicBool>,
    receiver: oneshot::Receiver<RrlResult<O>>,
}

impl<O> RequestHandle<O> {
    /// Request identifier
    pub fn id(&self) -> Uuid {
        self.id
    }

    /// Flag the request for cancellation
    ///
    /// Best effort: observed before dispatch and between attempts, never
    /// mid-attempt.
    pub fn cancel(&self) {
        self.cancelled.store(true, Ordering::Release);
    }

    /// Wait for the request outcome
    pub async fn outcome(self) -> RrlResult<O> {
        self.receiver.await.unwrap_or(Err(RrlError::Shutdown))
    }
}

impl<O> std::fmt::Debug for RequestHandle<O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("RequestHandle").field("id", &self.id).finish()
    }
}

/// Point-in-time view of service health
#[derive(Debug, Clone, Serialize)]
pub struct RrlStatus {
    /// Service identifier
    pub service_name: String,
    /// Requests waiting in the main queue
    pub queue_depth: u64,
    /// Requests waiting in the retry delay queue
    pub delayed: u64,
    /// Attempts currently executing
    pub in_flight: u64,
    /// Requests accepted since startup
    pub submitted: u64,
    /// Requests completed successfully
    pub completed: u64,
    /// Requests failed permanently
    pub failed: u64,
    /// Requests that hit their deadline
    pub timed_out: u64,
    /// Requests cancelled
    pub cancelled: u64,
    /// Retry attempts issued
    pub retries: u64,
    /// Limiter control state
    pub rate: ControlState,
}

#[derive(Debug, Default)]
struct RrlMetrics {
    submitted: AtomicU64,
    completed: AtomicU64,
    failed: AtomicU64,
    timed_out: AtomicU64,
    cancelled: AtomicU64,
    retries: AtomicU64,
    queue_depth: AtomicU64,
    delayed: AtomicU64,
    in_flight: AtomicU64,
}

struct PendingRequest<P: RequestProcessor> {
    id: Uuid,
    input: Arc<P::Input>,
    attempt: u32,
    deadline: Instant,
    cancelled: Arc<AtomicBool>,
    done: oneshot::Sender<RrlResult<P::Output>>,
}

struct DelayedRequest<P: RequestProcessor> {
    wake_at: Instant,
    seq: u64,
    request: PendingRequest<P>,
}

impl<P: RequestProcessor> PartialEq for DelayedRequest<P> {
    fn eq(&self, other: &Self) -> bool {
        self.wake_at == other.wake_at && self.seq == other.seq
    }
}

impl<P: RequestProcessor> Eq for DelayedRequest<P> {}

impl<P: RequestProcessor> PartialOrd for DelayedRequest<P> {
    fn partial_cmp(&self, other: &Self) -> Option<std::cmp::Ordering> {
        Some(self.cmp(other))
    }
}

impl<P: RequestProcessor> Ord for DelayedRequest<P> {
    // Reversed so the binary heap pops the earliest wake-up first.
    fn cmp(&self, other: &Self) -> std::cmp::Ordering {
        other
            .wake_at
            .cmp(&self.wake_at)
            .then_with(|| other.seq.cmp(&self.seq))
    }
}

enum TokenWait {
    Granted,
    Cancelled,
    TimedOut,
    Stopped,
}

struct RrlInner<P: RequestProcessor> {
    config: RrlConfig,
    processor: P,
    limiter: RateLimiter,
    events: EventBus,
    metrics: RrlMetrics,
    submit_tx: UnboundedSender<PendingRequest<P>>,
    delay_tx: UnboundedSender<(Instant, PendingRequest<P>)>,
    workers: Arc<Semaphore>,
    stop: AtomicBool,
    shutdown_notify: Notify,
}

impl<P: RequestProcessor> RrlInner<P> {
    fn is_stopping(&self) -> bool {
        self.stop.load(Ordering::Acquire)
    }

    fn complete(&self, request: PendingRequest<P>, result: RrlResult<P::Output>) {
        match &result {
            Ok(_) => self.metrics.completed.fetch_add(1, Ordering::Relaxed),
            Err(RrlError::Timeout) => self.metrics.timed_out.fetch_add(1, Ordering::Relaxed),
            Err(RrlError::Cancelled) => self.metrics.cancelled.fetch_add(1, Ordering::Relaxed),
            Err(_) => self.metrics.failed.fetch_add(1, Ordering::Relaxed),
        };
        if let Err(RrlError::Failed(message)) = &result {
            self.events.emit(CacheEvent::NonStandard {
                classifier: "request_failed_final".to_string(),
                severity: EventSeverity::ExternalError,
                message: format!("request {} failed: {message}", request.id),
            });
        }
        let _ = request.done.send(result);
    }

    /// Put a request (back) onto the main queue
    fn enqueue(&self, request: PendingRequest<P>) {
        self.metrics.queue_depth.fetch_add(1, Ordering::Relaxed);
        if let Err(send_error) = self.submit_tx.send(request) {
            self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.complete(send_error.0, Err(RrlError::Shutdown));
        }
    }

    async fn run_main(self: Arc<Self>, mut rx: UnboundedReceiver<PendingRequest<P>>) {
        loop {
            let request = match self.next_request(&mut rx).await {
                Some(request) => request,
                None => break,
            };

            if request.cancelled.load(Ordering::Acquire) {
                self.complete(request, Err(RrlError::Cancelled));
                continue;
            }
            if Instant::now() >= request.deadline {
                self.complete(request, Err(RrlError::Timeout));
                continue;
            }

            // One token per attempt; waiting here preserves submission order.
            match self.wait_for_token(&request).await {
                TokenWait::Granted => {}
                TokenWait::Cancelled => {
                    self.complete(request, Err(RrlError::Cancelled));
                    continue;
                }
                TokenWait::TimedOut => {
                    self.complete(request, Err(RrlError::Timeout));
                    continue;
                }
                TokenWait::Stopped => {
                    self.complete(request, Err(RrlError::Shutdown));
                    continue;
                }
            }

            let permit = match self.workers.clone().acquire_owned().await {
                Ok(permit) => permit,
                Err(_) => {
                    self.complete(request, Err(RrlError::Shutdown));
                    continue;
                }
            };
            self.metrics.in_flight.fetch_add(1, Ordering::Relaxed);
            let inner = self.clone();
            tokio::spawn(async move {
                inner.execute_attempt(request).await;
                inner.metrics.in_flight.fetch_sub(1, Ordering::Relaxed);
                drop(permit);
            });
        }

        while let Ok(request) = rx.try_recv() {
            self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
            self.complete(request, Err(RrlError::Shutdown));
        }
        tracing::debug!(service = %self.config.service_name, "request processor stopped");
    }

    async fn next_request(
        &self,
        rx: &mut UnboundedReceiver<PendingRequest<P>>,
    ) -> Option<PendingRequest<P>> {
        loop {
            if self.is_stopping() {
                return None;
            }
            tokio::select! {
                request = rx.recv() => {
                    if request.is_some() {
                        self.metrics.queue_depth.fetch_sub(1, Ordering::Relaxed);
                    }
                    return request;
                }
                _ = tokio::time::sleep(self.config.max_sleep_time) => {}
                _ = self.shutdown_notify.notified() => {}
            }
        }
    }

    async fn wait_for_token(&self, request: &PendingRequest<P>) -> TokenWait {
        loop {
            if self.is_stopping() {
                return TokenWait::Stopped;
            }
            if request.cancelled.load(Ordering::Acquire) {
                return TokenWait::Cancelled;
            }
            if Instant::now() >= request.deadline {
                return TokenWait::TimedOut;
            }
            match self.limiter.try_acquire(1) {
                Acquire::Granted { .. } => return TokenWait::Granted,
                Acquire::Wait(wait) => {
                    tokio::time::sleep(wait.min(self.config.max_sleep_time)).await;
                }
            }
        }
    }

    async fn execute_attempt(&self, mut request: PendingRequest<P>) {
        request.attempt += 1;
        let remaining = request.deadline.saturating_duration_since(Instant::now());
        if remaining.is_zero() {
            self.complete(request, Err(RrlError::Timeout));
            return;
        }

        let attempt = request.attempt;
        let result = tokio::time::timeout(
            remaining,
            self.processor.process_request(&request.input, attempt),
        )
        .await;

        match result {
            Ok(Ok(output)) => self.complete(request, Ok(output)),
            Ok(Err(failure)) => {
                if request.cancelled.load(Ordering::Acquire) {
                    self.complete(request, Err(RrlError::Cancelled));
                    return;
                }
                if failure.is_transient() && attempt < self.config.max_attempts {
                    let backoff = self.backoff_for(attempt);
                    let wake_at = Instant::now() + backoff;
                    if wake_at >= request.deadline {
                        self.complete(request, Err(RrlError::Timeout));
                        return;
                    }
                    self.metrics.retries.fetch_add(1, Ordering::Relaxed);
                    self.events.emit(CacheEvent::NonStandard {
                        classifier: "request_retry_issued".to_string(),
                        severity: EventSeverity::ExternalInfo,
                        message: format!(
                            "request {} retrying after attempt {attempt}",
                            request.id
                        ),
                    });
                    self.metrics.delayed.fetch_add(1, Ordering::Relaxed);
                    if let Err(send_error) = self.delay_tx.send((wake_at, request)) {
                        self.metrics.delayed.fetch_sub(1, Ordering::Relaxed);
                        self.complete(send_error.0 .1, Err(RrlError::Shutdown));
                    }
                } else {
                    self.complete(request, Err(RrlError::Failed(failure.to_string())));
                }
            }
            Err(_) => self.complete(request, Err(RrlError::Timeout)),
        }
    }

    /// Exponential backoff with a random jitter fraction
    fn backoff_for(&self, attempt: u32) -> Duration {
        let exponent = attempt.saturating_sub(1).min(16);
        let base = self
            .config
            .retry_backoff_base
            .mul_f64(self.config.retry_backoff_multiplier.powi(exponent as i32));
        let jitter = 1.0 + self.config.retry_backoff_jitter * rand::random::<f64>();
        base.mul_f64(jitter)
    }

    async fn run_delay(self: Arc<Self>, mut rx: UnboundedReceiver<(Instant, PendingRequest<P>)>) {
        let mut heap: BinaryHeap<DelayedRequest<P>> = BinaryHeap::new();
        let mut seq = 0u64;
        loop {
            while let Ok((wake_at, request)) = rx.try_recv() {
                heap.push(DelayedRequest { wake_at, seq, request });
                seq += 1;
            }
            if self.is_stopping() {
                break;
            }

            let now = Instant::now();
            while heap.peek().map(|d| d.wake_at <= now).unwrap_or(false) {
                if let Some(delayed) = heap.pop() {
                    self.metrics.delayed.fetch_sub(1, Ordering::Relaxed);
                    self.enqueue(delayed.request);
                }
            }

            let sleep_for = heap
                .peek()
                .map(|d| d.wake_at.saturating_duration_since(now))
                .unwrap_or(self.config.max_sleep_time)
                .min(self.config.max_sleep_time);
            tokio::select! {
                _ = tokio::time::sleep(sleep_for) => {}
                item = rx.recv() => {
                    if let Some((wake_at, request)) = item {
                        heap.push(DelayedRequest { wake_at, seq, request });
                        seq += 1;
                    }
                }
                _ = self.shutdown_notify.notified() => {}
            }
        }

        for delayed in heap.into_iter() {
            self.metrics.delayed.fetch_sub(1, Ordering::Relaxed);
            self.complete(delayed.request, Err(RrlError::Shutdown));
        }
        while let Ok((_, request)) = rx.try_recv() {
            self.metrics.delayed.fetch_sub(1, Ordering::Relaxed);
            self.complete(request, Err(RrlError::Shutdown));
        }
        tracing::debug!(service = %self.config.service_name, "delay queue stopped");
    }
}

struct RrlReceivers<P: RequestProcessor> {
    submit_rx: UnboundedReceiver<PendingRequest<P>>,
    delay_rx: UnboundedReceiver<(Instant, PendingRequest<P>)>,
}

/// Rate-limited, retried asynchronous request executor
pub struct RrlService<P: RequestProcessor> {
    inner: Arc<RrlInner<P>>,
    receivers: Mutex<Option<RrlReceivers<P>>>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
}

impl<P: RequestProcessor> RrlService<P> {
    /// Create a service from a validated configuration and a processor
    pub fn new(config: RrlConfig, processor: P) -> Result<Self, ConfigError> {
        config.validate()?;
        let (submit_tx, submit_rx) = mpsc::unbounded_channel();
        let (delay_tx, delay_rx) = mpsc::unbounded_channel();
        let events = EventBus::new(
            config.service_name.clone(),
            config.log_throttle_time_interval,
            config.log_throttle_max_messages_of_type_per_time_interval,
            false,
        );
        let inner = Arc::new(RrlInner {
            limiter: RateLimiter::new(
                config.rate_limit_capacity,
                config.rate_limit_refill_per_sec,
            ),
            workers: Arc::new(Semaphore::new(config.max_concurrency)),
            events,
            metrics: RrlMetrics::default(),
            config,
            processor,
            submit_tx,
            delay_tx,
            stop: AtomicBool::new(false),
            shutdown_notify: Notify::new(),
        });
        Ok(Self {
            inner,
            receivers: Mutex::new(Some(RrlReceivers { submit_rx, delay_rx })),
            tasks: Mutex::new(Vec::new()),
        })
    }

    /// Spawn the queue and delay processors
    pub fn start(&self) -> RrlResult<()> {
        let Some(receivers) = self.receivers.lock().take() else {
            return Err(RrlError::Failed("service already started".to_string()));
        };
        let mut tasks = self.tasks.lock();
        tasks.push(tokio::spawn(
            self.inner.clone().run_main(receivers.submit_rx),
        ));
        tasks.push(tokio::spawn(
            self.inner.clone().run_delay(receivers.delay_rx),
        ));
        Ok(())
    }

    /// Submit a request with the configured default deadline
    pub fn submit(&self, input: P::Input) -> RrlResult<RequestHandle<P::Output>> {
        self.submit_for(input, self.inner.config.default_timeout)
    }

    /// Submit a request that must complete within `total_timeout`,
    /// retries included
    pub fn submit_for(
        &self,
        input: P::Input,
        total_timeout: Duration,
    ) -> RrlResult<RequestHandle<P::Output>> {
        let inner = &self.inner;
        if inner.is_stopping() {
            return Err(RrlError::Shutdown);
        }
        let backlog = inner.metrics.queue_depth.load(Ordering::Relaxed)
            + inner.metrics.delayed.load(Ordering::Relaxed);
        if backlog >= inner.config.max_pending_requests as u64 {
            return Err(RrlError::QueueFull);
        }

        let (done, receiver) = oneshot::channel();
        let cancelled = Arc::new(AtomicBool::new(false));
        let id = Uuid::new_v4();
        let request = PendingRequest {
            id,
            input: Arc::new(input),
            attempt: 0,
            deadline: Instant::now() + total_timeout,
            cancelled: cancelled.clone(),
            done,
        };
        inner.metrics.submitted.fetch_add(1, Ordering::Relaxed);
        inner.enqueue(request);
        Ok(RequestHandle {
            id,
            cancelled,
            receiver,
        })
    }

    /// Replace the rate limit at runtime
    pub fn set_rate(&self, capacity: u64, refill_per_sec: f64) {
        self.inner.limiter.set_rate(capacity, refill_per_sec);
    }

    /// Current service status
    pub fn status(&self) -> RrlStatus {
        let load = |c: &AtomicU64| c.load(Ordering::Relaxed);
        let m = &self.inner.metrics;
        RrlStatus {
            service_name: self.inner.config.service_name.clone(),
            queue_depth: load(&m.queue_depth),
            delayed: load(&m.delayed),
            in_flight: load(&m.in_flight),
            submitted: load(&m.submitted),
            completed: load(&m.completed),
            failed: load(&m.failed),
            timed_out: load(&m.timed_out),
            cancelled: load(&m.cancelled),
            retries: load(&m.retries),
            rate: self.inner.limiter.control_state(),
        }
    }

    /// Stop the processors, failing queued requests with
    /// [`RrlError::Shutdown`]
    ///
    /// Returns the number of requests still queued or executing at the
    /// deadline.
    pub async fn shutdown_for(&self, timeout: Duration) -> u64 {
        let inner = &self.inner;
        inner.stop.store(true, Ordering::Release);
        inner.shutdown_notify.notify_waiters();

        let deadline = Instant::now() + timeout;
        let tasks: Vec<JoinHandle<()>> = std::mem::take(&mut *self.tasks.lock());
        let _ = tokio::time::timeout_at(deadline, futures::future::join_all(tasks)).await;
        loop {
            let m = &self.inner.metrics;
            let remaining_work = m.queue_depth.load(Ordering::Relaxed)
                + m.delayed.load(Ordering::Relaxed)
                + m.in_flight.load(Ordering::Relaxed);
            let remaining_time = deadline.saturating_duration_since(Instant::now());
            if remaining_work == 0 || remaining_time.is_zero() {
                return remaining_work;
            }
            tokio::time::sleep(inner.config.max_sleep_time.min(remaining_time)).await;
        }
    }
}
